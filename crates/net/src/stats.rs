//! Per-category traffic accounting.
//!
//! The connection reports every inbound and outbound event exactly once through
//! [`TrafficStats`]. Storage is up to the implementation; [`TrafficCounters`] is
//! the lock-free default used by the simulator and tests.

use crate::codec::Category;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Accounting bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficBucket {
    /// Position payloads.
    Position,
    /// Profile payloads.
    Profile,
    /// Chat payloads.
    Chat,
    /// Scene messages.
    SceneMessage,
    /// Topic-level frames, regardless of category.
    Topic,
    /// Latency probes.
    Ping,
    /// Anything unrecognised.
    Others,
}

impl TrafficBucket {
    /// Every bucket, in report order.
    pub const ALL: [TrafficBucket; 7] = [
        TrafficBucket::Position,
        TrafficBucket::Profile,
        TrafficBucket::Chat,
        TrafficBucket::SceneMessage,
        TrafficBucket::Topic,
        TrafficBucket::Ping,
        TrafficBucket::Others,
    ];

    /// Bucket a payload category is accounted under.
    pub fn for_category(category: Category) -> Self {
        match category {
            Category::Position => TrafficBucket::Position,
            Category::Profile => TrafficBucket::Profile,
            Category::Chat => TrafficBucket::Chat,
            Category::SceneMessage => TrafficBucket::SceneMessage,
            Category::Unknown => TrafficBucket::Others,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Sink for traffic accounting.
pub trait TrafficStats: Send + Sync {
    /// `count` messages totalling `bytes` were handed to a channel.
    fn increment_sent(&self, bucket: TrafficBucket, count: u64, bytes: usize);

    /// One frame of `bytes` was received.
    fn increment_recv(&self, bucket: TrafficBucket, bytes: usize);
}

/// Totals for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketTotals {
    /// Messages sent.
    pub sent_count: u64,
    /// Bytes sent.
    pub sent_bytes: u64,
    /// Frames received.
    pub recv_count: u64,
    /// Bytes received.
    pub recv_bytes: u64,
}

/// Point-in-time copy of a [`TrafficCounters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    /// Position payloads.
    pub position: BucketTotals,
    /// Profile payloads.
    pub profile: BucketTotals,
    /// Chat payloads.
    pub chat: BucketTotals,
    /// Scene messages.
    pub scene_message: BucketTotals,
    /// Topic frames.
    pub topic: BucketTotals,
    /// Latency probes.
    pub ping: BucketTotals,
    /// Unrecognised traffic.
    pub others: BucketTotals,
}

impl TrafficSnapshot {
    /// Totals for `bucket`.
    pub fn bucket(&self, bucket: TrafficBucket) -> BucketTotals {
        match bucket {
            TrafficBucket::Position => self.position,
            TrafficBucket::Profile => self.profile,
            TrafficBucket::Chat => self.chat,
            TrafficBucket::SceneMessage => self.scene_message,
            TrafficBucket::Topic => self.topic,
            TrafficBucket::Ping => self.ping,
            TrafficBucket::Others => self.others,
        }
    }
}

#[derive(Default)]
struct Counter {
    sent_count: AtomicU64,
    sent_bytes: AtomicU64,
    recv_count: AtomicU64,
    recv_bytes: AtomicU64,
}

impl Counter {
    fn totals(&self) -> BucketTotals {
        BucketTotals {
            sent_count: self.sent_count.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            recv_count: self.recv_count.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Atomic counters for every bucket.
#[derive(Default)]
pub struct TrafficCounters {
    buckets: [Counter; 7],
}

impl TrafficCounters {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the current totals.
    pub fn snapshot(&self) -> TrafficSnapshot {
        let totals = |bucket: TrafficBucket| self.buckets[bucket.index()].totals();
        TrafficSnapshot {
            position: totals(TrafficBucket::Position),
            profile: totals(TrafficBucket::Profile),
            chat: totals(TrafficBucket::Chat),
            scene_message: totals(TrafficBucket::SceneMessage),
            topic: totals(TrafficBucket::Topic),
            ping: totals(TrafficBucket::Ping),
            others: totals(TrafficBucket::Others),
        }
    }
}

impl TrafficStats for TrafficCounters {
    fn increment_sent(&self, bucket: TrafficBucket, count: u64, bytes: usize) {
        let counter = &self.buckets[bucket.index()];
        counter.sent_count.fetch_add(count, Ordering::Relaxed);
        counter.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn increment_recv(&self, bucket: TrafficBucket, bytes: usize) {
        let counter = &self.buckets[bucket.index()];
        counter.recv_count.fetch_add(1, Ordering::Relaxed);
        counter.recv_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}
