//! Latency probing.
//!
//! A background task periodically emits PING frames stamped with the local clock on
//! the unreliable channel. The relay echoes them back and the connection turns the
//! echo into a round-trip estimate stored in a [`LatencyProbe`].

use crate::channel::Channels;
use crate::codec::encode_ping;
use crate::stats::{TrafficBucket, TrafficStats};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{trace, warn};
use worldcomms_core::now_millis;

const UNKNOWN: u64 = u64::MAX;

/// Shortest accepted probe period.
pub const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(1);

/// Current round-trip estimate. Updated with plain last-write-wins stores.
#[derive(Debug)]
pub struct LatencyProbe {
    estimate_millis: AtomicU64,
}

impl Default for LatencyProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyProbe {
    /// Probe with no estimate yet.
    pub fn new() -> Self {
        Self {
            estimate_millis: AtomicU64::new(UNKNOWN),
        }
    }

    /// Store `now - sent_at` as the estimate and return it. Clock skew that would
    /// make the value negative clamps to zero.
    pub fn record(&self, sent_at_millis: u64, now_millis: u64) -> u64 {
        let rtt = now_millis.saturating_sub(sent_at_millis).min(UNKNOWN - 1);
        self.estimate_millis.store(rtt, Ordering::Relaxed);
        rtt
    }

    /// Forget the estimate.
    pub fn reset(&self) {
        self.estimate_millis.store(UNKNOWN, Ordering::Relaxed);
    }

    /// Estimate in milliseconds, `None` when unknown.
    pub fn current_millis(&self) -> Option<u64> {
        match self.estimate_millis.load(Ordering::Relaxed) {
            UNKNOWN => None,
            millis => Some(millis),
        }
    }

    /// Estimate as a duration, `None` when unknown.
    pub fn current(&self) -> Option<Duration> {
        self.current_millis().map(Duration::from_millis)
    }
}

/// Emit a single probe stamped with `now`.
///
/// Without an unreliable channel there is nothing to measure, so the estimate is
/// reset instead of being left stale.
pub fn emit_probe(
    channels: &dyn Channels,
    probe: &LatencyProbe,
    stats: Option<&dyn TrafficStats>,
    now: u64,
) {
    if !channels.has_unreliable_channel() {
        probe.reset();
        return;
    }
    let frame = encode_ping(now);
    match channels.send_unreliable(&frame) {
        Ok(()) => {
            trace!(bytes = frame.len(), "sent latency probe");
            if let Some(stats) = stats {
                stats.increment_sent(TrafficBucket::Ping, 1, frame.len());
            }
        }
        Err(err) => warn!("Failed to send latency probe: {err}"),
    }
}

/// Spawn the recurring probe task on the current tokio runtime.
///
/// The first probe goes out one `period` after spawning. Abort the returned handle
/// to stop probing.
pub fn spawn_probe(
    channels: Arc<dyn Channels>,
    probe: Arc<LatencyProbe>,
    stats: Option<Arc<dyn TrafficStats>>,
    period: Duration,
) -> JoinHandle<()> {
    let period = period.max(MIN_PROBE_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            emit_probe(channels.as_ref(), &probe, stats.as_deref(), now_millis());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_ping;
    use crate::stats::TrafficCounters;
    use crate::testing::MockChannels;

    #[test]
    fn probe_starts_unknown() {
        let probe = LatencyProbe::new();
        assert_eq!(probe.current(), None);
    }

    #[test]
    fn record_and_reset() {
        let probe = LatencyProbe::new();
        assert_eq!(probe.record(1_000, 1_045), 45);
        assert_eq!(probe.current(), Some(Duration::from_millis(45)));
        probe.reset();
        assert_eq!(probe.current_millis(), None);
    }

    #[test]
    fn clock_skew_clamps_to_zero() {
        let probe = LatencyProbe::new();
        assert_eq!(probe.record(2_000, 1_000), 0);
        assert_eq!(probe.current_millis(), Some(0));
    }

    #[test]
    fn emit_sends_ping_on_unreliable_channel() {
        let channels = MockChannels::both();
        let probe = LatencyProbe::new();
        let counters = TrafficCounters::new();
        emit_probe(&channels, &probe, Some(&counters), 1234);

        let sent = channels.unreliable_writes();
        assert_eq!(sent.len(), 1);
        assert_eq!(decode_ping(&sent[0]).unwrap(), 1234);
        assert!(channels.reliable_writes().is_empty());
        assert_eq!(counters.snapshot().ping.sent_count, 1);
    }

    #[test]
    fn emit_without_unreliable_channel_resets_estimate() {
        let channels = MockChannels::reliable_only();
        let probe = LatencyProbe::new();
        probe.record(0, 30);
        emit_probe(&channels, &probe, None, 1234);
        assert_eq!(probe.current(), None);
        assert!(channels.unreliable_writes().is_empty());
        assert!(channels.reliable_writes().is_empty());
    }

    #[tokio::test]
    async fn spawned_probe_ticks_until_aborted() {
        let channels = Arc::new(MockChannels::both());
        let probe = Arc::new(LatencyProbe::new());
        let handle = spawn_probe(
            channels.clone(),
            probe,
            None,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(55)).await;
        handle.abort();
        let _ = handle.await;
        let sent = channels.unreliable_writes().len();
        assert!(sent >= 2, "expected several probes, got {sent}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(channels.unreliable_writes().len(), sent);
    }
}
