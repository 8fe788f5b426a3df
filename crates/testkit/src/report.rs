//! Traffic report written at the end of a simulation run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use worldcomms_net::TrafficSnapshot;

/// Summary of one run, exported as pretty JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficReport {
    /// Run identifier
    pub run_name: String,

    /// When the report was produced (RFC 3339)
    pub timestamp: String,

    /// Simulated ticks
    pub ticks: u64,

    /// Per-peer results, ordered by alias
    pub peers: Vec<PeerTraffic>,
}

/// One peer's latency and counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerTraffic {
    /// Broker-assigned alias
    pub alias: String,

    /// Last round-trip estimate, if any probe returned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    /// Subscription updates sent
    pub subscription_updates: u64,

    /// Payloads handed to handlers
    pub delivered: u64,

    /// Traffic totals per bucket
    pub traffic: TrafficSnapshot,
}

impl TrafficReport {
    /// Empty report stamped with the current time.
    pub fn new(run_name: impl Into<String>, ticks: u64) -> Self {
        Self {
            run_name: run_name.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            ticks,
            peers: Vec::new(),
        }
    }

    /// Total messages sent across all peers and buckets.
    pub fn total_sent(&self) -> u64 {
        self.peers
            .iter()
            .map(|peer| {
                let t = &peer.traffic;
                [
                    t.position, t.profile, t.chat, t.scene_message, t.topic, t.ping, t.others,
                ]
                .iter()
                .map(|bucket| bucket.sent_count)
                .sum::<u64>()
            })
            .sum()
    }

    /// Persist as pretty JSON, creating parent directories if needed.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}
