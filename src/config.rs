use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};
use tracing::warn;
use worldcomms_net::ConnectionConfig;

const DEFAULT_CONFIG_PATH: &str = "config/worldcomms.toml";

/// Simulation parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of simulated peers.
    pub peers: usize,
    /// Ticks to run before writing the report.
    pub ticks: u64,
    pub tick_interval_ms: u64,
    /// Largest per-tick step along X and Z, in world units.
    pub walk_step: f32,
    /// Peers start uniformly within this distance of the origin.
    pub spawn_radius: f32,
    /// Each peer chats once every this many ticks. Zero disables chat.
    pub chat_every: u64,
    /// Scene every peer pins and messages once.
    pub scene_id: String,
    /// Fixed RNG seed for reproducible walks.
    pub seed: Option<u64>,
    pub report_path: PathBuf,
    pub connection: ConnectionConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            peers: 4,
            ticks: 200,
            tick_interval_ms: 50,
            walk_step: 6.0,
            spawn_radius: 48.0,
            chat_every: 40,
            scene_id: "scene-0".to_owned(),
            seed: None,
            report_path: PathBuf::from("target/worldcomms-report.json"),
            connection: ConnectionConfig {
                ping_interval_ms: 1_000,
                ..ConnectionConfig::default()
            },
        }
    }
}

impl SimConfig {
    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<SimConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    SimConfig::default()
                }
            },
            Err(err) => {
                if path != Path::new(DEFAULT_CONFIG_PATH)
                    || err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                } else {
                    warn!(
                        "Simulation config not found at {}. Using defaults",
                        path.display()
                    );
                }
                SimConfig::default()
            }
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: SimConfig = toml::from_str(
            r#"
            peers = 9
            seed = 7

            [connection]
            ping_interval_ms = 250

            [connection.grid]
            neighbor_radius = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.peers, 9);
        assert_eq!(cfg.seed, Some(7));
        assert_eq!(cfg.ticks, SimConfig::default().ticks);
        assert_eq!(cfg.connection.ping_interval_ms, 250);
        assert_eq!(cfg.connection.grid.neighbor_radius, 2);
        assert_eq!(cfg.connection.grid.parcel_size, 16.0);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = SimConfig::load_from_path(Path::new("/nonexistent/worldcomms.toml"));
        assert_eq!(cfg, SimConfig::default());
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("worldcomms-bad-{}.toml", std::process::id()));
        fs::write(&path, "peers = \"many\"").unwrap();
        assert_eq!(SimConfig::load_from_path(&path), SimConfig::default());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let cfg = SimConfig {
            tick_interval_ms: 0,
            ..SimConfig::default()
        };
        assert_eq!(cfg.tick_interval(), Duration::from_millis(1));
    }
}
