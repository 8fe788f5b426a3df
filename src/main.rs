//! worldcomms - spatial state sync for shared virtual worlds
//!
//! Simulator executable: random-walking peers exchange positions, profiles and chat
//! through an in-process broker, then a traffic report is written.

mod config;
mod sim;

use anyhow::Result;
use config::SimConfig;
use std::{env, path::PathBuf};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with INFO level by default (can be overridden via RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting worldcomms v{}", env!("CARGO_PKG_VERSION"));

    let cli = CliOptions::parse(env::args().skip(1));
    let mut config = match &cli.config_path {
        Some(path) => SimConfig::load_from_path(path),
        None => SimConfig::load(),
    };
    cli.apply(&mut config);

    let report = sim::run(&config).await?;
    report.write_to(&config.report_path)?;
    info!(path = %config.report_path.display(), "Traffic report written");
    Ok(())
}

#[derive(Debug, Default, PartialEq)]
struct CliOptions {
    config_path: Option<PathBuf>,
    report_path: Option<PathBuf>,
    peers: Option<usize>,
    ticks: Option<u64>,
    seed: Option<u64>,
}

impl CliOptions {
    fn parse<I: Iterator<Item = String>>(mut args: I) -> Self {
        let mut opts = CliOptions::default();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    if let Some(path) = args.next() {
                        opts.config_path = Some(PathBuf::from(path));
                    } else {
                        tracing::error!("--config requires a file path");
                    }
                }
                "--report" => {
                    if let Some(path) = args.next() {
                        opts.report_path = Some(PathBuf::from(path));
                    } else {
                        tracing::error!("--report requires a file path");
                    }
                }
                "--peers" => opts.peers = parse_number(&mut args, "--peers"),
                "--ticks" => opts.ticks = parse_number(&mut args, "--ticks"),
                "--seed" => opts.seed = parse_number(&mut args, "--seed"),
                other => tracing::warn!(arg = other, "Ignoring unknown argument"),
            }
        }

        opts
    }

    fn apply(&self, config: &mut SimConfig) {
        if let Some(path) = &self.report_path {
            config.report_path = path.clone();
        }
        if let Some(peers) = self.peers {
            config.peers = peers;
        }
        if let Some(ticks) = self.ticks {
            config.ticks = ticks;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
    }
}

fn parse_number<T, I>(args: &mut I, flag: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    I: Iterator<Item = String>,
{
    let Some(raw) = args.next() else {
        tracing::error!("{flag} requires an integer");
        return None;
    };
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::error!(%err, value = %raw, "{flag} must be an integer");
            None
        }
    }
}
