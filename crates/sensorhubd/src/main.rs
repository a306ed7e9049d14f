//! SensorHub Daemon - telemetry ingestion and real-time fan-out

use anyhow::Result;
use clap::Parser;
use sensorhub_common::HubConfig;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "sensorhubd")]
#[command(about = "SensorHub daemon - polls sensor telemetry and pushes it to dashboards", long_about = None)]
#[command(version)]
struct Args {
    /// Config file (overrides $SENSORHUB_CONFIG and /etc/sensorhub/config.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("SensorHub daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match args.config {
        Some(path) => HubConfig::load_from(&path)?,
        None => HubConfig::load()?,
    };

    sensorhubd::daemon::run(config).await
}
