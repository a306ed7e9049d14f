//! CLI - Command-line argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default daemon address
pub const DEFAULT_URL: &str = "http://127.0.0.1:7870";

/// SensorHub control CLI
#[derive(Parser)]
#[command(name = "sensorhubctl")]
#[command(about = "SensorHub control - inspect the daemon and manage device credentials", long_about = None)]
#[command(version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Daemon base URL
    #[arg(long, global = true, env = "SENSORHUB_URL", default_value = DEFAULT_URL)]
    pub url: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show upstream limiter and circuit breaker state
    Status {
        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// Show pipeline statistics (upstream, jobs, connections)
    Stats {
        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// Encrypt a device API key for the config file
    Encrypt {
        plaintext: String,

        /// Environment variable holding the hex AES-256 key
        #[arg(long, default_value = "SENSORHUB_SECRET_KEY")]
        key_env: String,
    },

    /// Validate a config file and print a summary
    CheckConfig { path: PathBuf },
}
