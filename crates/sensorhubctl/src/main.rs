//! SensorHub control CLI

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status { json } => commands::status(&cli.url, json).await,
        Commands::Stats { json } => commands::stats(&cli.url, json).await,
        Commands::Encrypt { plaintext, key_env } => commands::encrypt(&plaintext, &key_env),
        Commands::CheckConfig { path } => commands::check_config(&path),
    }
}
