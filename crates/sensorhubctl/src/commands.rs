//! Command implementations for sensorhubctl

use anyhow::{bail, Context, Result};
use owo_colors::OwoColorize;
use sensorhub_common::{AesGcmSecretStore, HubConfig, PipelineStats, UpstreamHealth};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;

async fn get_json<T: DeserializeOwned>(base_url: &str, path: &str) -> Result<T> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), path);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("Failed to build HTTP client")?;

    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach daemon at {}", base_url))?;

    if !response.status().is_success() {
        bail!("Daemon returned {} for {}", response.status(), path);
    }
    response
        .json()
        .await
        .with_context(|| format!("Invalid response from {}", path))
}

pub async fn status(base_url: &str, json: bool) -> Result<()> {
    let health: UpstreamHealth = get_json(base_url, "/api/status").await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
    } else {
        print_upstream(&health);
    }
    Ok(())
}

pub async fn stats(base_url: &str, json: bool) -> Result<()> {
    let stats: PipelineStats = get_json(base_url, "/api/stats").await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    print_upstream(&stats.upstream);
    println!();

    println!("{}", "[JOBS]".bold());
    println!("  writes processed   {}", stats.jobs.writes_processed);
    println!("  writes failed      {}", paint_count(stats.jobs.writes_failed));
    println!("  broadcasts sent    {}", stats.jobs.broadcasts_sent);
    println!("  invalidations      {}", stats.jobs.invalidations_processed);
    println!("  items dropped      {}", paint_count(stats.jobs.items_dropped));
    println!();

    let conns = &stats.connections;
    println!("{}", "[CONNECTIONS]".bold());
    println!("  active             {}/{}", conns.active_connections, conns.max_connections);
    println!("  delivered          {}", conns.messages_delivered);
    println!("  dropped            {}", paint_count(conns.messages_dropped));
    println!("  rejected           {}", paint_count(conns.connections_rejected));
    for (topic, subscribers) in &conns.topic_subscribers {
        println!("  {:<18} {}", topic.dimmed(), subscribers);
    }
    println!();

    println!("uptime {}", format_uptime(stats.uptime_seconds));
    Ok(())
}

fn print_upstream(health: &UpstreamHealth) {
    println!("{}", "[UPSTREAM]".bold());
    let circuit = match health.circuit_state.as_str() {
        "closed" => health.circuit_state.green().to_string(),
        "half_open" => health.circuit_state.yellow().to_string(),
        _ => health.circuit_state.red().to_string(),
    };
    println!("  circuit            {} ({} consecutive failures)", circuit, health.failure_count);
    println!("  tokens             {:.2}/{:.0}", health.tokens_available, health.capacity);
    println!("  next token in      {:.1}s", health.wait_time_seconds);
}

fn paint_count(count: u64) -> String {
    if count == 0 {
        count.to_string()
    } else {
        count.yellow().to_string()
    }
}

fn format_uptime(seconds: u64) -> String {
    let (days, rem) = (seconds / 86_400, seconds % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let minutes = rem / 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, seconds % 60)
    }
}

pub fn encrypt(plaintext: &str, key_env: &str) -> Result<()> {
    let store = AesGcmSecretStore::from_env(key_env)?;
    if !store.has_key() {
        bail!("{} is not set; export a 64-character hex key first", key_env);
    }
    println!("{}", store.encrypt(plaintext)?);
    Ok(())
}

pub fn check_config(path: &Path) -> Result<()> {
    let config = HubConfig::load_from(path)?;
    println!("{} {}", "✓".green(), path.display());
    println!("{}", summarize(&config));
    Ok(())
}

fn summarize(config: &HubConfig) -> String {
    let encrypted = config
        .devices
        .iter()
        .filter(|d| d.api_key.starts_with(sensorhub_common::secrets::CIPHERTEXT_PREFIX))
        .count();

    let mut lines = vec![
        format!("  bind               {}", config.server.bind),
        format!("  provider           {}", config.provider.base_url),
        format!(
            "  rate limit         {} per {}s",
            config.rate_limit.capacity, config.rate_limit.period_secs
        ),
        format!(
            "  circuit            {} failures, {}s recovery",
            config.circuit.failure_threshold, config.circuit.recovery_timeout_secs
        ),
        format!("  cache              {:?}", config.cache.backend).to_lowercase(),
        format!(
            "  poller             every {}s, {} shards",
            config.poller.interval_secs, config.poller.shards
        ),
        format!(
            "  devices            {} ({} encrypted credentials)",
            config.devices.len(),
            encrypted
        ),
    ];
    if encrypted < config.devices.len() && !config.secrets.allow_plaintext_fallback {
        lines.push(format!(
            "  {} plaintext credentials with fallback disabled will never be polled",
            "warning:".yellow()
        ));
    }
    lines.join("\n")
}
