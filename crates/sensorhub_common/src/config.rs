//! Configuration management for sensorhub.
//!
//! Loads settings from /etc/sensorhub/config.toml (or `SENSORHUB_CONFIG`).
//! Every field has a default, so an empty file is a valid configuration.

use crate::backoff::BackoffConfig;
use crate::reading::Device;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Config file path
pub const CONFIG_PATH: &str = "/etc/sensorhub/config.toml";

/// Environment override for the config file path
pub const CONFIG_ENV: &str = "SENSORHUB_CONFIG";

/// HTTP/WebSocket listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7870".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

/// Upstream telemetry provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path template for the latest reading, `{channel}` is substituted
    #[serde(default = "default_latest_path")]
    pub latest_path: String,

    /// Path template for history
    #[serde(default = "default_history_path")]
    pub history_path: String,

    /// Key holding the reading list in a history response
    #[serde(default = "default_history_items_key")]
    pub history_items_key: String,

    /// Query parameter carrying the API key
    #[serde(default = "default_api_key_param")]
    pub api_key_param: String,

    /// Query parameter carrying the history length
    #[serde(default = "default_results_param")]
    pub results_param: String,

    /// Payload field holding the reading timestamp
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
}

fn default_base_url() -> String {
    "https://api.thingspeak.com".to_string()
}

fn default_latest_path() -> String {
    "/channels/{channel}/feeds/last.json".to_string()
}

fn default_history_path() -> String {
    "/channels/{channel}/feeds.json".to_string()
}

fn default_history_items_key() -> String {
    "feeds".to_string()
}

fn default_api_key_param() -> String {
    "api_key".to_string()
}

fn default_results_param() -> String {
    "results".to_string()
}

fn default_timestamp_field() -> String {
    "created_at".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            latest_path: default_latest_path(),
            history_path: default_history_path(),
            history_items_key: default_history_items_key(),
            api_key_param: default_api_key_param(),
            results_param: default_results_param(),
            timestamp_field: default_timestamp_field(),
        }
    }
}

/// Token bucket sized after the provider quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,

    /// Time to refill a full bucket
    #[serde(default = "default_rate_period")]
    pub period_secs: u64,
}

fn default_rate_capacity() -> u32 {
    4 // 4 requests per minute upstream quota
}

fn default_rate_period() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            period_secs: default_rate_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
        }
    }
}

/// Outbound retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_factor")]
    pub factor: f64,

    /// Timeout for each individual attempt
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_attempt_timeout() -> u64 {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            factor: default_retry_factor(),
            attempt_timeout_secs: default_attempt_timeout(),
        }
    }
}

impl RetryConfig {
    pub fn to_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_ms: self.base_delay_ms,
            factor: self.factor,
            jitter_percent: 0.0,
            max_ms: BackoffConfig::default().max_ms,
            max_attempts: self.max_attempts.max(1),
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackendKind,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace prepended to every key in shared backends
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Max entries held by the in-memory backend
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    #[serde(default = "default_latest_ttl")]
    pub latest_ttl_secs: u64,

    /// 0 disables history caching
    #[serde(default = "default_history_ttl")]
    pub history_ttl_secs: u64,
}

fn default_cache_backend() -> CacheBackendKind {
    CacheBackendKind::Memory
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "sensorhub:".to_string()
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_latest_ttl() -> u64 {
    60
}

fn default_history_ttl() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            capacity: default_cache_capacity(),
            latest_ttl_secs: default_latest_ttl(),
            history_ttl_secs: default_history_ttl(),
        }
    }
}

/// Background job batching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_ms: u64,

    /// Retries for a failed batch write before it is dropped
    #[serde(default = "default_write_retries")]
    pub write_retries: usize,

    /// Pending items per queue before enqueues are refused
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout() -> u64 {
    5_000
}

fn default_write_retries() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    10_000
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout(),
            write_retries: default_write_retries(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// WebSocket fan-out limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionsConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Outbound messages buffered per connection
    #[serde(default = "default_outbound_queue")]
    pub queue_capacity: usize,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Silence after which a connection is dropped
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
}

fn default_max_connections() -> usize {
    1_000
}

fn default_outbound_queue() -> usize {
    100
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    75 // two missed pings plus slack
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            queue_capacity: default_outbound_queue(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_shards")]
    pub shards: usize,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_shards() -> usize {
    1
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            shards: default_shards(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Environment variable holding the hex AES-256 key
    #[serde(default = "default_key_env")]
    pub key_env: String,

    /// Accept credentials that fail to decrypt as legacy plaintext
    #[serde(default = "default_allow_plaintext")]
    pub allow_plaintext_fallback: bool,
}

fn default_key_env() -> String {
    "SENSORHUB_SECRET_KEY".to_string()
}

fn default_allow_plaintext() -> bool {
    true
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
            allow_plaintext_fallback: default_allow_plaintext(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "/var/lib/sensorhub/readings.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub connections: ConnectionsConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Devices are declared as `[[devices]]` tables
pub type DeviceConfig = Device;

impl HubConfig {
    /// Load from `SENSORHUB_CONFIG` or the default path; defaults when missing
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| CONFIG_PATH.to_string());
        let path = Path::new(&path);
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        info!("Loaded config from {} ({} devices)", path.display(), config.devices.len());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: HubConfig = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.capacity == 0 || self.rate_limit.period_secs == 0 {
            bail!("rate_limit.capacity and rate_limit.period_secs must be positive");
        }
        if self.circuit.failure_threshold == 0 {
            bail!("circuit.failure_threshold must be positive");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.jobs.batch_size == 0 || self.jobs.queue_capacity == 0 {
            bail!("jobs.batch_size and jobs.queue_capacity must be positive");
        }
        if self.connections.queue_capacity == 0 {
            bail!("connections.queue_capacity must be positive");
        }
        if self.connections.heartbeat_interval_secs == 0 {
            bail!("connections.heartbeat_interval_secs must be positive");
        }
        if self.connections.heartbeat_timeout_secs <= self.connections.heartbeat_interval_secs {
            bail!(
                "connections.heartbeat_timeout_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.connections.heartbeat_timeout_secs,
                self.connections.heartbeat_interval_secs
            );
        }
        if self.poller.interval_secs == 0 {
            bail!("poller.interval_secs must be positive");
        }
        if self.poller.shards == 0 {
            bail!("poller.shards must be at least 1");
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                bail!("device with empty id");
            }
            if !seen.insert(device.id.as_str()) {
                bail!("duplicate device id: {}", device.id);
            }
        }
        Ok(())
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = HubConfig::parse("").unwrap();
        assert_eq!(config.rate_limit.capacity, 4);
        assert_eq!(config.rate_limit.period_secs, 60);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.cache.backend, CacheBackendKind::Memory);
        assert_eq!(config.cache.latest_ttl_secs, 60);
        assert_eq!(config.jobs.batch_size, 100);
        assert_eq!(config.jobs.batch_timeout_ms, 5_000);
        assert_eq!(config.connections.max_connections, 1_000);
        assert_eq!(config.connections.queue_capacity, 100);
        assert_eq!(config.connections.heartbeat_interval_secs, 30);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_parse_devices_and_sections() {
        let config = HubConfig::parse(
            r#"
            [cache]
            backend = "redis"
            redis_url = "redis://cache:6379"

            [poller]
            interval_secs = 15
            shards = 2

            [[devices]]
            id = "D1"
            channel = "1001"
            api_key = "PLAINKEY"
            mapping = [{ canonical = "temperature", source = "field1" }]

            [[devices]]
            id = "D2"
            channel = "1002"
            api_key = "enc:v1:AAAA"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.backend, CacheBackendKind::Redis);
        assert_eq!(config.poller.shards, 2);
        assert_eq!(config.devices.len(), 2);
        assert!(config.device("D1").unwrap().mapping.is_some());
        assert!(config.device("D2").unwrap().mapping.is_none());
        assert!(config.device("D3").is_none());
    }

    #[test]
    fn test_duplicate_devices_rejected() {
        let err = HubConfig::parse(
            r#"
            [[devices]]
            id = "D1"
            channel = "1"
            api_key = "k"

            [[devices]]
            id = "D1"
            channel = "2"
            api_key = "k"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(HubConfig::parse("[rate_limit]\ncapacity = 0").is_err());
        assert!(HubConfig::parse("[poller]\nshards = 0").is_err());
    }

    #[test]
    fn test_zero_heartbeat_interval_rejected() {
        let err = HubConfig::parse("[connections]\nheartbeat_interval_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("heartbeat_interval_secs"));
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_interval() {
        let err = HubConfig::parse(
            "[connections]\nheartbeat_interval_secs = 30\nheartbeat_timeout_secs = 30\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("must exceed"));

        // Timeout defaults to 75s, so a larger interval alone is rejected too
        assert!(HubConfig::parse("[connections]\nheartbeat_interval_secs = 90\n").is_err());

        let config = HubConfig::parse(
            "[connections]\nheartbeat_interval_secs = 10\nheartbeat_timeout_secs = 25\n",
        )
        .unwrap();
        assert_eq!(config.connections.heartbeat_timeout_secs, 25);
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let err = HubConfig::parse("[poller]\ninterval_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("poller.interval_secs"));
    }

    #[test]
    fn test_retry_to_backoff() {
        let backoff = RetryConfig::default().to_backoff();
        assert_eq!(backoff.max_attempts, 3);
        assert_eq!(backoff.calculate_backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind = \"0.0.0.0:9000\"").unwrap();

        let config = HubConfig::load_from(file.path()).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
    }
}
