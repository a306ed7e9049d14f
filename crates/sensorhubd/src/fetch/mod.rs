//! Telemetry fetch service
//!
//! Every upstream call goes through the same gates, in order: circuit breaker,
//! rate limiter, credential decryption, then the provider call with bounded
//! retry. All failures are absorbed here and surface as "no data".

pub mod provider;

pub use provider::{HttpProvider, ProviderError, RequestStatus, TelemetryProvider};

use crate::cache::Cache;
use crate::metrics::PipelineMetrics;
use crate::resilience::{CircuitBreaker, TokenBucket};
use sensorhub_common::{BackoffConfig, Device, HubConfig, RawReading, Reading, SecretStore, UpstreamHealth};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How a call path reacts to an empty token bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// Sleep `wait_time()` then consume; used by on-demand reads
    Wait,
    /// Consume once, no data when refused; used by the poller
    Skip,
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub latest_ttl: Duration,
    /// Zero disables history caching
    pub history_ttl: Duration,
    pub backoff: BackoffConfig,
    pub attempt_timeout: Duration,
    pub allow_plaintext_fallback: bool,
    pub timestamp_field: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self::from_config(&HubConfig::default())
    }
}

impl FetchSettings {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            latest_ttl: Duration::from_secs(config.cache.latest_ttl_secs),
            history_ttl: Duration::from_secs(config.cache.history_ttl_secs),
            backoff: config.retry.to_backoff(),
            attempt_timeout: config.retry.attempt_timeout(),
            allow_plaintext_fallback: config.secrets.allow_plaintext_fallback,
            timestamp_field: config.provider.timestamp_field.clone(),
        }
    }
}

pub struct TelemetryFetchService {
    limiter: Arc<TokenBucket>,
    breaker: Arc<CircuitBreaker>,
    cache: Cache,
    secrets: Arc<dyn SecretStore>,
    provider: Arc<dyn TelemetryProvider>,
    settings: FetchSettings,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl TelemetryFetchService {
    pub fn new(
        limiter: Arc<TokenBucket>,
        breaker: Arc<CircuitBreaker>,
        cache: Cache,
        secrets: Arc<dyn SecretStore>,
        provider: Arc<dyn TelemetryProvider>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            limiter,
            breaker,
            cache,
            secrets,
            provider,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Latest normalized reading, served from cache within the TTL
    pub async fn latest(&self, device: &Device) -> Option<Reading> {
        let key = device.latest_cache_key();
        self.cache
            .get_or_compute(&key, self.settings.latest_ttl, move || async move {
                self.fetch_reading(device, "latest", RateLimitPolicy::Wait)
                    .await
                    .ok_or(())
            })
            .await
            .ok()
    }

    /// Fresh reading for the poller; skips the cache read, writes the result
    pub async fn refresh_latest(&self, device: &Device) -> Option<Reading> {
        let reading = self
            .fetch_reading(device, "refresh", RateLimitPolicy::Skip)
            .await?;
        self.cache
            .set(&device.latest_cache_key(), &reading, self.settings.latest_ttl)
            .await;
        Some(reading)
    }

    /// Raw history, oldest first; empty on any failure
    pub async fn history(&self, device: &Device, results: usize) -> Vec<RawReading> {
        let key = device.history_cache_key(results);
        self.cache
            .get_or_compute(&key, self.settings.history_ttl, move || async move {
                self.guarded(device, "history", RateLimitPolicy::Wait, move |api_key| async move {
                    self.provider.history(&device.channel, &api_key, results).await
                })
                .await
                .ok_or(())
            })
            .await
            .unwrap_or_default()
    }

    /// Read-only limiter and breaker snapshot
    pub fn health(&self) -> UpstreamHealth {
        let state = self.breaker.state();
        UpstreamHealth {
            tokens_available: self.limiter.tokens_available(),
            capacity: self.limiter.capacity(),
            wait_time_seconds: self.limiter.wait_time().as_secs_f64(),
            circuit_open: self.breaker.is_open(),
            failure_count: self.breaker.failure_count(),
            circuit_state: state.as_str().to_string(),
        }
    }

    async fn fetch_reading(
        &self,
        device: &Device,
        path: &str,
        policy: RateLimitPolicy,
    ) -> Option<Reading> {
        let raw = self
            .guarded(device, path, policy, move |api_key| async move {
                self.provider.latest(&device.channel, &api_key).await
            })
            .await?;

        Some(Reading::from_raw(
            &device.id,
            &raw,
            device.mapping.as_ref(),
            &self.settings.timestamp_field,
        ))
    }

    /// Run `call` behind the breaker, limiter and retry loop
    async fn guarded<T, F, Fut>(
        &self,
        device: &Device,
        path: &str,
        policy: RateLimitPolicy,
        call: F,
    ) -> Option<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let outcome = self.guarded_inner(device, policy, call).await;
        self.record_fetch(path, outcome.label());
        self.publish_state();

        match outcome {
            FetchOutcome::Ok(value) => Some(value),
            _ => None,
        }
    }

    async fn guarded_inner<T, F, Fut>(
        &self,
        device: &Device,
        policy: RateLimitPolicy,
        call: F,
    ) -> FetchOutcome<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if !self.breaker.should_attempt() {
            debug!(device = %device.id, "Circuit open, skipping upstream call");
            return FetchOutcome::CircuitOpen;
        }

        if !self.acquire_token(policy).await {
            info!(device = %device.id, "Rate limited, no data this cycle");
            return FetchOutcome::RateLimited;
        }

        let Some(api_key) = self.credential(device) else {
            return FetchOutcome::Credential;
        };

        match self.call_with_retry(&device.id, || call(api_key.clone())).await {
            Ok(value) => {
                self.breaker.record_success();
                FetchOutcome::Ok(value)
            }
            Err(ProviderError::NoData) => {
                // Upstream is healthy, the channel is just empty
                self.breaker.record_success();
                debug!(device = %device.id, "Upstream has no reading");
                FetchOutcome::NoData
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!(device = %device.id, "Upstream fetch failed: {}", e);
                FetchOutcome::Failed
            }
        }
    }

    async fn acquire_token(&self, policy: RateLimitPolicy) -> bool {
        if policy == RateLimitPolicy::Wait {
            let wait = self.limiter.wait_time();
            if wait == Duration::MAX {
                return false;
            }
            if !wait.is_zero() {
                debug!("Waiting {:?} for a rate limit token", wait);
                tokio::time::sleep(wait).await;
            }
        }
        self.limiter.consume(1)
    }

    /// Decrypted API key, or the stored value when plaintext fallback is on
    fn credential(&self, device: &Device) -> Option<String> {
        match self.secrets.decrypt(&device.api_key) {
            Ok(api_key) => Some(api_key),
            Err(e) if self.settings.allow_plaintext_fallback => {
                warn!(device = %device.id, "Credential not decryptable ({}), using it as plaintext", e);
                Some(device.api_key.clone())
            }
            Err(e) => {
                error!(device = %device.id, "Credential not decryptable: {}", e);
                None
            }
        }
    }

    async fn call_with_retry<T, F, Fut>(&self, device_id: &str, call: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let backoff = &self.settings.backoff;
        let mut attempt = 0;

        loop {
            debug!(
                device = %device_id,
                "Upstream request (attempt {}/{})",
                attempt + 1,
                backoff.max_attempts
            );

            let result = match tokio::time::timeout(self.settings.attempt_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            };

            let status = match &result {
                Ok(_) => RequestStatus::Success,
                Err(e) => e.status(),
            };
            if let Some(ref metrics) = self.metrics {
                metrics.record_upstream_attempt(status.as_str());
            }

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_retryable() || !backoff.has_next(attempt) {
                return Err(err);
            }

            // Backoff before retry (never after the last attempt)
            let delay = backoff.calculate_backoff(attempt);
            warn!(device = %device_id, "Upstream error: {}, retrying in {:?}", err, delay);
            if let Some(ref metrics) = self.metrics {
                metrics.record_backoff(delay.as_secs_f64());
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn record_fetch(&self, path: &str, outcome: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_fetch(path, outcome);
        }
    }

    fn publish_state(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics.set_upstream_state(self.breaker.state(), self.limiter.tokens_available());
        }
    }
}

enum FetchOutcome<T> {
    Ok(T),
    NoData,
    CircuitOpen,
    RateLimited,
    Credential,
    Failed,
}

impl<T> FetchOutcome<T> {
    fn label(&self) -> &'static str {
        match self {
            Self::Ok(_) => "ok",
            Self::NoData => "no_data",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::Credential => "credential",
            Self::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use async_trait::async_trait;
    use sensorhub_common::{AesGcmSecretStore, FieldMapping};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Provider replaying a script; repeats the last entry once exhausted
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<RawReading, ProviderError>>>,
        calls: AtomicUsize,
        keys: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<RawReading, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                keys: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self) -> Result<RawReading, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap_or(Err(ProviderError::NoData))
            }
        }
    }

    #[async_trait]
    impl TelemetryProvider for ScriptedProvider {
        async fn latest(&self, _channel: &str, api_key: &str) -> Result<RawReading, ProviderError> {
            self.keys.lock().unwrap().push(api_key.to_string());
            self.next()
        }

        async fn history(
            &self,
            _channel: &str,
            _api_key: &str,
            results: usize,
        ) -> Result<Vec<RawReading>, ProviderError> {
            let first = self.next()?;
            Ok(vec![first; results])
        }
    }

    /// Provider that never answers
    struct HangingProvider;

    #[async_trait]
    impl TelemetryProvider for HangingProvider {
        async fn latest(&self, _channel: &str, _api_key: &str) -> Result<RawReading, ProviderError> {
            std::future::pending().await
        }

        async fn history(&self, _: &str, _: &str, _: usize) -> Result<Vec<RawReading>, ProviderError> {
            std::future::pending().await
        }
    }

    fn raw(value: i64) -> RawReading {
        json!({"field1": value.to_string(), "created_at": "2024-05-01T10:00:00Z"})
            .as_object()
            .unwrap()
            .clone()
    }

    fn device() -> Device {
        Device {
            id: "D1".into(),
            channel: "1001".into(),
            api_key: "PLAINKEY".into(),
            mapping: Some(FieldMapping::from_pairs([("temperature", "field1")])),
        }
    }

    fn service(provider: Arc<dyn TelemetryProvider>, limiter: TokenBucket) -> TelemetryFetchService {
        TelemetryFetchService::new(
            Arc::new(limiter),
            Arc::new(CircuitBreaker::new(5, Duration::from_secs(60))),
            Cache::in_memory(100),
            Arc::new(AesGcmSecretStore::keyless()),
            provider,
            FetchSettings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_normalizes_and_caches() {
        let provider = ScriptedProvider::new(vec![Ok(raw(21))]);
        let svc = service(provider.clone(), TokenBucket::default());

        let reading = svc.latest(&device()).await.unwrap();
        assert_eq!(reading.field("temperature"), Some(&json!(21)));
        assert!(reading.observed_at.is_some());

        svc.latest(&device()).await.unwrap();
        assert_eq!(provider.calls(), 1, "second read served from cache");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let provider = ScriptedProvider::new(vec![
            Err(ProviderError::Http(503)),
            Err(ProviderError::Network("reset".into())),
            Ok(raw(7)),
        ]);
        let svc = service(provider.clone(), TokenBucket::default());

        let start = tokio::time::Instant::now();
        let reading = svc.refresh_latest(&device()).await.unwrap();
        assert_eq!(reading.field("temperature"), Some(&json!(7)));
        assert_eq!(provider.calls(), 3);
        // 1s + 2s between the three attempts
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(svc.health().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_not_retried() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::Http(401))]);
        let svc = service(provider.clone(), TokenBucket::default());

        assert!(svc.refresh_latest(&device()).await.is_none());
        assert_eq!(provider.calls(), 1);
        assert_eq!(svc.health().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let svc = service(Arc::new(HangingProvider), TokenBucket::default());

        let start = tokio::time::Instant::now();
        assert!(svc.refresh_latest(&device()).await.is_none());
        // 3 x 10s attempts plus 1s + 2s backoff
        assert_eq!(start.elapsed(), Duration::from_secs(33));
        assert_eq!(svc.health().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data_is_a_breaker_success() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::Http(500)), Err(ProviderError::NoData)]);
        let svc = service(provider.clone(), TokenBucket::default());

        assert!(svc.refresh_latest(&device()).await.is_none());
        let health = svc.health();
        assert_eq!(health.failure_count, 0);
        assert_eq!(health.circuit_state, CircuitState::Closed.as_str());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_policy_delays_instead_of_dropping() {
        let provider = ScriptedProvider::new(vec![Ok(raw(1))]);
        let svc = service(provider.clone(), TokenBucket::new(1, Duration::from_secs(60)));

        assert!(svc.refresh_latest(&device()).await.is_some());
        // Skip policy refuses while the bucket is empty
        assert!(svc.refresh_latest(&device()).await.is_none());

        let start = tokio::time::Instant::now();
        svc.cache().invalidate(&device().latest_cache_key()).await;
        assert!(svc.latest(&device()).await.is_some());
        assert!(start.elapsed() >= Duration::from_secs(59));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plaintext_fallback() {
        let provider = ScriptedProvider::new(vec![Ok(raw(1))]);
        let svc = service(provider.clone(), TokenBucket::default());

        svc.refresh_latest(&device()).await.unwrap();
        assert_eq!(provider.keys.lock().unwrap().as_slice(), ["PLAINKEY"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_disabled_skips_call() {
        let provider = ScriptedProvider::new(vec![Ok(raw(1))]);
        let mut svc = service(provider.clone(), TokenBucket::default());
        svc.settings.allow_plaintext_fallback = false;

        assert!(svc.refresh_latest(&device()).await.is_none());
        assert_eq!(provider.calls(), 0);
        assert_eq!(svc.health().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_encrypted_credential_is_decrypted() {
        let store = AesGcmSecretStore::from_hex(&"11".repeat(32)).unwrap();
        let mut dev = device();
        dev.api_key = store.encrypt("SECRET").unwrap();

        let provider = ScriptedProvider::new(vec![Ok(raw(1))]);
        let svc = TelemetryFetchService::new(
            Arc::new(TokenBucket::default()),
            Arc::new(CircuitBreaker::default()),
            Cache::in_memory(10),
            Arc::new(store),
            provider.clone(),
            FetchSettings::default(),
        );

        svc.refresh_latest(&dev).await.unwrap();
        assert_eq!(provider.keys.lock().unwrap().as_slice(), ["SECRET"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_empty_on_failure() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::Http(404))]);
        let svc = service(provider.clone(), TokenBucket::default());
        assert!(svc.history(&device(), 5).await.is_empty());

        let provider = ScriptedProvider::new(vec![Ok(raw(3))]);
        let svc = service(provider.clone(), TokenBucket::default());
        let history = svc.history(&device(), 5).await;
        assert_eq!(history.len(), 5);
        // Raw fields, not normalized
        assert_eq!(history[0].get("field1"), Some(&json!("3")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_snapshot() {
        let svc = service(ScriptedProvider::new(vec![Ok(raw(1))]), TokenBucket::default());
        let health = svc.health();
        assert_eq!(health.capacity, 4.0);
        assert_eq!(health.tokens_available, 4.0);
        assert_eq!(health.wait_time_seconds, 0.0);
        assert!(!health.circuit_open);
        assert_eq!(health.circuit_state, "closed");
    }
}
