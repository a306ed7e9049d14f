//! Shared fixtures for sensorhubd integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use sensorhub_common::{AesGcmSecretStore, Device, FieldMapping, RawReading};
use sensorhubd::{
    Cache, CircuitBreaker, FetchSettings, ProviderError, TelemetryFetchService, TelemetryProvider,
    TokenBucket,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upstream double: returns `field1 = start + n` on the n-th call, or fails
/// with a network error while `failing` is set
pub struct MockProvider {
    start: i64,
    calls: AtomicUsize,
    failing: AtomicBool,
    empty: AtomicBool,
    frozen: AtomicBool,
}

impl MockProvider {
    pub fn counting_from(start: i64) -> Arc<Self> {
        Arc::new(Self {
            start,
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            empty: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Answer like a channel that has never reported
    pub fn set_empty(&self, empty: bool) {
        self.empty.store(empty, Ordering::SeqCst);
    }

    /// Keep answering `field1 = start`
    pub fn set_frozen(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self) -> Result<RawReading, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Network("connection refused".into()));
        }
        if self.empty.load(Ordering::SeqCst) {
            return Err(ProviderError::NoData);
        }
        if self.frozen.load(Ordering::SeqCst) {
            return Ok(raw_reading(self.start));
        }
        Ok(raw_reading(self.start + n as i64))
    }
}

#[async_trait]
impl TelemetryProvider for MockProvider {
    async fn latest(&self, _channel: &str, _api_key: &str) -> Result<RawReading, ProviderError> {
        self.answer()
    }

    async fn history(
        &self,
        _channel: &str,
        _api_key: &str,
        results: usize,
    ) -> Result<Vec<RawReading>, ProviderError> {
        let reading = self.answer()?;
        Ok(vec![reading; results])
    }
}

/// Provider payload with a numeric string, as the upstream sends it
pub fn raw_reading(value: i64) -> RawReading {
    json!({
        "created_at": "2024-05-01T10:00:00Z",
        "entry_id": value,
        "field1": value.to_string(),
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}

pub fn device(id: &str) -> Device {
    Device {
        id: id.to_string(),
        channel: format!("100{}", id),
        api_key: "LEGACYPLAINTEXT".to_string(),
        mapping: Some(FieldMapping::from_pairs([("temperature", "field1")])),
    }
}

pub fn fetch_service(
    provider: Arc<MockProvider>,
    limiter: TokenBucket,
    breaker: CircuitBreaker,
) -> TelemetryFetchService {
    TelemetryFetchService::new(
        Arc::new(limiter),
        Arc::new(breaker),
        Cache::in_memory(1_000),
        Arc::new(AesGcmSecretStore::keyless()),
        provider,
        FetchSettings::default(),
    )
}

/// Default quota (4 per minute) and breaker (5 failures, 60s)
pub fn default_service(provider: Arc<MockProvider>) -> TelemetryFetchService {
    fetch_service(
        provider,
        TokenBucket::new(4, Duration::from_secs(60)),
        CircuitBreaker::new(5, Duration::from_secs(60)),
    )
}
