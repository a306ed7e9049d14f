//! TTL cache in front of the upstream provider
//!
//! Backends store opaque bytes; [`Cache`] handles serialization and turns every
//! backend or serde failure into a miss. The cache is an optimisation only.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

use crate::metrics::PipelineMetrics;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key/value storage with per-entry TTL
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Unexpired value for `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    async fn invalidate(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every key starting with `prefix`; returns how many were removed
    async fn invalidate_by_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
}

/// Typed cache over any backend
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            metrics: None,
        }
    }

    pub fn in_memory(capacity: usize) -> Self {
        Self::new(Arc::new(MemoryCache::new(capacity)))
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn record(&self, result: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_cache_lookup(result);
        }
    }

    /// Cached value, `None` on miss or any error
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.backend.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.record("miss");
                return None;
            }
            Err(e) => {
                warn!("Cache get failed for {} ({}), treating as miss", key, e);
                self.record("error");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                self.record("hit");
                Some(value)
            }
            Err(e) => {
                warn!("Undecodable cache entry {} ({}), treating as miss", key, e);
                self.record("error");
                None
            }
        }
    }

    /// Store a value; failures are logged and swallowed. A zero TTL stores nothing.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize cache entry {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.backend.set(key, bytes, ttl).await {
            warn!("Cache set failed for {}: {}", key, e);
        }
    }

    /// Cached value, or `compute()` stored under `ttl`. Compute errors are
    /// returned as-is and nothing is stored.
    pub async fn get_or_compute<T, E, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !ttl.is_zero() {
            if let Some(value) = self.get(key).await {
                debug!("Cache hit: {}", key);
                return Ok(value);
            }
        }

        let value = compute().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    pub async fn invalidate(&self, key: &str) {
        if let Err(e) = self.backend.invalidate(key).await {
            warn!("Cache invalidate failed for {}: {}", key, e);
        }
    }

    pub async fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        match self.backend.invalidate_by_prefix(prefix).await {
            Ok(removed) => {
                debug!("Invalidated {} cache entries under {}", removed, prefix);
                removed
            }
            Err(e) => {
                warn!("Cache prefix invalidation failed for {}: {}", prefix, e);
                0
            }
        }
    }
}
