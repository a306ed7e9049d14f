//! SensorHub daemon: resilient telemetry ingestion and WebSocket fan-out
//!
//! Pipeline: poller → fetch service (breaker, limiter, cache, retry) → job
//! manager (batched writes, broadcasts, invalidations) → connection manager.

pub mod cache;
pub mod connections;
pub mod daemon;
pub mod fetch;
pub mod jobs;
pub mod metrics;
pub mod poller;
pub mod repository;
pub mod resilience;
pub mod routes;
pub mod server;

pub use cache::{Cache, CacheBackend, CacheError, MemoryCache, RedisCache};
pub use connections::{ConnectionError, ConnectionManager};
pub use fetch::{FetchSettings, ProviderError, RateLimitPolicy, TelemetryFetchService, TelemetryProvider};
pub use jobs::{Broadcaster, JobManager, JobSettings};
pub use metrics::PipelineMetrics;
pub use repository::{MemoryReadingRepository, ReadingRepository, RepositoryError, SqliteReadingRepository};
pub use resilience::{CircuitBreaker, CircuitState, TokenBucket};
