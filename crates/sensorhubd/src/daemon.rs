//! Daemon wiring: builds the pipeline from config and runs it until a signal

use crate::cache::{Cache, MemoryCache, RedisCache};
use crate::connections::ConnectionManager;
use crate::fetch::{FetchSettings, HttpProvider, TelemetryFetchService};
use crate::jobs::{JobManager, JobSettings};
use crate::metrics::PipelineMetrics;
use crate::poller::spawn_pollers;
use crate::repository::SqliteReadingRepository;
use crate::resilience::{CircuitBreaker, TokenBucket};
use crate::server::{self, AppState};
use anyhow::{Context, Result};
use sensorhub_common::config::{CacheBackendKind, CacheConfig};
use sensorhub_common::{AesGcmSecretStore, HubConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval between expired-entry sweeps of the memory cache
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Build the configured cache; an unreachable Redis falls back to memory.
/// The memory backend is returned separately so it can be pruned.
pub async fn build_cache(
    config: &CacheConfig,
    metrics: &Arc<PipelineMetrics>,
) -> (Cache, Option<Arc<MemoryCache>>) {
    if config.backend == CacheBackendKind::Redis {
        match RedisCache::connect(&config.redis_url, &config.key_prefix).await {
            Ok(redis) => {
                let cache = Cache::new(Arc::new(redis)).with_metrics(Arc::clone(metrics));
                return (cache, None);
            }
            Err(e) => {
                warn!("Redis cache unavailable ({}), falling back to in-memory cache", e);
            }
        }
    }

    let memory = Arc::new(MemoryCache::new(config.capacity));
    let cache = Cache::new(memory.clone()).with_metrics(Arc::clone(metrics));
    info!("Using in-memory cache (capacity {})", config.capacity);
    (cache, Some(memory))
}

async fn prune_loop(memory: Arc<MemoryCache>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let pruned = memory.prune_expired().await;
                if pruned > 0 {
                    debug!("Pruned {} expired cache entries", pruned);
                }
            }
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

/// Run the daemon until a shutdown signal.
/// Drains in order: pollers, job manager flush, HTTP server.
pub async fn run(config: HubConfig) -> Result<()> {
    let metrics = Arc::new(PipelineMetrics::new().context("Failed to register metrics")?);
    let background = CancellationToken::new();

    let (cache, memory) = build_cache(&config.cache, &metrics).await;
    if let Some(memory) = memory {
        tokio::spawn(prune_loop(memory, background.clone()));
    }

    let limiter = Arc::new(TokenBucket::new(
        config.rate_limit.capacity,
        Duration::from_secs(config.rate_limit.period_secs),
    ));
    let breaker = Arc::new(CircuitBreaker::new(
        config.circuit.failure_threshold,
        Duration::from_secs(config.circuit.recovery_timeout_secs),
    ));
    let secrets = Arc::new(
        AesGcmSecretStore::from_env(&config.secrets.key_env)
            .with_context(|| format!("Invalid credential key in {}", config.secrets.key_env))?,
    );
    let provider = Arc::new(
        HttpProvider::new(config.provider.clone()).context("Failed to build provider client")?,
    );

    let fetch = Arc::new(
        TelemetryFetchService::new(
            limiter,
            breaker,
            cache.clone(),
            secrets,
            provider,
            FetchSettings::from_config(&config),
        )
        .with_metrics(Arc::clone(&metrics)),
    );

    let repository = Arc::new(
        SqliteReadingRepository::open(&config.storage.database_path).with_context(|| {
            format!("Failed to open reading store {}", config.storage.database_path)
        })?,
    );

    let connections =
        Arc::new(ConnectionManager::new(&config.connections).with_metrics(Arc::clone(&metrics)));
    tokio::spawn(Arc::clone(&connections).run_heartbeat(background.clone()));

    let jobs = Arc::new(JobManager::start(
        JobSettings::from_config(&config.jobs),
        repository,
        connections.clone(),
        cache,
        Some(Arc::clone(&metrics)),
    ));

    let listener = server::bind(&config.server.bind).await?;
    let state = Arc::new(AppState::new(
        Arc::clone(&fetch),
        Arc::clone(&jobs),
        Arc::clone(&connections),
        Arc::clone(&metrics),
        &config.devices,
    ));
    let server_stop = CancellationToken::new();
    let server = tokio::spawn(server::run(listener, state, {
        let stop = server_stop.clone();
        async move { stop.cancelled().await }
    }));

    let pollers_stop = CancellationToken::new();
    let pollers = spawn_pollers(
        &config.devices,
        &config.poller,
        Arc::clone(&fetch),
        Arc::clone(&jobs),
        pollers_stop.clone(),
    );

    info!(
        "sensorhubd v{} ready ({} devices, {} poller shards)",
        env!("CARGO_PKG_VERSION"),
        config.devices.len(),
        pollers.len()
    );

    shutdown_signal().await;
    info!("Shutting down");

    pollers_stop.cancel();
    for poller in pollers {
        if let Err(e) = poller.await {
            error!("Poller task ended abnormally: {}", e);
        }
    }

    jobs.shutdown().await;

    background.cancel();
    connections.close_all();
    server_stop.cancel();
    server.await.context("HTTP server task failed")??;

    info!("sensorhubd stopped");
    Ok(())
}
