//! HTTP and WebSocket server for sensorhubd

use crate::connections::ConnectionManager;
use crate::fetch::TelemetryFetchService;
use crate::jobs::JobManager;
use crate::metrics::PipelineMetrics;
use crate::routes;
use anyhow::{Context, Result};
use axum::Router;
use sensorhub_common::Device;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub fetch: Arc<TelemetryFetchService>,
    pub jobs: Arc<JobManager>,
    pub connections: Arc<ConnectionManager>,
    pub metrics: Arc<PipelineMetrics>,
    pub devices: HashMap<String, Device>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        fetch: Arc<TelemetryFetchService>,
        jobs: Arc<JobManager>,
        connections: Arc<ConnectionManager>,
        metrics: Arc<PipelineMetrics>,
        devices: &[Device],
    ) -> Self {
        Self {
            fetch,
            jobs,
            connections,
            metrics,
            devices: devices.iter().map(|d| (d.id.clone(), d.clone())).collect(),
            start_time: Instant::now(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::socket_routes())
        .merge(routes::monitoring_routes())
        .merge(routes::device_routes())
        .merge(routes::health_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind the listener
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);
    Ok(listener)
}

/// Serve until `shutdown` resolves
pub async fn run<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;
    info!("HTTP server stopped");
    Ok(())
}
