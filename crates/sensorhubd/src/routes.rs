//! API routes for sensorhubd

use crate::connections::socket::{serve_socket, topic_filter};
use crate::server::AppState;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use sensorhub_common::{Envelope, PipelineStats, UpstreamHealth};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

type AppStateArc = Arc<AppState>;

/// Provider ceiling for a single history request
pub const MAX_HISTORY_RESULTS: usize = 8_000;

const DEFAULT_HISTORY_RESULTS: usize = 100;

// ============================================================================
// WebSocket
// ============================================================================

pub fn socket_routes() -> Router<AppStateArc> {
    Router::new().route("/ws", get(ws_handler))
}

#[derive(Debug, Deserialize)]
struct SocketParams {
    /// Comma-separated topic filter; absent or blank means every topic
    topics: Option<String>,
}

async fn ws_handler(
    State(state): State<AppStateArc>,
    Query(params): Query<SocketParams>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    // Capacity is checked before the upgrade so a full hub answers plain HTTP
    let topics = topic_filter(params.topics.as_deref());
    let lease = match state.connections.register(topics) {
        Ok(lease) => lease,
        Err(e) => {
            return (StatusCode::SERVICE_UNAVAILABLE, Json(Envelope::error(e.to_string())))
                .into_response();
        }
    };

    match ws {
        Some(ws) => ws.on_upgrade(move |socket| serve_socket(socket, lease)),
        None => (
            StatusCode::BAD_REQUEST,
            Json(Envelope::error("websocket upgrade required")),
        )
            .into_response(),
    }
}

// ============================================================================
// Monitoring Routes
// ============================================================================

pub fn monitoring_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/status", get(upstream_status))
        .route("/api/stats", get(pipeline_stats))
        .route("/metrics", get(prometheus_metrics))
}

async fn upstream_status(State(state): State<AppStateArc>) -> Json<UpstreamHealth> {
    Json(state.fetch.health())
}

async fn pipeline_stats(State(state): State<AppStateArc>) -> Json<PipelineStats> {
    Json(PipelineStats {
        upstream: state.fetch.health(),
        jobs: state.jobs.stats(),
        connections: state.connections.stats(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn prometheus_metrics(State(state): State<AppStateArc>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}

// ============================================================================
// Device Routes
// ============================================================================

pub fn device_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/devices/:id/latest", get(device_latest))
        .route("/api/devices/:id/history", get(device_history))
}

fn unknown_device(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(Envelope::error(format!("unknown device: {}", id))),
    )
        .into_response()
}

async fn device_latest(State(state): State<AppStateArc>, Path(id): Path<String>) -> Response {
    let Some(device) = state.devices.get(&id) else {
        return unknown_device(&id);
    };

    match state.fetch.latest(device).await {
        Some(reading) => Json(reading).into_response(),
        None => {
            debug!(device = %id, "No data for latest request");
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    results: Option<usize>,
}

async fn device_history(
    State(state): State<AppStateArc>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let Some(device) = state.devices.get(&id) else {
        return unknown_device(&id);
    };

    let results = params
        .results
        .unwrap_or(DEFAULT_HISTORY_RESULTS)
        .clamp(1, MAX_HISTORY_RESULTS);
    Json(state.fetch.history(device, results).await).into_response()
}

// ============================================================================
// Health Routes
// ============================================================================

pub fn health_routes() -> Router<AppStateArc> {
    Router::new().route("/health", get(health_check))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub devices: usize,
    pub active_connections: usize,
}

async fn health_check(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        devices: state.devices.len(),
        active_connections: state.connections.active_connections(),
    })
}
