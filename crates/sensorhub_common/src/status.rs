//! Operator-facing status snapshots

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Limiter/breaker pair state for the upstream provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamHealth {
    pub tokens_available: f64,
    pub capacity: f64,
    pub wait_time_seconds: f64,
    pub circuit_open: bool,
    pub failure_count: u32,
    /// `closed`, `open` or `half_open`
    pub circuit_state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub writes_processed: u64,
    pub writes_failed: u64,
    pub broadcasts_sent: u64,
    pub invalidations_processed: u64,
    /// Items refused because a queue was full
    pub items_dropped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub max_connections: usize,
    pub topic_subscribers: BTreeMap<String, usize>,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub connections_rejected: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub upstream: UpstreamHealth,
    pub jobs: JobStats,
    pub connections: ConnectionStats,
    pub uptime_seconds: u64,
}
