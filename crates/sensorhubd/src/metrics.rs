//! Prometheus metrics for the ingestion and fan-out pipeline

use crate::resilience::CircuitState;
use prometheus::{
    register_gauge_with_registry, register_histogram_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, Gauge, Histogram, IntCounter, IntCounterVec,
    IntGauge, Registry, TextEncoder,
};

/// Pipeline metrics, one registry per daemon
#[derive(Clone)]
pub struct PipelineMetrics {
    // Fetch path
    pub fetch_total: IntCounterVec,
    pub upstream_attempts_total: IntCounterVec,
    pub retry_backoff_seconds: Histogram,
    pub circuit_state: IntGauge,
    pub tokens_available: Gauge,
    pub cache_lookups_total: IntCounterVec,

    // Job manager
    pub job_batches_total: IntCounterVec,
    pub job_items_total: IntCounterVec,

    // Connections
    pub connections_active: IntGauge,
    pub messages_delivered_total: IntCounter,
    pub messages_dropped_total: IntCounter,
    pub connections_rejected_total: IntCounter,

    registry: Registry,
}

impl PipelineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let fetch_total = register_int_counter_vec_with_registry!(
            "sensorhub_fetch_total",
            "Telemetry fetches by call path and outcome",
            &["path", "outcome"],
            registry
        )?;

        let upstream_attempts_total = register_int_counter_vec_with_registry!(
            "sensorhub_upstream_attempts_total",
            "Individual upstream HTTP attempts by status",
            &["status"],
            registry
        )?;

        let retry_backoff_seconds = register_histogram_with_registry!(
            "sensorhub_retry_backoff_seconds",
            "Backoff slept between upstream attempts",
            vec![0.5, 1.0, 2.0, 4.0, 8.0, 16.0],
            registry
        )?;

        let circuit_state = register_int_gauge_with_registry!(
            "sensorhub_circuit_state",
            "Upstream circuit: 0=closed, 1=half_open, 2=open",
            registry
        )?;

        let tokens_available = register_gauge_with_registry!(
            "sensorhub_rate_limit_tokens",
            "Tokens left in the upstream rate limiter",
            registry
        )?;

        let cache_lookups_total = register_int_counter_vec_with_registry!(
            "sensorhub_cache_lookups_total",
            "Cache lookups by result (hit, miss, error)",
            &["result"],
            registry
        )?;

        let job_batches_total = register_int_counter_vec_with_registry!(
            "sensorhub_job_batches_total",
            "Flushed batches by job kind and result",
            &["kind", "result"],
            registry
        )?;

        let job_items_total = register_int_counter_vec_with_registry!(
            "sensorhub_job_items_total",
            "Flushed job items by job kind and result",
            &["kind", "result"],
            registry
        )?;

        let connections_active = register_int_gauge_with_registry!(
            "sensorhub_connections_active",
            "Open WebSocket connections",
            registry
        )?;

        let messages_delivered_total = register_int_counter_with_registry!(
            "sensorhub_messages_delivered_total",
            "Messages written to client sockets",
            registry
        )?;

        let messages_dropped_total = register_int_counter_with_registry!(
            "sensorhub_messages_dropped_total",
            "Messages dropped from full outbound queues",
            registry
        )?;

        let connections_rejected_total = register_int_counter_with_registry!(
            "sensorhub_connections_rejected_total",
            "Handshakes rejected at the connection cap",
            registry
        )?;

        Ok(Self {
            fetch_total,
            upstream_attempts_total,
            retry_backoff_seconds,
            circuit_state,
            tokens_available,
            cache_lookups_total,
            job_batches_total,
            job_items_total,
            connections_active,
            messages_delivered_total,
            messages_dropped_total,
            connections_rejected_total,
            registry,
        })
    }

    pub fn record_fetch(&self, path: &str, outcome: &str) {
        self.fetch_total.with_label_values(&[path, outcome]).inc();
    }

    pub fn record_upstream_attempt(&self, status: &str) {
        self.upstream_attempts_total.with_label_values(&[status]).inc();
    }

    pub fn record_backoff(&self, seconds: f64) {
        self.retry_backoff_seconds.observe(seconds);
    }

    pub fn set_upstream_state(&self, state: CircuitState, tokens: f64) {
        let value = match state {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        };
        self.circuit_state.set(value);
        self.tokens_available.set(tokens);
    }

    pub fn record_cache_lookup(&self, result: &str) {
        self.cache_lookups_total.with_label_values(&[result]).inc();
    }

    pub fn record_batch(&self, kind: &str, result: &str, items: usize) {
        self.job_batches_total.with_label_values(&[kind, result]).inc();
        self.job_items_total
            .with_label_values(&[kind, result])
            .inc_by(items as u64);
    }

    pub fn set_active_connections(&self, count: usize) {
        self.connections_active.set(count as i64);
    }

    pub fn record_delivered(&self) {
        self.messages_delivered_total.inc();
    }

    pub fn record_dropped(&self) {
        self.messages_dropped_total.inc();
    }

    pub fn record_rejected(&self) {
        self.connections_rejected_total.inc();
    }

    /// Text exposition format
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
