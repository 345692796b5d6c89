//! Prometheus metric bundles and the metrics HTTP endpoint.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    Counter, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

const API_DURATION_LABELS: &[&str] = &["method", "path", "status"];

/// Metrics for the ingest API.
pub struct IngestMetrics {
    /// Currently connected API clients.
    pub connected_clients: Gauge,
    /// Records accepted from producers.
    pub ingested_records: Counter,
    /// Bytes accepted from producers.
    pub ingested_bytes: Counter,
    /// Pending segments committed by consumers.
    pub committed_segments: Counter,
    /// Bytes of committed segments.
    pub committed_bytes: Counter,
    /// Pending segments failed back into the queue, including timeouts.
    pub failed_segments: Counter,
    /// API request duration by method, path and status.
    pub api_duration: HistogramVec,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self {
            connected_clients: Gauge::new(
                "hopper_ingest_connected_clients",
                "Number of currently connected ingest API clients",
            )
            .unwrap(),
            ingested_records: Counter::new(
                "hopper_ingest_records_written_total",
                "Total records written by producers",
            )
            .unwrap(),
            ingested_bytes: Counter::new(
                "hopper_ingest_bytes_written_total",
                "Total bytes written by producers",
            )
            .unwrap(),
            committed_segments: Counter::new(
                "hopper_ingest_committed_segments_total",
                "Total pending segments committed",
            )
            .unwrap(),
            committed_bytes: Counter::new(
                "hopper_ingest_committed_bytes_total",
                "Total bytes of committed segments",
            )
            .unwrap(),
            failed_segments: Counter::new(
                "hopper_ingest_failed_segments_total",
                "Total pending segments failed back into the queue",
            )
            .unwrap(),
            api_duration: HistogramVec::new(
                HistogramOpts::new(
                    "hopper_ingest_api_request_duration_seconds",
                    "Ingest API request duration in seconds",
                ),
                API_DURATION_LABELS,
            )
            .unwrap(),
        }
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.connected_clients.clone()))?;
        registry.register(Box::new(self.ingested_records.clone()))?;
        registry.register(Box::new(self.ingested_bytes.clone()))?;
        registry.register(Box::new(self.committed_segments.clone()))?;
        registry.register(Box::new(self.committed_bytes.clone()))?;
        registry.register(Box::new(self.failed_segments.clone()))?;
        registry.register(Box::new(self.api_duration.clone()))?;
        Ok(())
    }
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for the store API.
pub struct StoreMetrics {
    /// Segments accepted for replication.
    pub replicated_segments: Counter,
    /// Bytes accepted for replication.
    pub replicated_bytes: Counter,
    /// API request duration by method, path and status.
    pub api_duration: HistogramVec,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self {
            replicated_segments: Counter::with_opts(Opts::new(
                "hopper_store_replicated_segments_total",
                "Total segments accepted by the store",
            ))
            .unwrap(),
            replicated_bytes: Counter::with_opts(Opts::new(
                "hopper_store_replicated_bytes_total",
                "Total bytes accepted by the store",
            ))
            .unwrap(),
            api_duration: HistogramVec::new(
                HistogramOpts::new(
                    "hopper_store_api_request_duration_seconds",
                    "Store API request duration in seconds",
                ),
                API_DURATION_LABELS,
            )
            .unwrap(),
        }
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.replicated_segments.clone()))?;
        registry.register(Box::new(self.replicated_bytes.clone()))?;
        registry.register(Box::new(self.api_duration.clone()))?;
        Ok(())
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for the consumer state machine.
pub struct ConsumerMetrics {
    /// Segments gathered from ingest nodes.
    pub consumed_segments: Counter,
    /// Bytes gathered from ingest nodes.
    pub consumed_bytes: Counter,
    /// Merged segments fully replicated to stores.
    pub replicated_segments: Counter,
    /// Bytes of fully replicated segments.
    pub replicated_bytes: Counter,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self {
            consumed_segments: Counter::new(
                "hopper_consumer_consumed_segments_total",
                "Total segments gathered from ingest nodes",
            )
            .unwrap(),
            consumed_bytes: Counter::new(
                "hopper_consumer_consumed_bytes_total",
                "Total bytes gathered from ingest nodes",
            )
            .unwrap(),
            replicated_segments: Counter::new(
                "hopper_consumer_replicated_segments_total",
                "Total merged segments fully replicated",
            )
            .unwrap(),
            replicated_bytes: Counter::new(
                "hopper_consumer_replicated_bytes_total",
                "Total bytes fully replicated",
            )
            .unwrap(),
        }
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.consumed_segments.clone()))?;
        registry.register(Box::new(self.consumed_bytes.clone()))?;
        registry.register(Box::new(self.replicated_segments.clone()))?;
        registry.register(Box::new(self.replicated_bytes.clone()))?;
        Ok(())
    }
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Router exposing the registry in the Prometheus text format, plus a
/// liveness probe.
pub fn metrics_router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(registry)
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
