//! The store API's HTTP surface.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use bytes::Bytes;
use tracing::debug;

use hopper_common::metrics::StoreMetrics;
use hopper_common::records::{self, CopyStats};
use hopper_common::Error;
use hopper_queue::Queue;

/// Serves `POST /replicate`, persisting validated record streams into
/// this node's segment directory.
#[derive(Clone)]
pub struct StoreApi {
    segments: Arc<Queue>,
    metrics: Arc<StoreMetrics>,
}

impl StoreApi {
    pub fn new(segments: Queue, metrics: Arc<StoreMetrics>) -> Self {
        Self {
            segments: Arc::new(segments),
            metrics,
        }
    }

    /// Router for this API; the server nests it under `/store`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/replicate", post(handle_replicate))
            .layer(middleware::from_fn_with_state(
                self.metrics.clone(),
                track_request,
            ))
            .with_state(self.clone())
    }
}

async fn track_request(
    State(metrics): State<Arc<StoreMetrics>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let begin = Instant::now();

    let resp = next.run(req).await;

    metrics
        .api_duration
        .with_label_values(&[&method, &path, resp.status().as_str()])
        .observe(begin.elapsed().as_secs_f64());
    resp
}

async fn handle_replicate(State(api): State<StoreApi>, body: Bytes) -> Response {
    let segments = api.segments.clone();
    let written = tokio::task::spawn_blocking(move || persist(&segments, &body)).await;

    match written {
        Err(join) => {
            (StatusCode::INTERNAL_SERVER_ERROR, join.to_string()).into_response()
        }
        Ok(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        Ok(Ok(None)) => "No records".into_response(),
        Ok(Ok(Some(stats))) => {
            api.metrics.replicated_segments.inc();
            api.metrics.replicated_bytes.inc_by(stats.bytes as f64);
            debug!(records = stats.records, bytes = stats.bytes, "segment replicated");
            "OK".into_response()
        }
    }
}

/// Copy the body into a fresh segment, validating every record. A parse
/// or write failure discards the half-written segment.
fn persist(segments: &Queue, body: &[u8]) -> Result<Option<CopyStats>, Error> {
    let mut segment = segments
        .enqueue()
        .map_err(|e| Error::Internal(e.to_string()))?;

    let mut src = body;
    match records::copy_records(&mut segment, &mut src) {
        Err(e) => {
            let _ = segment.delete();
            Err(e)
        }
        Ok(stats) if stats.records == 0 => {
            let _ = segment.delete();
            Ok(None)
        }
        Ok(stats) => {
            segment
                .sync()
                .and_then(|_| segment.close())
                .map_err(|e| Error::Internal(e.to_string()))?;
            Ok(Some(stats))
        }
    }
}
