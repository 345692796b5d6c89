//! The ingest API driver and its HTTP surface.
//!
//! All reservation state is owned by a single spawned task, the driver.
//! HTTP handlers never touch it directly: they submit a closure over a
//! channel and await the reply on a oneshot, so no two handlers can ever
//! observe the table mid-mutation and no lock is held across request I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

use hopper_common::metrics::IngestMetrics;
use hopper_common::records;
use hopper_common::Error;
use hopper_queue::Queue;

use crate::config::IngestConfig;

/// A dequeued segment checked out to at most one reader.
struct Reservation {
    segment: hopper_queue::ReadSegment,
    deadline: Instant,
    reading: bool,
}

/// State owned exclusively by the driver task.
struct ApiState {
    queue: Queue,
    timeout: Duration,
    pending: HashMap<Uuid, Reservation>,
    metrics: Arc<IngestMetrics>,
}

impl ApiState {
    /// Fail every reservation past its deadline, making the segment
    /// available for consumption again. A failed release is logged and
    /// the reservation dropped regardless; queue recovery picks the
    /// segment up on the next process start if the rename never lands.
    fn clean(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, r)| now > r.deadline)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(mut reservation) = self.pending.remove(&id) {
                if let Err(e) = reservation.segment.failed() {
                    warn!(reservation = %id, error = %e, "failed to release expired segment");
                }
                debug!(reservation = %id, "reservation expired");
                self.metrics.failed_segments.inc();
            }
        }
    }
}

type Action = Box<dyn FnOnce(&mut ApiState) + Send>;

async fn drive(
    mut state: ApiState,
    mut actions: mpsc::Receiver<Action>,
    mut stop: mpsc::Receiver<oneshot::Sender<()>>,
    clean_interval: Duration,
) {
    let mut tick = tokio::time::interval(clean_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            Some(action) = actions.recv() => action(&mut state),

            _ = tick.tick() => state.clean(Instant::now()),

            ack = stop.recv() => {
                // Force-fail everything outstanding, then exit.
                state.clean(Instant::now() + state.timeout * 10);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return;
            }
        }
    }
}

/// Handle onto the ingest driver. Cloning shares the same driver task.
#[derive(Clone)]
pub struct IngestApi {
    actions: mpsc::Sender<Action>,
    stop: mpsc::Sender<oneshot::Sender<()>>,
    metrics: Arc<IngestMetrics>,
}

impl IngestApi {
    /// Spawn the driver over the given queue and return a handle.
    pub fn new(queue: Queue, config: IngestConfig, metrics: Arc<IngestMetrics>) -> Self {
        let (actions, action_rx) = mpsc::channel(64);
        let (stop, stop_rx) = mpsc::channel(1);
        let state = ApiState {
            queue,
            timeout: config.pending_timeout,
            pending: HashMap::new(),
            metrics: metrics.clone(),
        };
        tokio::spawn(drive(state, action_rx, stop_rx, config.clean_interval));
        Self {
            actions,
            stop,
            metrics,
        }
    }

    /// Stop the driver, force-failing every outstanding reservation.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.stop.send(tx).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Router for this API; the server nests it under `/ingest`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", post(handle_append))
            .route("/next", get(handle_next))
            .route("/read", get(handle_read))
            .route("/commit", post(handle_commit))
            .route("/failed", post(handle_failed))
            .layer(middleware::from_fn_with_state(
                self.metrics.clone(),
                track_request,
            ))
            .with_state(self.clone())
    }

    /// Run a closure on the driver and await its reply. `None` means the
    /// driver is gone (stopped).
    async fn submit<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ApiState) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let action: Action = Box::new(move |state| {
            let _ = tx.send(f(state));
        });
        if self.actions.send(action).await.is_err() {
            return None;
        }
        rx.await.ok()
    }
}

async fn track_request(
    State(metrics): State<Arc<IngestMetrics>>,
    req: Request,
    next: Next,
) -> Response {
    metrics.connected_clients.inc();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let begin = Instant::now();

    let resp = next.run(req).await;

    metrics.connected_clients.dec();
    metrics
        .api_duration
        .with_label_values(&[&method, &path, resp.status().as_str()])
        .observe(begin.elapsed().as_secs_f64());
    resp
}

#[derive(Deserialize)]
struct IdParam {
    id: String,
}

impl IdParam {
    /// An id that doesn't parse can't be in the table, so it behaves
    /// like any other unknown reservation.
    fn uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(self.id.trim()).ok()
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

fn internal_error(message: String) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}

fn driver_gone() -> Response {
    internal_error("ingest driver is not running".to_string())
}

enum AppendOutcome {
    NoRecords,
    Written(records::CopyStats),
}

async fn handle_append(State(api): State<IngestApi>, body: Bytes) -> Response {
    let segment = match api
        .submit(|state| state.queue.enqueue().map_err(|e| e.to_string()))
        .await
    {
        None => return driver_gone(),
        Some(Err(e)) => return internal_error(e),
        Some(Ok(segment)) => segment,
    };

    // Validate and persist outside the driver's critical section.
    let written = tokio::task::spawn_blocking(move || {
        let mut segment = segment;
        let mut src: &[u8] = &body;
        match records::copy_records(&mut segment, &mut src) {
            Err(e) => {
                let _ = segment.delete();
                Err(e)
            }
            Ok(stats) if stats.records == 0 => {
                let _ = segment.delete();
                Ok(AppendOutcome::NoRecords)
            }
            Ok(stats) => {
                segment
                    .sync()
                    .and_then(|_| segment.close())
                    .map_err(|e| Error::Internal(e.to_string()))?;
                Ok(AppendOutcome::Written(stats))
            }
        }
    })
    .await;

    match written {
        Err(join) => internal_error(join.to_string()),
        Ok(Err(e)) if e.is_invalid_uuid() => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Ok(Err(e)) => internal_error(e.to_string()),
        Ok(Ok(AppendOutcome::NoRecords)) => "No records".into_response(),
        Ok(Ok(AppendOutcome::Written(stats))) => {
            api.metrics.ingested_records.inc_by(stats.records as f64);
            api.metrics.ingested_bytes.inc_by(stats.bytes as f64);
            "OK".into_response()
        }
    }
}

enum NextReply {
    Id(Uuid),
    Empty,
    Err(String),
}

async fn handle_next(State(api): State<IngestApi>) -> Response {
    let reply = api
        .submit(|state| match state.queue.dequeue() {
            Err(e) if e.is_no_segments() => NextReply::Empty,
            Err(e) => NextReply::Err(e.to_string()),
            Ok(segment) => {
                let id = Uuid::new_v4();
                let deadline = Instant::now() + state.timeout;
                state.pending.insert(
                    id,
                    Reservation {
                        segment,
                        deadline,
                        reading: false,
                    },
                );
                debug!(reservation = %id, "segment reserved");
                NextReply::Id(id)
            }
        })
        .await;

    match reply {
        None => driver_gone(),
        Some(NextReply::Empty) => not_found(),
        Some(NextReply::Err(e)) => internal_error(e),
        Some(NextReply::Id(id)) => id.to_string().into_response(),
    }
}

enum ReadReply {
    Stream(std::fs::File),
    NotFound,
    AlreadyReading,
    Err(String),
}

async fn handle_read(State(api): State<IngestApi>, Query(params): Query<IdParam>) -> Response {
    let id = match params.uuid() {
        Some(id) => id,
        None => return not_found(),
    };

    let reply = api
        .submit(move |state| match state.pending.get_mut(&id) {
            None => ReadReply::NotFound,
            Some(r) if r.reading => ReadReply::AlreadyReading,
            Some(r) => match r.segment.reader() {
                Ok(file) => {
                    r.reading = true;
                    ReadReply::Stream(file)
                }
                Err(e) => ReadReply::Err(e.to_string()),
            },
        })
        .await;

    match reply {
        None => driver_gone(),
        Some(ReadReply::NotFound) => not_found(),
        Some(ReadReply::AlreadyReading) => {
            internal_error("another client is already reading this segment".to_string())
        }
        Some(ReadReply::Err(e)) => internal_error(e),
        Some(ReadReply::Stream(file)) => {
            // Stream outside the driver so a slow client can't stall it.
            let stream = ReaderStream::new(tokio::fs::File::from_std(file));
            Body::from_stream(stream).into_response()
        }
    }
}

enum CommitReply {
    Ok(u64),
    NotFound,
    NotRead,
    Err(String),
}

async fn handle_commit(State(api): State<IngestApi>, Query(params): Query<IdParam>) -> Response {
    let id = match params.uuid() {
        Some(id) => id,
        None => return not_found(),
    };

    let reply = api
        .submit(move |state| match state.pending.get_mut(&id) {
            None => CommitReply::NotFound,
            Some(r) if !r.reading => CommitReply::NotRead,
            Some(r) => {
                let size = r.segment.size();
                match r.segment.commit() {
                    // On error the reservation stays put; it will time
                    // out and be failed by the sweep.
                    Err(e) => CommitReply::Err(e.to_string()),
                    Ok(()) => {
                        state.pending.remove(&id);
                        state.metrics.committed_segments.inc();
                        state.metrics.committed_bytes.inc_by(size as f64);
                        CommitReply::Ok(size)
                    }
                }
            }
        })
        .await;

    match reply {
        None => driver_gone(),
        Some(CommitReply::NotFound) => not_found(),
        Some(CommitReply::NotRead) => (
            StatusCode::PRECONDITION_REQUIRED,
            "segment hasn't been read yet; can't commit",
        )
            .into_response(),
        Some(CommitReply::Err(e)) => internal_error(e),
        Some(CommitReply::Ok(_)) => "Commit OK".into_response(),
    }
}

enum FailedReply {
    Ok,
    NotFound,
    Err(String),
}

async fn handle_failed(State(api): State<IngestApi>, Query(params): Query<IdParam>) -> Response {
    let id = match params.uuid() {
        Some(id) => id,
        None => return not_found(),
    };

    let reply = api
        .submit(move |state| match state.pending.get_mut(&id) {
            None => FailedReply::NotFound,
            Some(r) => match r.segment.failed() {
                Err(e) => FailedReply::Err(e.to_string()),
                Ok(()) => {
                    state.pending.remove(&id);
                    state.metrics.failed_segments.inc();
                    FailedReply::Ok
                }
            },
        })
        .await;

    match reply {
        None => driver_gone(),
        Some(FailedReply::NotFound) => not_found(),
        Some(FailedReply::Err(e)) => internal_error(e),
        Some(FailedReply::Ok) => "Failed OK".into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use axum::http::Request as HttpRequest;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;

    const ID_A: &str = "9f2c7a4e-1b3d-4e5f-8a6b-0c1d2e3f4a5b";
    const ID_B: &str = "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9";

    fn test_api(dir: &TempDir) -> IngestApi {
        let queue = Queue::open(dir.path()).unwrap();
        IngestApi::new(
            queue,
            IngestConfig::default(),
            Arc::new(IngestMetrics::new()),
        )
    }

    async fn call(router: &Router, method: &str, uri: &str, body: &[u8]) -> (StatusCode, String) {
        let request = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_vec()))
            .unwrap();
        let resp = router.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn segment_files(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n != "LOCK")
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn next_on_empty_queue_is_not_found() {
        let dir = TempDir::new().unwrap();
        let router = test_api(&dir).router();

        let (status, _) = call(&router, "GET", "/next", b"").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn append_next_read_commit_round_trip() {
        let dir = TempDir::new().unwrap();
        let router = test_api(&dir).router();
        let records = format!("{ID_A} x\n{ID_B} y\n");

        let (status, body) = call(&router, "POST", "/", records.as_bytes()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
        assert!(segment_files(dir.path())[0].ends_with(".flushed"));

        let (status, id) = call(&router, "GET", "/next", b"").await;
        assert_eq!(status, StatusCode::OK);
        Uuid::parse_str(id.trim()).unwrap();

        let (status, streamed) = call(&router, "GET", &format!("/read?id={id}"), b"").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(streamed, records);

        let (status, body) = call(&router, "POST", &format!("/commit?id={id}"), b"").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Commit OK");

        assert!(segment_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn commit_before_read_is_precondition_required() {
        let dir = TempDir::new().unwrap();
        let router = test_api(&dir).router();

        call(&router, "POST", "/", format!("{ID_A} x\n").as_bytes()).await;
        let (_, id) = call(&router, "GET", "/next", b"").await;

        let (status, _) = call(&router, "POST", &format!("/commit?id={id}"), b"").await;
        assert_eq!(status, StatusCode::PRECONDITION_REQUIRED);
    }

    #[tokio::test]
    async fn second_read_is_rejected() {
        let dir = TempDir::new().unwrap();
        let router = test_api(&dir).router();

        call(&router, "POST", "/", format!("{ID_A} x\n").as_bytes()).await;
        let (_, id) = call(&router, "GET", "/next", b"").await;

        let (status, _) = call(&router, "GET", &format!("/read?id={id}"), b"").await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&router, "GET", &format!("/read?id={id}"), b"").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("already reading"));
    }

    #[tokio::test]
    async fn unknown_reservations_are_not_found() {
        let dir = TempDir::new().unwrap();
        let router = test_api(&dir).router();
        let id = Uuid::new_v4();

        for (method, uri) in [
            ("GET", format!("/read?id={id}")),
            ("POST", format!("/commit?id={id}")),
            ("POST", format!("/failed?id={id}")),
            ("GET", "/read?id=not-a-uuid".to_string()),
        ] {
            let (status, _) = call(&router, method, &uri, b"").await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn failed_requeues_the_segment() {
        let dir = TempDir::new().unwrap();
        let router = test_api(&dir).router();

        call(&router, "POST", "/", format!("{ID_A} x\n").as_bytes()).await;
        let (_, id) = call(&router, "GET", "/next", b"").await;

        let (status, body) = call(&router, "POST", &format!("/failed?id={id}"), b"").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Failed OK");
        assert!(segment_files(dir.path())[0].ends_with(".flushed"));

        // The same segment comes back under a fresh reservation.
        let (status, second) = call(&router, "GET", "/next", b"").await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(second, id);
    }

    #[tokio::test]
    async fn append_rejects_invalid_records() {
        let dir = TempDir::new().unwrap();
        let router = test_api(&dir).router();

        let (status, _) = call(&router, "POST", "/", b"bogus record\n").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(segment_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn append_without_records_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let router = test_api(&dir).router();

        let (status, body) = call(&router, "POST", "/", b"").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "No records");
        assert!(segment_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn clean_fails_expired_reservations() {
        let dir = TempDir::new().unwrap();
        let queue = Queue::open(dir.path()).unwrap();
        {
            use std::io::Write;
            let mut segment = queue.enqueue().unwrap();
            segment.write_all(format!("{ID_A} x\n").as_bytes()).unwrap();
            segment.close().unwrap();
        }

        let metrics = Arc::new(IngestMetrics::new());
        let mut state = ApiState {
            timeout: Duration::from_secs(10),
            pending: HashMap::new(),
            metrics: metrics.clone(),
            queue,
        };

        let segment = state.queue.dequeue().unwrap();
        state.pending.insert(
            Uuid::new_v4(),
            Reservation {
                segment,
                deadline: Instant::now() + Duration::from_secs(10),
                reading: false,
            },
        );

        // Not yet expired.
        state.clean(Instant::now());
        assert_eq!(state.pending.len(), 1);

        // Well past the deadline.
        state.clean(Instant::now() + Duration::from_secs(30));
        assert!(state.pending.is_empty());
        assert_eq!(metrics.failed_segments.get(), 1.0);
        assert!(segment_files(dir.path())[0].ends_with(".flushed"));
    }

    #[tokio::test]
    async fn stop_force_fails_outstanding_reservations() {
        let dir = TempDir::new().unwrap();
        let api = test_api(&dir);
        let router = api.router();

        call(&router, "POST", "/", format!("{ID_A} x\n").as_bytes()).await;
        let (_, _id) = call(&router, "GET", "/next", b"").await;
        assert!(segment_files(dir.path())[0].ends_with(".pending"));

        api.stop().await;
        assert!(segment_files(dir.path())[0].ends_with(".flushed"));
    }
}
