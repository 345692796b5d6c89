//! The consumer state machine.
//!
//! The loop is a four-state trampoline: gather accumulates segments into
//! the active batch, replicate pushes the merged batch to R stores,
//! commit and fail tell every contributing ingester the batch's fate and
//! reset. Every step runs under the batch mutex so an external stop
//! serializes cleanly with the stepper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use hopper_cluster::{Client, NodeType, Peer};
use hopper_common::metrics::ConsumerMetrics;
use hopper_common::records;

use crate::config::ConsumerConfig;

/// Phase of the consumer loop. Each tick runs the current phase and
/// replaces it with the returned one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Gather,
    Replicate,
    Commit,
    Fail,
}

/// The batch under construction.
///
/// Whenever `active` is non-empty, `pending` is non-empty and
/// `active_since` is set; commit and fail reset all of it together.
#[derive(Default)]
struct Batch {
    /// Merged records gathered so far.
    active: Vec<u8>,
    /// When the first segment was merged into `active`.
    active_since: Option<Instant>,
    /// Reservation ids contributed per ingester endpoint.
    pending: HashMap<String, Vec<String>>,
    /// Consecutive transient gather failures for this batch.
    gather_errors: usize,
}

impl Batch {
    fn reset(&mut self) {
        self.active.clear();
        self.active_since = None;
        self.pending.clear();
        self.gather_errors = 0;
    }
}

struct Inner {
    peer: Arc<dyn Peer>,
    client: Arc<dyn Client>,
    config: ConsumerConfig,
    metrics: Arc<ConsumerMetrics>,
    batch: Mutex<Batch>,
}

/// Handle onto a running consumer task.
pub struct Consumer {
    inner: Arc<Inner>,
    stop: mpsc::Sender<oneshot::Sender<()>>,
}

impl Consumer {
    /// Spawn the consumer loop.
    pub fn new(
        peer: Arc<dyn Peer>,
        client: Arc<dyn Client>,
        config: ConsumerConfig,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        let inner = Arc::new(Inner {
            peer,
            client,
            config,
            metrics,
            batch: Mutex::new(Batch::default()),
        });
        let (stop, stop_rx) = mpsc::channel(1);
        tokio::spawn(run(inner.clone(), stop_rx));
        Self { inner, stop }
    }

    /// Stop the loop. The current batch is failed first so every
    /// contributing ingester releases its reservations promptly.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.stop.send(tx).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Bytes currently buffered in the active batch, taken under the
    /// step mutex.
    pub async fn active_bytes(&self) -> usize {
        self.inner.batch.lock().await.active.len()
    }
}

async fn run(inner: Arc<Inner>, mut stop: mpsc::Receiver<oneshot::Sender<()>>) {
    let mut tick = tokio::time::interval(inner.config.step_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut state = State::Gather;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let mut batch = inner.batch.lock().await;
                state = inner.step(state, &mut batch).await;
            }

            ack = stop.recv() => {
                let mut batch = inner.batch.lock().await;
                inner.fail(&mut batch).await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return;
            }
        }
    }
}

impl Inner {
    async fn step(&self, state: State, batch: &mut Batch) -> State {
        match state {
            State::Gather => self.gather(batch).await,
            State::Replicate => self.replicate(batch).await,
            State::Commit => self.commit(batch).await,
            State::Fail => self.fail(batch).await,
        }
    }

    /// Accumulate one more segment into the active batch, or decide the
    /// batch is ready (or hopeless) and move on.
    async fn gather(&self, batch: &mut Batch) -> State {
        let ingesters = match self.peer.current(NodeType::Ingest) {
            Ok(list) => list,
            Err(e) => {
                warn!(state = "gather", error = %e, "membership lookup failed");
                tokio::time::sleep(self.config.wait_time).await;
                return State::Gather;
            }
        };

        // Break out of a batch that keeps failing to grow: flush what we
        // have, or reset and keep trying if there's nothing to flush.
        let give_up = self.config.gather_error_multiplier * ingesters.len();
        if batch.gather_errors > 0 && batch.gather_errors > give_up {
            if batch.active.is_empty() {
                batch.gather_errors = 0;
                return State::Gather;
            }
            return State::Replicate;
        }

        if ingesters.is_empty() {
            return State::Gather;
        }

        // No point consuming segments we can't replicate afterwards.
        let stores = match self.peer.current(NodeType::Store) {
            Ok(list) => list,
            Err(e) => {
                warn!(state = "gather", error = %e, "membership lookup failed");
                return State::Gather;
            }
        };
        if stores.len() < self.config.replication_factor {
            warn!(
                state = "gather",
                replication_factor = self.config.replication_factor,
                available_stores = stores.len(),
                "replication currently impossible",
            );
            tokio::time::sleep(self.config.wait_time).await;
            batch.gather_errors += 1;
            return State::Gather;
        }

        let too_big = batch.active.len() as u64 > self.config.segment_target_size;
        let too_old = batch
            .active_since
            .map_or(false, |since| since.elapsed() > self.config.segment_target_age);
        if too_big || too_old {
            return State::Replicate;
        }

        // Reserve the next segment on a random ingester.
        let ingester = match ingesters.choose(&mut rand::thread_rng()) {
            Some(ingester) => ingester.clone(),
            None => return State::Gather,
        };
        let next_url = format!("http://{ingester}/ingest/next");
        let resp = match self.client.get(&next_url).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(ingester = %ingester, during = "next", error = %e, "gather failed");
                batch.gather_errors += 1;
                return State::Gather;
            }
        };
        match resp.status() {
            200 => {}
            // Routine: the ingester has nothing to give right now.
            404 => {
                batch.gather_errors += 1;
                return State::Gather;
            }
            status => {
                warn!(ingester = %ingester, during = "next", status, "gather failed");
                batch.gather_errors += 1;
                return State::Gather;
            }
        }
        let id = resp.text().trim().to_string();

        // From here on the reservation is part of the batch: it must be
        // committed or failed along with everything else.
        batch
            .pending
            .entry(ingester.clone())
            .or_default()
            .push(id.clone());

        let read_url = format!("http://{ingester}/ingest/read?id={id}");
        let resp = match self.client.get(&read_url).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(ingester = %ingester, during = "read", error = %e, "batch poisoned");
                batch.gather_errors += 1;
                return State::Fail;
            }
        };
        if resp.status() != 200 {
            warn!(
                ingester = %ingester,
                during = "read",
                status = resp.status(),
                "batch poisoned",
            );
            batch.gather_errors += 1;
            return State::Fail;
        }

        let body = resp.body().clone();
        let mut src: &[u8] = &body;
        if let Err(e) =
            records::merge_records(&mut batch.active, &mut [&mut src as &mut dyn std::io::Read])
        {
            warn!(ingester = %ingester, during = "merge", error = %e, "batch poisoned");
            batch.gather_errors += 1;
            return State::Fail;
        }
        if batch.active_since.is_none() {
            batch.active_since = Some(Instant::now());
        }

        self.metrics.consumed_segments.inc();
        self.metrics.consumed_bytes.inc_by(body.len() as f64);
        debug!(ingester = %ingester, reservation = %id, bytes = body.len(), "segment gathered");
        State::Gather
    }

    /// Push the active batch to stores until `replication_factor` of
    /// them have acknowledged it. Partial replication fails the batch.
    async fn replicate(&self, batch: &mut Batch) -> State {
        let stores = match self.peer.current(NodeType::Store) {
            Ok(list) => list,
            Err(e) => {
                warn!(state = "replicate", error = %e, "membership lookup failed");
                return State::Fail;
            }
        };
        if stores.len() < self.config.replication_factor {
            warn!(
                state = "replicate",
                replication_factor = self.config.replication_factor,
                available_stores = stores.len(),
                "replication currently impossible",
            );
            return State::Fail;
        }

        let mut order: Vec<usize> = (0..stores.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut replicated = 0;
        for index in order {
            if replicated >= self.config.replication_factor {
                break;
            }
            let target = &stores[index];
            let url = format!("http://{target}/store/replicate");
            let body = Bytes::copy_from_slice(&batch.active);
            match self.client.post(&url, body).await {
                Err(e) => {
                    warn!(target = %target, during = "replicate", error = %e, "replicate failed");
                }
                Ok(resp) if resp.status() != 200 => {
                    warn!(
                        target = %target,
                        during = "replicate",
                        status = resp.status(),
                        "replicate refused",
                    );
                }
                Ok(_) => replicated += 1,
            }
        }

        if replicated < self.config.replication_factor {
            warn!(
                want = self.config.replication_factor,
                have = replicated,
                "failed to fully replicate",
            );
            return State::Fail;
        }

        self.metrics.replicated_segments.inc();
        self.metrics.replicated_bytes.inc_by(batch.active.len() as f64);
        State::Commit
    }

    async fn commit(&self, batch: &mut Batch) -> State {
        self.reset_via(batch, "commit").await
    }

    async fn fail(&self, batch: &mut Batch) -> State {
        self.reset_via(batch, "failed").await
    }

    /// Tell every contributing ingester the batch's fate, one task per
    /// reservation, then reset.
    ///
    /// Best-effort on purpose: a missed commit gets the segment
    /// re-replicated, a missed fail times out on the ingester; either
    /// way the queue re-offers it.
    async fn reset_via(&self, batch: &mut Batch, op: &'static str) -> State {
        let mut posts = Vec::new();
        for (ingester, ids) in batch.pending.drain() {
            for id in ids {
                let client = self.client.clone();
                let url = format!("http://{ingester}/ingest/{op}?id={id}");
                posts.push(tokio::spawn(async move {
                    match client.post(&url, Bytes::new()).await {
                        Err(e) => {
                            warn!(url = %url, error = %e, "batch finalization post failed");
                        }
                        Ok(resp) if resp.status() != 200 => {
                            warn!(
                                url = %url,
                                status = resp.status(),
                                "batch finalization post refused",
                            );
                        }
                        Ok(_) => {}
                    }
                }));
            }
        }
        let _ = join_all(posts).await;

        batch.reset();
        State::Gather
    }
}
