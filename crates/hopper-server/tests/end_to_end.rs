//! End-to-end exercise of one node playing both roles: producer push,
//! consumer gather/replicate/commit, store persistence.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};

use hopper_cluster::{Client, HttpClient, StaticPeer};
use hopper_common::metrics::{ConsumerMetrics, IngestMetrics, StoreMetrics};
use hopper_consumer::{Consumer, ConsumerConfig};
use hopper_ingest::{IngestApi, IngestConfig};
use hopper_queue::Queue;
use hopper_store::StoreApi;

const ID_A: &str = "9f2c7a4e-1b3d-4e5f-8a6b-0c1d2e3f4a5b";
const ID_B: &str = "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9";

struct Node {
    addr: String,
    ingest_dir: TempDir,
    store_dir: TempDir,
    ingest: IngestApi,
}

/// Serve the ingest and store APIs of one node on an ephemeral port.
async fn start_node() -> Node {
    let ingest_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();

    let ingest = IngestApi::new(
        Queue::open(ingest_dir.path()).unwrap(),
        IngestConfig::default(),
        Arc::new(IngestMetrics::new()),
    );
    let store = StoreApi::new(
        Queue::open(store_dir.path()).unwrap(),
        Arc::new(StoreMetrics::new()),
    );

    let app = Router::new()
        .nest("/ingest", ingest.router())
        .nest("/store", store.router());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Node {
        addr,
        ingest_dir,
        store_dir,
        ingest,
    }
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

fn fast_consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        replication_factor: 1,
        step_interval: Duration::from_millis(10),
        wait_time: Duration::from_millis(10),
        ..ConsumerConfig::default()
    }
}

/// Wait until the store holds exactly the expected flushed segment and
/// the ingest queue has drained.
async fn await_settled(node: &Node, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let stored = segment_files(node.store_dir.path());
        let queued = segment_files(node.ingest_dir.path());
        if queued.is_empty() && stored.len() == 1 && stored[0].ends_with(".flushed") {
            let contents = fs::read(node.store_dir.path().join(&stored[0])).unwrap();
            assert_eq!(String::from_utf8_lossy(&contents), expected);
            return;
        }
        assert!(
            Instant::now() < deadline,
            "batch never settled: store={stored:?} queue={queued:?}"
        );
        sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn batch_travels_from_producer_to_store() {
    let node = start_node().await;
    let client = Arc::new(HttpClient::new().unwrap());
    let records = format!("{ID_A} first\n{ID_B} second\n");

    let resp = client
        .post(
            &format!("http://{}/ingest/", node.addr),
            Bytes::from(records.clone()),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(segment_files(node.ingest_dir.path())[0].ends_with(".flushed"));

    let peer = Arc::new(StaticPeer::new(&[node.addr.clone()], &[node.addr.clone()]).unwrap());
    let consumer = Consumer::new(
        peer,
        client.clone(),
        fast_consumer_config(),
        Arc::new(ConsumerMetrics::new()),
    );

    await_settled(&node, &records).await;

    consumer.stop().await;
    node.ingest.stop().await;
}

#[tokio::test]
async fn duplicate_records_collapse_across_batches() {
    let node = start_node().await;
    let client = Arc::new(HttpClient::new().unwrap());

    // Two producer batches sharing an identifier; the older batch's
    // record must win in the merged segment.
    for batch in [format!("{ID_A} X\n"), format!("{ID_A} Y\n{ID_B} Z\n")] {
        let resp = client
            .post(&format!("http://{}/ingest/", node.addr), Bytes::from(batch))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        // Keep the two segments' modification times apart so dequeue
        // order is stable.
        sleep(Duration::from_millis(50)).await;
    }

    let peer = Arc::new(StaticPeer::new(&[node.addr.clone()], &[node.addr.clone()]).unwrap());
    let consumer = Consumer::new(
        peer,
        client.clone(),
        fast_consumer_config(),
        Arc::new(ConsumerMetrics::new()),
    );

    await_settled(&node, &format!("{ID_A} X\n{ID_B} Z\n")).await;

    consumer.stop().await;
    node.ingest.stop().await;
}
