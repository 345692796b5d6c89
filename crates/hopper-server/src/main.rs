use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{routing::get, Json, Router};
use clap::Parser;
use prometheus::Registry;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use hopper_cluster::{HttpClient, Peer, StaticPeer};
use hopper_common::metrics::{metrics_router, ConsumerMetrics, IngestMetrics, StoreMetrics};
use hopper_consumer::{Consumer, ConsumerConfig};
use hopper_ingest::{IngestApi, IngestConfig};
use hopper_queue::Queue;
use hopper_store::StoreApi;

#[derive(Parser, Debug)]
#[command(
    name = "hopper",
    about = "hopper - a small distributed record-segment ingestion cluster",
    version
)]
struct Cli {
    /// Listen address for the HTTP API
    #[arg(long, env = "HOPPER_API_ADDR", default_value = "0.0.0.0:7650")]
    api_addr: SocketAddr,

    /// Directory for the ingest segment queue
    #[arg(long, env = "HOPPER_QUEUE_DIR", default_value = "./data/ingest")]
    queue_dir: PathBuf,

    /// Directory for replicated store segments
    #[arg(long, env = "HOPPER_STORE_DIR", default_value = "./data/store")]
    store_dir: PathBuf,

    /// Seconds a reserved segment may stay checked out before it is
    /// failed back into the queue
    #[arg(long, env = "HOPPER_PENDING_TIMEOUT_SECS", default_value = "10")]
    pending_timeout_secs: u64,

    /// Flush the consumer's batch beyond this many bytes
    #[arg(long, env = "HOPPER_SEGMENT_TARGET_SIZE", default_value_t = 16 * 1024 * 1024)]
    segment_target_size: u64,

    /// Flush the consumer's batch beyond this age in seconds
    #[arg(long, env = "HOPPER_SEGMENT_TARGET_AGE_SECS", default_value = "30")]
    segment_target_age_secs: u64,

    /// Stores that must acknowledge a batch before it commits
    #[arg(long, env = "HOPPER_REPLICATION_FACTOR", default_value = "2")]
    replication_factor: usize,

    /// Ingest peer host:port (repeatable)
    #[arg(long = "ingest-peer", env = "HOPPER_INGEST_PEERS", value_delimiter = ',')]
    ingest_peers: Vec<String>,

    /// Store peer host:port (repeatable)
    #[arg(long = "store-peer", env = "HOPPER_STORE_PEERS", value_delimiter = ',')]
    store_peers: Vec<String>,

    /// Serve the APIs without running the background consumer
    #[arg(long, env = "HOPPER_NO_CONSUMER")]
    no_consumer: bool,

    /// Log filter (error, warn, info, debug, trace)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.as_str())
        .init();

    info!("hopper ingest/store node");
    info!("version: {}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(Registry::new());
    let ingest_metrics = Arc::new(IngestMetrics::new());
    let store_metrics = Arc::new(StoreMetrics::new());
    let consumer_metrics = Arc::new(ConsumerMetrics::new());
    ingest_metrics.register(&registry)?;
    store_metrics.register(&registry)?;
    consumer_metrics.register(&registry)?;

    let ingest_config = IngestConfig {
        pending_timeout: Duration::from_secs(cli.pending_timeout_secs),
        ..IngestConfig::default()
    };
    let ingest = IngestApi::new(
        Queue::open(&cli.queue_dir)?,
        ingest_config,
        ingest_metrics,
    );
    let store = StoreApi::new(Queue::open(&cli.store_dir)?, store_metrics);

    let peer: Arc<dyn Peer> =
        Arc::new(StaticPeer::new(&cli.ingest_peers, &cli.store_peers)?);

    let consumer = if cli.no_consumer {
        None
    } else {
        let client = Arc::new(HttpClient::new()?);
        let consumer_config = ConsumerConfig {
            segment_target_size: cli.segment_target_size,
            segment_target_age: Duration::from_secs(cli.segment_target_age_secs),
            replication_factor: cli.replication_factor,
            ..ConsumerConfig::default()
        };
        Some(Consumer::new(
            peer.clone(),
            client,
            consumer_config,
            consumer_metrics,
        ))
    };

    let peer_state = peer.clone();
    let app = Router::new()
        .nest("/ingest", ingest.router())
        .nest("/store", store.router())
        .merge(metrics_router(registry))
        .route(
            "/cluster/state",
            get(move || {
                let peer = peer_state.clone();
                async move { Json(peer.state()) }
            }),
        )
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(cli.api_addr).await?;
    info!("API listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Release everything in flight: the consumer fails its batch, then
    // the ingest driver force-fails outstanding reservations.
    if let Some(consumer) = &consumer {
        consumer.stop().await;
    }
    ingest.stop().await;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
