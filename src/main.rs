//! Maritime Flow Monitor — Binary Entrypoint
//! Boots the ingestion pipeline: stream supervisor, batch processor,
//! dedup sweeper, and the ops HTTP surface, with graceful shutdown.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use maritime_flow_monitor::analytics::ThresholdAnalytics;
use maritime_flow_monitor::api::{self, OpsState, PrometheusExporter};
use maritime_flow_monitor::batch::BatchProcessor;
use maritime_flow_monitor::config;
use maritime_flow_monitor::detector::CriticalEventDetector;
use maritime_flow_monitor::gateway::{DynAnalytics, DynGateway, JsonlGateway};
use maritime_flow_monitor::ingest::buffer::BufferSet;
use maritime_flow_monitor::ingest::dedup::{spawn_ttl_sweeper, DedupCache};
use maritime_flow_monitor::ingest::Dispatcher;
use maritime_flow_monitor::stats::StatisticsRegistry;
use maritime_flow_monitor::stream::connection::default_transport_factory;
use maritime_flow_monitor::stream::limiter::RateLimiter;
use maritime_flow_monitor::stream::StreamSupervisor;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = config::load_default().context("loading pipeline config")?;
    let (streams, rejected) = cfg.partition_streams();
    if rejected > 0 {
        tracing::warn!(rejected, "malformed stream descriptors were skipped");
    }
    tracing::info!(streams = streams.len(), "pipeline configuration loaded");

    let exporter = PrometheusExporter::init(cfg.dedup.ttl_secs);

    let state_dir = std::env::var("STATE_DIR").unwrap_or_else(|_| "state".to_string());
    let gateway: DynGateway = Arc::new(JsonlGateway::new(state_dir));
    let analytics: DynAnalytics = Arc::new(ThresholdAnalytics::new());

    let buffers = Arc::new(BufferSet::new(cfg.buffer.capacity));
    let dedup = Arc::new(DedupCache::new(&cfg.dedup));
    let stats = Arc::new(StatisticsRegistry::new());

    let detector = Arc::new(CriticalEventDetector::new(
        cfg.detector.clone(),
        Arc::clone(&analytics),
        Arc::clone(&gateway),
    ));
    let batch = Arc::new(BatchProcessor::new(
        cfg.batch.clone(),
        Arc::clone(&buffers),
        Arc::clone(&analytics),
        Arc::clone(&gateway),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        cfg.validator.clone(),
        Arc::clone(&dedup),
        Arc::clone(&buffers),
        detector,
        Arc::clone(&gateway),
        cfg.buffer.high_water,
        batch.trigger_handle(),
    ));

    let limiter = Arc::new(RateLimiter::new());
    let factory = default_transport_factory(Arc::clone(&limiter));
    let supervisor = Arc::new(StreamSupervisor::new(
        streams,
        dispatcher,
        limiter,
        Arc::clone(&stats),
        factory,
    ));

    supervisor.start().await;
    let batch_task = Arc::clone(&batch).spawn(supervisor.shutdown_receiver());
    let sweeper_task = spawn_ttl_sweeper(
        Arc::clone(&dedup),
        &cfg.dedup,
        supervisor.shutdown_receiver(),
    );

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let router = api::create_router(OpsState {
        stats: Arc::clone(&stats),
        buffers: Arc::clone(&buffers),
    })
    .merge(exporter.router());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .context("binding ops listener")?;
    tracing::info!(port, "ops surface listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving ops surface")?;

    tracing::info!("shutdown signal received; stopping streams");
    supervisor.stop().await;
    let _ = batch_task.await;
    let _ = sweeper_task.await;

    let final_snapshot = stats.snapshot(&buffers);
    tracing::info!(
        streams = final_snapshot.total_streams,
        connected = final_snapshot.connected_count,
        "pipeline stopped"
    );
    Ok(())
}
