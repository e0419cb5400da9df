// src/api.rs
//! Operator-facing surface: health, a JSON statistics snapshot, and the
//! Prometheus exposition endpoint. Nothing here touches the ingest path;
//! it only reads shared state.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::cors::CorsLayer;

use crate::ingest::buffer::BufferSet;
use crate::stats::{StatisticsRegistry, StatsSnapshot};

#[derive(Clone)]
pub struct OpsState {
    pub stats: Arc<StatisticsRegistry>,
    pub buffers: Arc<BufferSet>,
}

pub fn create_router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/stats", get(stats_snapshot))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn stats_snapshot(State(state): State<OpsState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot(&state.buffers))
}

pub struct PrometheusExporter {
    pub handle: PrometheusHandle,
}

impl PrometheusExporter {
    /// Install the recorder and expose a static gauge for the dedup TTL.
    pub fn init(dedup_ttl_secs: u64) -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("prometheus: install recorder");
        gauge!("dedup_ttl_secs").set(dedup_ttl_secs as f64);
        Self { handle }
    }

    /// Router exposing `/metrics` in the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
