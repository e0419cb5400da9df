// tests/api_http.rs
// Ops router smoke tests via tower's oneshot.

use std::sync::Arc;

use axum::body::Body;
use http::{Request, StatusCode};
use tower::ServiceExt;

use maritime_flow_monitor::api::{create_router, OpsState};
use maritime_flow_monitor::ingest::buffer::BufferSet;
use maritime_flow_monitor::ingest::types::{CleanedRecord, EconomicIndicator, RecordBody};
use maritime_flow_monitor::stats::{StatisticsRegistry, StreamState};

fn state() -> OpsState {
    let stats = Arc::new(StatisticsRegistry::new());
    let buffers = Arc::new(BufferSet::new(10));

    let s = stats.register("ais-north");
    s.set_state(StreamState::Connected);
    s.record_message(1_700_000_000);
    s.record_valid();

    buffers.append(CleanedRecord {
        body: RecordBody::Economic(EconomicIndicator {
            name: "baltic_dry".into(),
            value: 1400.0,
            change_pct: 0.5,
            ts_unix: 1_700_000_000,
        }),
        quality: 0.8,
        processed_at: 1_700_000_000,
    });

    OpsState { stats, buffers }
}

#[tokio::test]
async fn health_answers_ok() {
    let app = create_router(state());
    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn stats_snapshot_reports_streams_and_buffers() {
    let app = create_router(state());
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(json["total_streams"], 1);
    assert_eq!(json["connected_count"], 1);
    assert_eq!(json["per_stream"][0]["name"], "ais-north");
    assert_eq!(json["per_stream"][0]["messages_received"], 1);
    assert_eq!(json["per_stream"][0]["valid_records"], 1);
    assert_eq!(json["per_stream"][0]["state"], "connected");
    assert_eq!(json["buffer_occupancy"]["economic"], 1);
    assert_eq!(json["buffer_occupancy"]["news"], 0);
}
