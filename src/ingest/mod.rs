// src/ingest/mod.rs
pub mod buffer;
pub mod dedup;
pub mod types;
pub mod validate;

use std::sync::Arc;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use tokio::sync::Notify;

use crate::config::StreamDescriptor;
use crate::detector::CriticalEventDetector;
use crate::gateway::DynGateway;
use crate::ingest::buffer::BufferSet;
use crate::ingest::dedup::DedupCache;
use crate::ingest::types::{RawRecord, RecordBody};
use crate::ingest::validate::ValidatorConfig;
use crate::stats::StreamStats;

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_events_total", "Raw arrivals across all streams.");
        describe_counter!(
            "ingest_valid_total",
            "Records that survived validation and cleaning."
        );
        describe_counter!(
            "ingest_invalid_total",
            "Records dropped by validation, labeled by reason."
        );
        describe_counter!(
            "ingest_filtered_total",
            "Records dropped by a descriptor's source filter."
        );
        describe_counter!(
            "ingest_dedup_total",
            "Records suppressed by the deduplication cache."
        );
        describe_counter!(
            "ingest_persist_errors_total",
            "Persistence gateway failures on the hot path."
        );
        describe_counter!(
            "buffer_evictions_total",
            "Drop-oldest evictions, labeled by category."
        );
        describe_counter!("stream_errors_total", "Connection errors per stream.");
        describe_counter!("stream_reconnects_total", "Reconnect attempts per stream.");
        describe_counter!("batch_runs_total", "Batch processor cycles.");
        describe_gauge!("ingest_last_record_ts", "Unix ts of the last valid record.");
    });
}

/// The per-record path every stream unit funnels into: validate, dedup,
/// buffer, persist, stats, escalate. Owns no tasks itself.
pub struct Dispatcher {
    validator: ValidatorConfig,
    dedup: Arc<DedupCache>,
    buffers: Arc<BufferSet>,
    detector: Arc<CriticalEventDetector>,
    gateway: DynGateway,
    high_water: usize,
    batch_trigger: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        validator: ValidatorConfig,
        dedup: Arc<DedupCache>,
        buffers: Arc<BufferSet>,
        detector: Arc<CriticalEventDetector>,
        gateway: DynGateway,
        high_water: usize,
        batch_trigger: Arc<Notify>,
    ) -> Self {
        ensure_metrics_described();
        Self {
            validator,
            dedup,
            buffers,
            detector,
            gateway,
            high_water,
            batch_trigger,
        }
    }

    pub fn buffers(&self) -> &Arc<BufferSet> {
        &self.buffers
    }

    /// Process one raw arrival in order. Never returns an error: every
    /// failure class below is logged, counted, and contained.
    pub async fn process_raw(
        &self,
        descriptor: &StreamDescriptor,
        stats: &StreamStats,
        raw: RawRecord,
    ) {
        let now = now_unix();
        stats.record_message(now);
        counter!("ingest_events_total").increment(1);

        let cleaned = match validate::clean(&raw, now, &self.validator) {
            Ok(c) => c,
            Err(reason) => {
                counter!("ingest_invalid_total", "reason" => reason.label()).increment(1);
                tracing::debug!(
                    stream = %descriptor.name,
                    category = %raw.category,
                    %reason,
                    "record dropped"
                );
                return;
            }
        };

        // Source filtering applies where the payload names its source.
        if let RecordBody::VesselPosition(v) = &cleaned.body {
            if !descriptor.accepts_source(v.source.as_deref()) {
                counter!("ingest_filtered_total").increment(1);
                return;
            }
        }

        stats.record_valid();
        counter!("ingest_valid_total").increment(1);
        gauge!("ingest_last_record_ts").set(now as f64);

        if !self.dedup.check_and_insert(&cleaned.dedup_key()) {
            counter!("ingest_dedup_total").increment(1);
            return;
        }

        let category = cleaned.category();
        self.buffers.append(cleaned.clone());

        if let Err(e) = self
            .gateway
            .store(category, std::slice::from_ref(&cleaned))
            .await
        {
            counter!("ingest_persist_errors_total").increment(1);
            tracing::warn!(error = ?e, stream = %descriptor.name, "persistence failed");
        }

        self.detector.offer(&cleaned).await;

        if self.buffers.len(category) >= self.high_water {
            self.batch_trigger.notify_one();
        }
    }
}

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
