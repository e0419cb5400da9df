// src/gateway.rs
//! External collaborators behind narrow traits: the persistence store and
//! the analytics engine. Both are fire-and-forget from the pipeline's view;
//! failures are logged at the call site and ingestion continues.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ingest::types::{
    Category, CleanedRecord, EconomicIndicator, NewsItem, Severity, VesselPosition,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisruptionOrigin {
    /// Escalated straight off the ingest path by the critical-event detector.
    Immediate,
    /// Produced by a periodic batch cycle.
    Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisruptionEvent {
    pub kind: String,
    pub severity: Severity,
    pub origin: DisruptionOrigin,
    pub region: Option<String>,
    pub summary: String,
    pub ts_unix: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisruptionCandidate {
    pub kind: String,
    pub severity: Severity,
    pub region: Option<String>,
    pub summary: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Speeding,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VesselAnomaly {
    pub vessel_id: String,
    pub speed_knots: f64,
    pub kind: AnomalyKind,
    pub ts_unix: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementPrediction {
    pub vessel_id: String,
    pub lat: f64,
    pub lon: f64,
    /// Seconds ahead of the last observed position.
    pub horizon_secs: u64,
    pub confidence: f32,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn store(&self, category: Category, records: &[CleanedRecord]) -> Result<()>;
    /// Returns the stored event's id.
    async fn store_disruption(&self, event: &DisruptionEvent) -> Result<String>;
    async fn store_metric(
        &self,
        name: &str,
        value: f64,
        ts_unix: u64,
        dims: &BTreeMap<String, String>,
    ) -> Result<()>;
}

#[async_trait]
pub trait AnalyticsEngine: Send + Sync {
    async fn detect_disruptions(
        &self,
        news: &[NewsItem],
        vessel_anomalies: &[VesselAnomaly],
        economic: &[EconomicIndicator],
    ) -> Result<Vec<DisruptionCandidate>>;

    async fn predict_movement(&self, history: &[VesselPosition])
        -> Result<Vec<MovementPrediction>>;
}

pub type DynGateway = Arc<dyn PersistenceGateway>;
pub type DynAnalytics = Arc<dyn AnalyticsEngine>;

// ---------------------------------------------------------------
// Shipped gateway impls
// ---------------------------------------------------------------

/// Append-only JSONL store under a state directory; one file per concern.
pub struct JsonlGateway {
    dir: PathBuf,
    next_id: AtomicU64,
}

impl JsonlGateway {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn append_line(&self, file: &str, line: String) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating state dir {}", self.dir.display()))?;
        let path = self.dir.join(file);
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        f.write_all(line.as_bytes()).await?;
        f.write_all(b"\n").await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for JsonlGateway {
    async fn store(&self, category: Category, records: &[CleanedRecord]) -> Result<()> {
        let file = format!("{category}.jsonl");
        for r in records {
            self.append_line(&file, serde_json::to_string(r)?).await?;
        }
        Ok(())
    }

    async fn store_disruption(&self, event: &DisruptionEvent) -> Result<String> {
        let id = format!(
            "disr-{}-{}",
            event.ts_unix,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        #[derive(Serialize)]
        struct Stored<'a> {
            id: &'a str,
            #[serde(flatten)]
            event: &'a DisruptionEvent,
        }
        self.append_line(
            "disruptions.jsonl",
            serde_json::to_string(&Stored { id: &id, event })?,
        )
        .await?;
        Ok(id)
    }

    async fn store_metric(
        &self,
        name: &str,
        value: f64,
        ts_unix: u64,
        dims: &BTreeMap<String, String>,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct Stored<'a> {
            name: &'a str,
            value: f64,
            ts_unix: u64,
            dims: &'a BTreeMap<String, String>,
        }
        self.append_line(
            "metrics.jsonl",
            serde_json::to_string(&Stored {
                name,
                value,
                ts_unix,
                dims,
            })?,
        )
        .await
    }
}

/// Discards everything; stands in where persistence is disabled.
pub struct NullGateway;

#[async_trait]
impl PersistenceGateway for NullGateway {
    async fn store(&self, category: Category, records: &[CleanedRecord]) -> Result<()> {
        tracing::trace!(%category, count = records.len(), "store discarded");
        Ok(())
    }

    async fn store_disruption(&self, event: &DisruptionEvent) -> Result<String> {
        tracing::trace!(kind = %event.kind, "disruption discarded");
        Ok(format!("null-{}", event.ts_unix))
    }

    async fn store_metric(
        &self,
        _name: &str,
        _value: f64,
        _ts_unix: u64,
        _dims: &BTreeMap<String, String>,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::RecordBody;

    #[tokio::test]
    async fn jsonl_gateway_appends_per_category_files() {
        let tmp = tempfile::tempdir().unwrap();
        let gw = JsonlGateway::new(tmp.path());

        let rec = CleanedRecord {
            body: RecordBody::Economic(EconomicIndicator {
                name: "baltic_dry".into(),
                value: 1400.0,
                change_pct: -1.0,
                ts_unix: 100,
            }),
            quality: 0.9,
            processed_at: 100,
        };
        gw.store(Category::Economic, std::slice::from_ref(&rec))
            .await
            .unwrap();
        gw.store(Category::Economic, std::slice::from_ref(&rec))
            .await
            .unwrap();

        let content = std::fs::read_to_string(tmp.path().join("economic.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
        let parsed: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["category"], "economic");
    }

    #[tokio::test]
    async fn disruption_ids_are_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let gw = JsonlGateway::new(tmp.path());
        let ev = DisruptionEvent {
            kind: "strike".into(),
            severity: Severity::Critical,
            origin: DisruptionOrigin::Immediate,
            region: None,
            summary: "terminal closed".into(),
            ts_unix: 42,
        };
        let a = gw.store_disruption(&ev).await.unwrap();
        let b = gw.store_disruption(&ev).await.unwrap();
        assert_ne!(a, b);
    }
}
