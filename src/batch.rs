// src/batch.rs
//! Periodic consumer draining the category buffers into aggregate
//! analytics calls. Fires on a fixed timer or early when the dispatcher
//! reports a buffer above its high-water mark.
//!
//! Buffers are cleared regardless of downstream success. This is
//! best-effort on purpose: a failed analytics call loses that cycle's
//! batch instead of retrying into a backlog.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use serde::Deserialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::gateway::{AnomalyKind, DisruptionEvent, DisruptionOrigin, DynAnalytics, DynGateway, VesselAnomaly};
use crate::ingest::buffer::BufferSet;
use crate::ingest::types::{Category, CleanedRecord, EconomicIndicator, NewsItem, RecordBody, VesselPosition};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub interval_secs: u64,
    /// Pre-drain vessel count needed before prediction work happens.
    pub min_vessel_records: usize,
    /// Positions per vessel needed for one prediction call.
    pub min_history: usize,
    /// Pre-drain news count needed for the disruption sweep.
    pub min_news_items: usize,
    pub speed_threshold_knots: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            min_vessel_records: 5,
            min_history: 5,
            min_news_items: 3,
            speed_threshold_knots: 30.0,
        }
    }
}

pub struct BatchProcessor {
    cfg: BatchConfig,
    buffers: Arc<BufferSet>,
    analytics: DynAnalytics,
    gateway: DynGateway,
    trigger: Arc<Notify>,
}

impl BatchProcessor {
    pub fn new(
        cfg: BatchConfig,
        buffers: Arc<BufferSet>,
        analytics: DynAnalytics,
        gateway: DynGateway,
    ) -> Self {
        Self {
            cfg,
            buffers,
            analytics,
            gateway,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Handle the dispatcher pokes when a buffer crosses the high-water mark.
    pub fn trigger_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.cfg.interval_secs.max(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_cycle().await,
                    _ = self.trigger.notified() => {
                        tracing::debug!("high-water trigger");
                        self.run_cycle().await;
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One full drain-and-analyze cycle; public so tests drive it directly.
    pub async fn run_cycle(&self) {
        let vessel_pre = self.buffers.len(Category::VesselPosition);
        let news_pre = self.buffers.len(Category::News);

        let mut drained = self.buffers.drain_all();
        let total: usize = drained.values().map(Vec::len).sum();

        counter!("batch_runs_total").increment(1);
        gauge!("batch_last_run_ts").set(now_unix() as f64);
        tracing::info!(total, vessel_pre, news_pre, "batch cycle");

        if total == 0 {
            return;
        }

        let vessels = extract_vessels(drained.remove(&Category::VesselPosition).unwrap_or_default());
        let news = extract_news(drained.remove(&Category::News).unwrap_or_default());
        let economic = extract_economic(drained.remove(&Category::Economic).unwrap_or_default());

        if vessel_pre >= self.cfg.min_vessel_records {
            self.predict_movements(&vessels).await;
        }

        if vessel_pre >= self.cfg.min_vessel_records && news_pre >= self.cfg.min_news_items {
            let anomalies = derive_anomalies(&vessels, self.cfg.speed_threshold_knots);
            self.detect_disruptions(&news, &anomalies, &economic).await;
        }
    }

    async fn predict_movements(&self, vessels: &[VesselPosition]) {
        let mut by_vessel: HashMap<&str, Vec<VesselPosition>> = HashMap::new();
        for v in vessels {
            by_vessel.entry(&v.vessel_id).or_default().push(v.clone());
        }

        for (vessel_id, history) in by_vessel {
            if history.len() < self.cfg.min_history {
                continue;
            }
            match self.analytics.predict_movement(&history).await {
                Ok(predictions) => {
                    for p in predictions {
                        let mut dims = BTreeMap::new();
                        dims.insert("vessel_id".to_string(), p.vessel_id.clone());
                        dims.insert("lat".to_string(), format!("{:.5}", p.lat));
                        dims.insert("lon".to_string(), format!("{:.5}", p.lon));
                        if let Err(e) = self
                            .gateway
                            .store_metric(
                                "movement_prediction_confidence",
                                p.confidence as f64,
                                now_unix(),
                                &dims,
                            )
                            .await
                        {
                            counter!("batch_persist_errors_total").increment(1);
                            tracing::warn!(error = ?e, vessel = vessel_id, "failed to persist prediction");
                        }
                    }
                }
                Err(e) => {
                    counter!("batch_analytics_errors_total").increment(1);
                    tracing::warn!(error = ?e, vessel = vessel_id, "movement prediction failed");
                }
            }
        }
    }

    async fn detect_disruptions(
        &self,
        news: &[NewsItem],
        anomalies: &[VesselAnomaly],
        economic: &[EconomicIndicator],
    ) {
        match self
            .analytics
            .detect_disruptions(news, anomalies, economic)
            .await
        {
            Ok(candidates) => {
                for c in candidates {
                    let event = DisruptionEvent {
                        kind: c.kind,
                        severity: c.severity,
                        origin: DisruptionOrigin::Batch,
                        region: c.region,
                        summary: c.summary,
                        ts_unix: now_unix(),
                    };
                    match self.gateway.store_disruption(&event).await {
                        Ok(id) => tracing::info!(id = %id, kind = %event.kind, "disruption stored"),
                        Err(e) => {
                            counter!("batch_persist_errors_total").increment(1);
                            tracing::warn!(error = ?e, "failed to persist disruption");
                        }
                    }
                }
            }
            Err(e) => {
                counter!("batch_analytics_errors_total").increment(1);
                tracing::warn!(error = ?e, "batch disruption detection failed");
            }
        }
    }
}

fn extract_vessels(records: Vec<CleanedRecord>) -> Vec<VesselPosition> {
    records
        .into_iter()
        .filter_map(|r| match r.body {
            RecordBody::VesselPosition(v) => Some(v),
            _ => None,
        })
        .collect()
}

fn extract_news(records: Vec<CleanedRecord>) -> Vec<NewsItem> {
    records
        .into_iter()
        .filter_map(|r| match r.body {
            RecordBody::News(n) => Some(n),
            _ => None,
        })
        .collect()
}

fn extract_economic(records: Vec<CleanedRecord>) -> Vec<EconomicIndicator> {
    records
        .into_iter()
        .filter_map(|r| match r.body {
            RecordBody::Economic(e) => Some(e),
            _ => None,
        })
        .collect()
}

/// Speed outliers from a drained vessel batch: above-threshold movers plus
/// dead-stopped vessels.
fn derive_anomalies(vessels: &[VesselPosition], speed_threshold: f64) -> Vec<VesselAnomaly> {
    vessels
        .iter()
        .filter_map(|v| {
            let kind = if v.speed_knots > speed_threshold {
                AnomalyKind::Speeding
            } else if v.speed_knots == 0.0 {
                AnomalyKind::Stopped
            } else {
                return None;
            };
            Some(VesselAnomaly {
                vessel_id: v.vessel_id.clone(),
                speed_knots: v.speed_knots,
                kind,
                ts_unix: v.ts_unix,
            })
        })
        .collect()
}

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vessel(id: &str, speed: f64) -> VesselPosition {
        VesselPosition {
            vessel_id: id.into(),
            lat: 0.0,
            lon: 0.0,
            speed_knots: speed,
            heading_deg: None,
            ts_unix: 1000,
            source: None,
        }
    }

    #[test]
    fn anomalies_cover_speeding_and_stopped() {
        let vessels = vec![vessel("a", 35.0), vessel("b", 0.0), vessel("c", 12.0)];
        let anomalies = derive_anomalies(&vessels, 30.0);
        assert_eq!(anomalies.len(), 2);
        assert_eq!(anomalies[0].kind, AnomalyKind::Speeding);
        assert_eq!(anomalies[1].kind, AnomalyKind::Stopped);
    }
}
