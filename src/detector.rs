// src/detector.rs
//! Watches the cleaned-record stream for clusters of critical candidates
//! and escalates them immediately, without waiting for a batch cycle.
//!
//! A candidate is a high/critical-severity news item or alert, a vessel
//! above the speed anomaly threshold, or a port above the congestion
//! threshold. Once enough candidates land inside the window, analytics is
//! consulted exactly once for that cluster; a non-empty answer escalates
//! every candidate to top severity. Failures here are logged and swallowed;
//! nothing propagates into the ingest path.

use std::collections::VecDeque;
use std::sync::Mutex;

use metrics::counter;
use serde::Deserialize;

use crate::gateway::{
    AnomalyKind, DisruptionEvent, DisruptionOrigin, DynAnalytics, DynGateway, VesselAnomaly,
};
use crate::ingest::types::{CleanedRecord, NewsItem, RecordBody, Severity};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Candidates needed inside the window before escalation fires.
    pub min_samples: usize,
    pub window_secs: u64,
    pub speed_threshold_knots: f64,
    pub congestion_threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_samples: 3,
            window_secs: 10 * 60,
            speed_threshold_knots: 30.0,
            congestion_threshold: 0.8,
        }
    }
}

pub struct CriticalEventDetector {
    cfg: DetectorConfig,
    window: Mutex<VecDeque<(u64, CleanedRecord)>>,
    analytics: DynAnalytics,
    gateway: DynGateway,
}

impl CriticalEventDetector {
    pub fn new(cfg: DetectorConfig, analytics: DynAnalytics, gateway: DynGateway) -> Self {
        Self {
            cfg,
            window: Mutex::new(VecDeque::new()),
            analytics,
            gateway,
        }
    }

    fn is_candidate(&self, record: &CleanedRecord) -> bool {
        match &record.body {
            RecordBody::News(n) => n.severity.is_high(),
            RecordBody::Alert(a) => a.severity.is_high(),
            RecordBody::VesselPosition(v) => v.speed_knots > self.cfg.speed_threshold_knots,
            RecordBody::PortMetric(p) => p.congestion > self.cfg.congestion_threshold,
            RecordBody::Economic(_) => false,
        }
    }

    /// Inspect one cleaned record; may fire an escalation.
    pub async fn offer(&self, record: &CleanedRecord) {
        let Some(cluster) = self.admit(record, record.processed_at) else {
            return;
        };
        self.escalate(cluster).await;
    }

    /// Window bookkeeping under the lock; returns a drained cluster when the
    /// sample threshold is met. Draining on trigger means one cluster maps
    /// to exactly one analytics call.
    fn admit(&self, record: &CleanedRecord, now: u64) -> Option<Vec<CleanedRecord>> {
        if !self.is_candidate(record) {
            return None;
        }
        let cutoff = now.saturating_sub(self.cfg.window_secs);
        let mut window = self.window.lock().expect("detector mutex poisoned");
        while let Some(&(ts, _)) = window.front() {
            if ts < cutoff {
                window.pop_front();
            } else {
                break;
            }
        }
        window.push_back((now, record.clone()));
        if window.len() >= self.cfg.min_samples {
            return Some(window.drain(..).map(|(_, r)| r).collect());
        }
        None
    }

    async fn escalate(&self, cluster: Vec<CleanedRecord>) {
        counter!("detector_clusters_total").increment(1);

        let mut news: Vec<NewsItem> = Vec::new();
        let mut anomalies: Vec<VesselAnomaly> = Vec::new();
        for record in &cluster {
            match &record.body {
                RecordBody::News(n) => news.push(n.clone()),
                // Alerts feed the engine as textual events alongside news.
                RecordBody::Alert(a) => news.push(NewsItem {
                    title: match &a.location {
                        Some(loc) => format!("{} alert ({loc})", a.kind),
                        None => format!("{} alert", a.kind),
                    },
                    body: String::new(),
                    severity: a.severity,
                    ts_unix: a.ts_unix,
                    relevance: 1.0,
                }),
                RecordBody::VesselPosition(v) => anomalies.push(VesselAnomaly {
                    vessel_id: v.vessel_id.clone(),
                    speed_knots: v.speed_knots,
                    kind: AnomalyKind::Speeding,
                    ts_unix: v.ts_unix,
                }),
                RecordBody::PortMetric(_) | RecordBody::Economic(_) => {}
            }
        }

        match self
            .analytics
            .detect_disruptions(&news, &anomalies, &[])
            .await
        {
            Ok(candidates) if !candidates.is_empty() => {
                counter!("detector_escalations_total").increment(1);
                for record in &cluster {
                    let event = escalated_event(record);
                    match self.gateway.store_disruption(&event).await {
                        Ok(id) => {
                            tracing::info!(id = %id, kind = %event.kind, "disruption escalated")
                        }
                        Err(e) => {
                            tracing::warn!(error = ?e, "failed to persist escalated disruption")
                        }
                    }
                }
            }
            Ok(_) => {
                tracing::debug!(cluster = cluster.len(), "cluster not confirmed by analytics")
            }
            Err(e) => {
                counter!("detector_analytics_errors_total").increment(1);
                tracing::warn!(error = ?e, "analytics failed during escalation");
            }
        }
    }

    #[cfg(test)]
    fn window_len(&self) -> usize {
        self.window.lock().unwrap().len()
    }
}

/// Immediate-origin event with severity forced to the top tier.
fn escalated_event(record: &CleanedRecord) -> DisruptionEvent {
    let (kind, region, summary) = match &record.body {
        RecordBody::News(n) => ("news_disruption".to_string(), None, n.title.clone()),
        RecordBody::Alert(a) => (
            format!("alert_{}", a.kind),
            a.location.clone(),
            format!("{} alert", a.kind),
        ),
        RecordBody::VesselPosition(v) => (
            "vessel_anomaly".to_string(),
            None,
            format!("vessel {} at {:.1} kn", v.vessel_id, v.speed_knots),
        ),
        RecordBody::PortMetric(p) => (
            "port_congestion".to_string(),
            Some(p.code.clone()),
            format!("port {} congestion {:.2}", p.code, p.congestion),
        ),
        RecordBody::Economic(e) => (
            "economic_shock".to_string(),
            None,
            format!("{} moved {:+.1}%", e.name, e.change_pct),
        ),
    };
    DisruptionEvent {
        kind,
        severity: Severity::Critical,
        origin: DisruptionOrigin::Immediate,
        region,
        summary,
        ts_unix: record.ts_unix(),
    }
}
