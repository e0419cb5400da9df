// src/analytics.rs
//! Shipped analytics engine: threshold heuristics over severity, relevance
//! and recency for disruption candidates, and constant-velocity dead
//! reckoning for movement prediction. Deliberately simple; the pipeline
//! treats any `AnalyticsEngine` as slow and fallible regardless.

use anyhow::Result;
use async_trait::async_trait;

use crate::gateway::{
    AnalyticsEngine, AnomalyKind, DisruptionCandidate, MovementPrediction, VesselAnomaly,
};
use crate::ingest::types::{EconomicIndicator, NewsItem, Severity, VesselPosition};

/// Candidate thresholds. Severity weight and relevance must both clear
/// their bar before a news item becomes a disruption candidate.
const NEWS_SEVERITY_MIN: f32 = 0.80;
const NEWS_RELEVANCE_MIN: f32 = 0.40;
const ECONOMIC_SHOCK_PCT: f64 = 5.0;

/// How far ahead dead reckoning projects a vessel.
const PREDICTION_HORIZON_SECS: u64 = 30 * 60;

#[derive(Debug, Default)]
pub struct ThresholdAnalytics;

impl ThresholdAnalytics {
    pub fn new() -> Self {
        Self
    }
}

fn severity_weight(severity: Severity) -> f32 {
    match severity {
        Severity::Low => 0.30,
        Severity::Medium => 0.60,
        Severity::High => 0.85,
        Severity::Critical => 1.0,
    }
}

fn clamp01(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

#[async_trait]
impl AnalyticsEngine for ThresholdAnalytics {
    async fn detect_disruptions(
        &self,
        news: &[NewsItem],
        vessel_anomalies: &[VesselAnomaly],
        economic: &[EconomicIndicator],
    ) -> Result<Vec<DisruptionCandidate>> {
        let mut out = Vec::new();

        for item in news {
            let w_severity = severity_weight(item.severity);
            if w_severity >= NEWS_SEVERITY_MIN && item.relevance >= NEWS_RELEVANCE_MIN {
                out.push(DisruptionCandidate {
                    kind: "news_disruption".into(),
                    severity: item.severity,
                    region: None,
                    summary: item.title.clone(),
                    confidence: clamp01(w_severity * item.relevance),
                });
            }
        }

        for anomaly in vessel_anomalies {
            let (summary, confidence) = match anomaly.kind {
                AnomalyKind::Speeding => (
                    format!(
                        "vessel {} at {:.1} kn",
                        anomaly.vessel_id, anomaly.speed_knots
                    ),
                    clamp01(0.5 + anomaly.speed_knots as f32 / 100.0),
                ),
                AnomalyKind::Stopped => (
                    format!("vessel {} stopped", anomaly.vessel_id),
                    0.6,
                ),
            };
            out.push(DisruptionCandidate {
                kind: "vessel_anomaly".into(),
                severity: Severity::High,
                region: None,
                summary,
                confidence,
            });
        }

        for ind in economic {
            if ind.change_pct.abs() >= ECONOMIC_SHOCK_PCT {
                out.push(DisruptionCandidate {
                    kind: "economic_shock".into(),
                    severity: Severity::Medium,
                    region: None,
                    summary: format!("{} moved {:+.1}%", ind.name, ind.change_pct),
                    confidence: clamp01((ind.change_pct.abs() / 20.0) as f32),
                });
            }
        }

        Ok(out)
    }

    async fn predict_movement(
        &self,
        history: &[VesselPosition],
    ) -> Result<Vec<MovementPrediction>> {
        let mut sorted: Vec<&VesselPosition> = history.iter().collect();
        sorted.sort_by_key(|p| p.ts_unix);

        let (Some(prev), Some(last)) = (
            sorted.len().checked_sub(2).and_then(|i| sorted.get(i)),
            sorted.last(),
        ) else {
            return Ok(Vec::new());
        };

        let dt = last.ts_unix.saturating_sub(prev.ts_unix);
        if dt == 0 {
            return Ok(Vec::new());
        }

        let dt = dt as f64;
        let vlat = (last.lat - prev.lat) / dt;
        let vlon = (last.lon - prev.lon) / dt;
        let h = PREDICTION_HORIZON_SECS as f64;

        // Longer histories earn more confidence, capped well below certainty.
        let confidence = clamp01(0.3 + sorted.len() as f32 * 0.08);

        Ok(vec![MovementPrediction {
            vessel_id: last.vessel_id.clone(),
            lat: (last.lat + vlat * h).clamp(-90.0, 90.0),
            lon: (last.lon + vlon * h).clamp(-180.0, 180.0),
            horizon_secs: PREDICTION_HORIZON_SECS,
            confidence,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn news(severity: Severity, relevance: f32) -> NewsItem {
        NewsItem {
            title: "Canal convoy suspended".into(),
            body: String::new(),
            severity,
            ts_unix: 1000,
            relevance,
        }
    }

    #[tokio::test]
    async fn only_severe_relevant_news_becomes_a_candidate() {
        let engine = ThresholdAnalytics::new();
        let out = engine
            .detect_disruptions(
                &[
                    news(Severity::Critical, 0.9),
                    news(Severity::High, 0.2),   // relevance below bar
                    news(Severity::Medium, 0.9), // severity below bar
                ],
                &[],
                &[],
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, "news_disruption");
    }

    #[tokio::test]
    async fn anomalies_always_surface() {
        let engine = ThresholdAnalytics::new();
        let out = engine
            .detect_disruptions(
                &[],
                &[VesselAnomaly {
                    vessel_id: "V9".into(),
                    speed_knots: 0.0,
                    kind: AnomalyKind::Stopped,
                    ts_unix: 1000,
                }],
                &[],
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, "vessel_anomaly");
    }

    #[tokio::test]
    async fn dead_reckoning_projects_along_the_track() {
        let engine = ThresholdAnalytics::new();
        let p = |lat: f64, ts: u64| VesselPosition {
            vessel_id: "V1".into(),
            lat,
            lon: 10.0,
            speed_knots: 12.0,
            heading_deg: Some(0.0),
            ts_unix: ts,
            source: None,
        };
        let out = engine
            .predict_movement(&[p(1.0, 1000), p(1.1, 2000)])
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].lat > 1.1);
        assert_eq!(out[0].lon, 10.0);

        // A single fix cannot be projected.
        assert!(engine.predict_movement(&[p(1.0, 1000)]).await.unwrap().is_empty());
    }
}
