// src/ingest/types.rs
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Telemetry categories handled by the pipeline. Every stream descriptor
/// declares exactly one, and buffers/validators are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    VesselPosition,
    PortMetric,
    News,
    Economic,
    Alert,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::VesselPosition,
        Category::PortMetric,
        Category::News,
        Category::Economic,
        Category::Alert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::VesselPosition => "vessel_position",
            Category::PortMetric => "port_metric",
            Category::News => "news",
            Category::Economic => "economic",
            Category::Alert => "alert",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity scale shared by news items and alerts. Ordered so that
/// `>= Severity::High` reads naturally at the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Tolerant parse from wire strings ("HIGH", " critical ", ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" | "moderate" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" | "severe" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn is_high(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A raw arrival: category tag + opaque payload straight off a transport.
/// Lives only until the validator consumes it.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub category: Category,
    pub payload: serde_json::Value,
    pub arrived_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VesselPosition {
    pub vessel_id: String,
    pub lat: f64,
    pub lon: f64,
    pub speed_knots: f64,
    pub heading_deg: Option<f64>,
    pub ts_unix: u64,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMetric {
    pub code: String,
    pub arrivals: u32,
    pub departures: u32,
    /// Congestion level in [0, 1].
    pub congestion: f64,
    pub ts_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub title: String,
    pub body: String,
    pub severity: Severity,
    pub ts_unix: u64,
    /// Maritime relevance in [0, 1]; derived from a keyword scan when the
    /// source does not provide one.
    pub relevance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicIndicator {
    pub name: String,
    pub value: f64,
    pub change_pct: f64,
    pub ts_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: String,
    pub severity: Severity,
    pub location: Option<String>,
    pub ts_unix: u64,
}

/// Tagged union over the cleaned per-category payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum RecordBody {
    VesselPosition(VesselPosition),
    PortMetric(PortMetric),
    News(NewsItem),
    Economic(EconomicIndicator),
    Alert(AlertEvent),
}

/// A validated, normalized, quality-scored record. Immutable once built;
/// everything downstream of the validator works on these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedRecord {
    #[serde(flatten)]
    pub body: RecordBody,
    pub quality: f32,
    pub processed_at: u64,
}

impl CleanedRecord {
    pub fn category(&self) -> Category {
        match &self.body {
            RecordBody::VesselPosition(_) => Category::VesselPosition,
            RecordBody::PortMetric(_) => Category::PortMetric,
            RecordBody::News(_) => Category::News,
            RecordBody::Economic(_) => Category::Economic,
            RecordBody::Alert(_) => Category::Alert,
        }
    }

    /// Observation timestamp carried by the payload (not the arrival time).
    pub fn ts_unix(&self) -> u64 {
        match &self.body {
            RecordBody::VesselPosition(v) => v.ts_unix,
            RecordBody::PortMetric(p) => p.ts_unix,
            RecordBody::News(n) => n.ts_unix,
            RecordBody::Economic(e) => e.ts_unix,
            RecordBody::Alert(a) => a.ts_unix,
        }
    }

    /// Category-specific identity used to suppress repeated observations.
    pub fn dedup_key(&self) -> DedupKey {
        match &self.body {
            RecordBody::VesselPosition(v) => DedupKey(format!(
                "vessel:{}:{}",
                v.vessel_id,
                v.ts_unix / VESSEL_DEDUP_BUCKET_SECS
            )),
            RecordBody::PortMetric(p) => {
                DedupKey(format!("port:{}:{}", p.code, p.ts_unix / 86_400))
            }
            RecordBody::News(n) => {
                let mut hasher = Sha256::new();
                hasher.update(n.title.to_ascii_lowercase().as_bytes());
                let digest = hasher.finalize();
                DedupKey(format!("news:{digest:x}"))
            }
            RecordBody::Economic(e) => DedupKey(format!("econ:{}:{}", e.name, e.ts_unix)),
            RecordBody::Alert(a) => DedupKey(format!(
                "alert:{}:{}:{}",
                a.kind,
                a.location.as_deref().unwrap_or("-"),
                a.ts_unix / ALERT_DEDUP_BUCKET_SECS
            )),
        }
    }
}

/// Coarse time bucket for vessel positions: two fixes for the same vessel
/// within the same minute count as one observation.
const VESSEL_DEDUP_BUCKET_SECS: u64 = 60;
const ALERT_DEDUP_BUCKET_SECS: u64 = 300;

/// Derived identity of one observation; lives in the dedup cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    /// Build a key from an arbitrary string; test helper.
    pub fn raw(s: impl Into<String>) -> Self {
        DedupKey(s.into())
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vessel(id: &str, ts: u64) -> CleanedRecord {
        CleanedRecord {
            body: RecordBody::VesselPosition(VesselPosition {
                vessel_id: id.into(),
                lat: 1.0,
                lon: 2.0,
                speed_knots: 10.0,
                heading_deg: None,
                ts_unix: ts,
                source: None,
            }),
            quality: 1.0,
            processed_at: ts,
        }
    }

    #[test]
    fn vessel_keys_bucket_by_minute() {
        let a = vessel("V1", 1_000_020);
        let b = vessel("V1", 1_000_030); // same minute bucket
        let c = vessel("V1", 1_000_090); // next bucket
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_ne!(a.dedup_key(), c.dedup_key());
        assert_ne!(vessel("V2", 1_000_020).dedup_key(), a.dedup_key());
    }

    #[test]
    fn news_keys_ignore_title_case() {
        let n = |title: &str| CleanedRecord {
            body: RecordBody::News(NewsItem {
                title: title.into(),
                body: String::new(),
                severity: Severity::Low,
                ts_unix: 0,
                relevance: 0.0,
            }),
            quality: 1.0,
            processed_at: 0,
        };
        assert_eq!(
            n("Canal Blocked").dedup_key(),
            n("canal blocked").dedup_key()
        );
    }

    #[test]
    fn severity_parses_and_orders() {
        assert_eq!(Severity::parse(" HIGH "), Some(Severity::High));
        assert_eq!(Severity::parse("severe"), Some(Severity::Critical));
        assert_eq!(Severity::parse("bogus"), None);
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High.is_high());
        assert!(!Severity::Medium.is_high());
    }
}
