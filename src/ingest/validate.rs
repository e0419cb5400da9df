// src/ingest/validate.rs
//! Per-category validation, normalization and quality scoring.
//!
//! Validation failure is an expected, high-frequency outcome here: the
//! record is dropped with a [`DropReason`] and the stream unit moves on.
//! Nothing in this module returns an error that could abort ingestion.

use once_cell::sync::OnceCell;
use serde::Deserialize;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::{OffsetDateTime, UtcOffset};

use crate::ingest::types::{
    AlertEvent, Category, CleanedRecord, EconomicIndicator, NewsItem, PortMetric, RawRecord,
    RecordBody, Severity, VesselPosition,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Oldest observation timestamp accepted, relative to "now".
    pub max_age_secs: u64,
    /// Tolerated clock skew for timestamps ahead of "now".
    pub max_future_skew_secs: u64,
    pub max_speed_knots: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 30 * 60,
            max_future_skew_secs: 5 * 60,
            max_speed_knots: 50.0,
        }
    }
}

/// Why a raw record was dropped. Logged and counted, never propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Undecodable,
    MissingField(&'static str),
    OutOfRange(&'static str),
    BadTimestamp,
    Stale,
    FutureTimestamp,
    UnknownSeverity,
}

impl DropReason {
    /// Stable label for metrics series.
    pub fn label(&self) -> &'static str {
        match self {
            DropReason::Undecodable => "undecodable",
            DropReason::MissingField(_) => "missing_field",
            DropReason::OutOfRange(_) => "out_of_range",
            DropReason::BadTimestamp => "bad_timestamp",
            DropReason::Stale => "stale",
            DropReason::FutureTimestamp => "future_timestamp",
            DropReason::UnknownSeverity => "unknown_severity",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Undecodable => write!(f, "payload not decodable"),
            DropReason::MissingField(name) => write!(f, "missing field `{name}`"),
            DropReason::OutOfRange(name) => write!(f, "field `{name}` out of range"),
            DropReason::BadTimestamp => write!(f, "unparseable timestamp"),
            DropReason::Stale => write!(f, "timestamp older than freshness threshold"),
            DropReason::FutureTimestamp => write!(f, "timestamp too far in the future"),
            DropReason::UnknownSeverity => write!(f, "unknown severity value"),
        }
    }
}

/// `true` iff the raw record would survive [`clean`].
pub fn validate(raw: &RawRecord, now: u64, cfg: &ValidatorConfig) -> bool {
    clean(raw, now, cfg).is_ok()
}

/// Decode, validate and normalize one raw record into a [`CleanedRecord`].
pub fn clean(raw: &RawRecord, now: u64, cfg: &ValidatorConfig) -> Result<CleanedRecord, DropReason> {
    let (body, quality) = match raw.category {
        Category::VesselPosition => clean_vessel(&raw.payload, now, cfg)?,
        Category::PortMetric => clean_port(&raw.payload, now, cfg)?,
        Category::News => clean_news(&raw.payload, now, cfg)?,
        Category::Economic => clean_economic(&raw.payload, now, cfg)?,
        Category::Alert => clean_alert(&raw.payload, now, cfg)?,
    };
    Ok(CleanedRecord {
        body,
        quality: clamp01(quality),
        processed_at: now,
    })
}

// ---------------------------------------------------------------
// Tolerant wire scalars. Sources disagree on numbers-vs-strings and
// unix-vs-RFC3339, so decoding accepts both shapes.
// ---------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(f64),
    Str(String),
}

impl NumOrStr {
    fn as_f64(&self) -> Option<f64> {
        match self {
            NumOrStr::Num(n) => Some(*n),
            NumOrStr::Str(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IdAny {
    Str(String),
    Num(i64),
}

impl IdAny {
    fn into_string(self) -> String {
        match self {
            IdAny::Str(s) => s.trim().to_string(),
            IdAny::Num(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TsAny {
    Unix(u64),
    Text(String),
}

fn parse_ts(ts: &TsAny) -> Option<u64> {
    match ts {
        TsAny::Unix(u) => Some(*u),
        TsAny::Text(s) => {
            let s = s.trim();
            OffsetDateTime::parse(s, &Rfc3339)
                .or_else(|_| OffsetDateTime::parse(s, &Rfc2822))
                .ok()
                .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
                .and_then(|x| u64::try_from(x).ok())
        }
    }
}

fn check_freshness(ts: u64, now: u64, cfg: &ValidatorConfig) -> Result<(), DropReason> {
    if ts > now + cfg.max_future_skew_secs {
        return Err(DropReason::FutureTimestamp);
    }
    if now.saturating_sub(ts) > cfg.max_age_secs {
        return Err(DropReason::Stale);
    }
    Ok(())
}

/// Recency component of the quality score: 1.0 for a record observed just
/// now, falling linearly to 0.0 at the freshness threshold.
fn recency_weight(ts: u64, now: u64, cfg: &ValidatorConfig) -> f32 {
    if cfg.max_age_secs == 0 {
        return 0.0;
    }
    let age = now.saturating_sub(ts) as f32;
    clamp01(1.0 - age / cfg.max_age_secs as f32)
}

/// Normalize free text: decode HTML entities, strip tags, unify quotes,
/// collapse whitespace. Capped at 2000 chars.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > 2000 {
        out = out.chars().take(2000).collect();
    }
    out
}

fn clamp01(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

// ---------------------------------------------------------------
// Per-category cleaners
// ---------------------------------------------------------------

fn clean_vessel(
    payload: &serde_json::Value,
    now: u64,
    cfg: &ValidatorConfig,
) -> Result<(RecordBody, f32), DropReason> {
    #[derive(Deserialize)]
    struct RawVessel {
        #[serde(alias = "id", alias = "mmsi")]
        vessel_id: Option<IdAny>,
        #[serde(alias = "latitude")]
        lat: Option<NumOrStr>,
        #[serde(alias = "longitude", alias = "lng")]
        lon: Option<NumOrStr>,
        #[serde(alias = "speed", alias = "sog")]
        speed_knots: Option<NumOrStr>,
        #[serde(alias = "heading", alias = "cog")]
        heading_deg: Option<NumOrStr>,
        #[serde(alias = "ts", alias = "time")]
        timestamp: Option<TsAny>,
        source: Option<String>,
    }

    let rv: RawVessel =
        serde_json::from_value(payload.clone()).map_err(|_| DropReason::Undecodable)?;

    let vessel_id = rv
        .vessel_id
        .ok_or(DropReason::MissingField("vessel_id"))?
        .into_string();
    if vessel_id.is_empty() {
        return Err(DropReason::MissingField("vessel_id"));
    }

    let lat = rv
        .lat
        .ok_or(DropReason::MissingField("lat"))?
        .as_f64()
        .ok_or(DropReason::OutOfRange("lat"))?;
    if !(-90.0..=90.0).contains(&lat) {
        return Err(DropReason::OutOfRange("lat"));
    }

    let lon = rv
        .lon
        .ok_or(DropReason::MissingField("lon"))?
        .as_f64()
        .ok_or(DropReason::OutOfRange("lon"))?;
    if !(-180.0..=180.0).contains(&lon) {
        return Err(DropReason::OutOfRange("lon"));
    }

    let speed_knots = rv
        .speed_knots
        .ok_or(DropReason::MissingField("speed_knots"))?
        .as_f64()
        .ok_or(DropReason::OutOfRange("speed_knots"))?;
    if !(0.0..=cfg.max_speed_knots).contains(&speed_knots) {
        return Err(DropReason::OutOfRange("speed_knots"));
    }

    // Heading is optional; an out-of-range value drops the field, not the record.
    let heading_deg = rv
        .heading_deg
        .and_then(|h| h.as_f64())
        .filter(|h| (0.0..360.0).contains(h));

    let ts_unix = parse_ts(&rv.timestamp.ok_or(DropReason::MissingField("timestamp"))?)
        .ok_or(DropReason::BadTimestamp)?;
    check_freshness(ts_unix, now, cfg)?;

    let source = rv
        .source
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let quality = 0.5
        + if heading_deg.is_some() { 0.15 } else { 0.0 }
        + if source.is_some() { 0.10 } else { 0.0 }
        + 0.25 * recency_weight(ts_unix, now, cfg);

    Ok((
        RecordBody::VesselPosition(VesselPosition {
            vessel_id,
            lat,
            lon,
            speed_knots,
            heading_deg,
            ts_unix,
            source,
        }),
        quality,
    ))
}

fn clean_port(
    payload: &serde_json::Value,
    now: u64,
    cfg: &ValidatorConfig,
) -> Result<(RecordBody, f32), DropReason> {
    #[derive(Deserialize)]
    struct RawPort {
        #[serde(alias = "port", alias = "port_code")]
        code: Option<String>,
        arrivals: Option<NumOrStr>,
        departures: Option<NumOrStr>,
        #[serde(alias = "congestion_level")]
        congestion: Option<NumOrStr>,
        #[serde(alias = "ts", alias = "time")]
        timestamp: Option<TsAny>,
    }

    let rp: RawPort =
        serde_json::from_value(payload.clone()).map_err(|_| DropReason::Undecodable)?;

    let code = rp
        .code
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
        .ok_or(DropReason::MissingField("code"))?;

    let congestion = rp
        .congestion
        .ok_or(DropReason::MissingField("congestion"))?
        .as_f64()
        .ok_or(DropReason::OutOfRange("congestion"))?;
    if !(0.0..=1.0).contains(&congestion) {
        return Err(DropReason::OutOfRange("congestion"));
    }

    let count = |v: Option<NumOrStr>, name: &'static str| -> Result<Option<u32>, DropReason> {
        match v {
            None => Ok(None),
            Some(n) => {
                let f = n.as_f64().ok_or(DropReason::OutOfRange(name))?;
                if f < 0.0 {
                    return Err(DropReason::OutOfRange(name));
                }
                Ok(Some(f.round() as u32))
            }
        }
    };
    let arrivals = count(rp.arrivals, "arrivals")?;
    let departures = count(rp.departures, "departures")?;

    let ts_unix = parse_ts(&rp.timestamp.ok_or(DropReason::MissingField("timestamp"))?)
        .ok_or(DropReason::BadTimestamp)?;
    check_freshness(ts_unix, now, cfg)?;

    let quality = 0.5
        + if arrivals.is_some() { 0.125 } else { 0.0 }
        + if departures.is_some() { 0.125 } else { 0.0 }
        + 0.25 * recency_weight(ts_unix, now, cfg);

    Ok((
        RecordBody::PortMetric(PortMetric {
            code,
            arrivals: arrivals.unwrap_or(0),
            departures: departures.unwrap_or(0),
            congestion,
            ts_unix,
        }),
        quality,
    ))
}

fn clean_news(
    payload: &serde_json::Value,
    now: u64,
    cfg: &ValidatorConfig,
) -> Result<(RecordBody, f32), DropReason> {
    #[derive(Deserialize)]
    struct RawNews {
        title: Option<String>,
        #[serde(alias = "description", alias = "summary")]
        body: Option<String>,
        severity: Option<String>,
        #[serde(alias = "ts", alias = "published_at")]
        timestamp: Option<TsAny>,
        relevance: Option<NumOrStr>,
    }

    let rn: RawNews =
        serde_json::from_value(payload.clone()).map_err(|_| DropReason::Undecodable)?;

    let title = normalize_text(rn.title.as_deref().unwrap_or_default());
    if title.is_empty() {
        return Err(DropReason::MissingField("title"));
    }
    let body = normalize_text(rn.body.as_deref().unwrap_or_default());

    // Sources without an explicit severity default low; a present but
    // unrecognized value is a validation failure.
    let severity = match rn.severity.as_deref() {
        Some(s) => Severity::parse(s).ok_or(DropReason::UnknownSeverity)?,
        None => Severity::Low,
    };

    let ts_unix = parse_ts(&rn.timestamp.ok_or(DropReason::MissingField("timestamp"))?)
        .ok_or(DropReason::BadTimestamp)?;
    check_freshness(ts_unix, now, cfg)?;

    let provided_relevance = rn.relevance.as_ref().and_then(|r| r.as_f64());
    let relevance = match provided_relevance {
        Some(r) => clamp01(r as f32),
        None => derive_relevance(&title, &body),
    };

    let quality = 0.5
        + if body.is_empty() { 0.0 } else { 0.20 }
        + if provided_relevance.is_some() { 0.05 } else { 0.0 }
        + 0.25 * recency_weight(ts_unix, now, cfg);

    Ok((
        RecordBody::News(NewsItem {
            title,
            body,
            severity,
            ts_unix,
            relevance,
        }),
        quality,
    ))
}

/// Keyword-scan relevance for sources that do not score their own items.
fn derive_relevance(title: &str, body: &str) -> f32 {
    const KEYWORDS: [&str; 10] = [
        "port",
        "shipping",
        "vessel",
        "canal",
        "strait",
        "freight",
        "tanker",
        "container",
        "cargo",
        "maritime",
    ];
    let haystack = format!("{} {}", title, body).to_ascii_lowercase();
    let hits = KEYWORDS.iter().filter(|k| haystack.contains(*k)).count();
    clamp01(hits as f32 * 0.2)
}

fn clean_economic(
    payload: &serde_json::Value,
    now: u64,
    cfg: &ValidatorConfig,
) -> Result<(RecordBody, f32), DropReason> {
    #[derive(Deserialize)]
    struct RawEconomic {
        #[serde(alias = "indicator")]
        name: Option<String>,
        value: Option<NumOrStr>,
        #[serde(alias = "change", alias = "change_percent")]
        change_pct: Option<NumOrStr>,
        #[serde(alias = "ts", alias = "time")]
        timestamp: Option<TsAny>,
    }

    let re: RawEconomic =
        serde_json::from_value(payload.clone()).map_err(|_| DropReason::Undecodable)?;

    let name = re
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or(DropReason::MissingField("name"))?;

    let value = re
        .value
        .ok_or(DropReason::MissingField("value"))?
        .as_f64()
        .ok_or(DropReason::OutOfRange("value"))?;

    let change_pct = re.change_pct.as_ref().and_then(|c| c.as_f64());

    let ts_unix = parse_ts(&re.timestamp.ok_or(DropReason::MissingField("timestamp"))?)
        .ok_or(DropReason::BadTimestamp)?;
    check_freshness(ts_unix, now, cfg)?;

    let quality = 0.6
        + if change_pct.is_some() { 0.15 } else { 0.0 }
        + 0.25 * recency_weight(ts_unix, now, cfg);

    Ok((
        RecordBody::Economic(EconomicIndicator {
            name,
            value,
            change_pct: change_pct.unwrap_or(0.0),
            ts_unix,
        }),
        quality,
    ))
}

fn clean_alert(
    payload: &serde_json::Value,
    now: u64,
    cfg: &ValidatorConfig,
) -> Result<(RecordBody, f32), DropReason> {
    #[derive(Deserialize)]
    struct RawAlert {
        #[serde(alias = "type")]
        kind: Option<String>,
        severity: Option<String>,
        #[serde(alias = "region", alias = "area")]
        location: Option<String>,
        #[serde(alias = "ts", alias = "time")]
        timestamp: Option<TsAny>,
    }

    let ra: RawAlert =
        serde_json::from_value(payload.clone()).map_err(|_| DropReason::Undecodable)?;

    let kind = ra
        .kind
        .map(|k| k.trim().to_ascii_lowercase())
        .filter(|k| !k.is_empty())
        .ok_or(DropReason::MissingField("kind"))?;

    // Alerts always carry a severity on the wire; no default here.
    let severity = Severity::parse(ra.severity.as_deref().unwrap_or_default())
        .ok_or(DropReason::UnknownSeverity)?;

    let location = ra
        .location
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());

    let ts_unix = parse_ts(&ra.timestamp.ok_or(DropReason::MissingField("timestamp"))?)
        .ok_or(DropReason::BadTimestamp)?;
    check_freshness(ts_unix, now, cfg)?;

    let quality = 0.6
        + if location.is_some() { 0.15 } else { 0.0 }
        + 0.25 * recency_weight(ts_unix, now, cfg);

    Ok((
        RecordBody::Alert(AlertEvent {
            kind,
            severity,
            location,
            ts_unix,
        }),
        quality,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: u64 = 1_700_000_000;

    fn raw(category: Category, payload: serde_json::Value) -> RawRecord {
        RawRecord {
            category,
            payload,
            arrived_at: NOW,
        }
    }

    fn vessel_payload(lat: f64, lon: f64, speed: f64, ts: u64) -> serde_json::Value {
        json!({
            "vessel_id": "MV-1",
            "lat": lat,
            "lon": lon,
            "speed_knots": speed,
            "timestamp": ts,
        })
    }

    #[test]
    fn vessel_valid_iff_in_range_and_fresh() {
        let cfg = ValidatorConfig::default();
        let ok = |v| validate(&raw(Category::VesselPosition, v), NOW, &cfg);

        assert!(ok(vessel_payload(45.0, -30.0, 12.5, NOW - 60)));
        assert!(ok(vessel_payload(-90.0, 180.0, 0.0, NOW)));
        assert!(!ok(vessel_payload(200.0, 0.0, 10.0, NOW))); // lat
        assert!(!ok(vessel_payload(0.0, -190.0, 10.0, NOW))); // lon
        assert!(!ok(vessel_payload(0.0, 0.0, 60.0, NOW))); // speed
        assert!(!ok(vessel_payload(0.0, 0.0, -1.0, NOW))); // negative speed
        assert!(!ok(vessel_payload(0.0, 0.0, 10.0, NOW - 31 * 60))); // stale
    }

    #[test]
    fn vessel_rejects_far_future_timestamps() {
        let cfg = ValidatorConfig::default();
        let r = raw(
            Category::VesselPosition,
            vessel_payload(0.0, 0.0, 10.0, NOW + 3600),
        );
        assert_eq!(clean(&r, NOW, &cfg).unwrap_err(), DropReason::FutureTimestamp);
        // Small skew is tolerated.
        let r = raw(
            Category::VesselPosition,
            vessel_payload(0.0, 0.0, 10.0, NOW + 60),
        );
        assert!(clean(&r, NOW, &cfg).is_ok());
    }

    #[test]
    fn vessel_coerces_string_numbers_and_numeric_ids() {
        let cfg = ValidatorConfig::default();
        let r = raw(
            Category::VesselPosition,
            json!({
                "mmsi": 244_660_000i64,
                "lat": "52.1",
                "lon": "4.3",
                "sog": "11.4",
                "cog": 181.0,
                "ts": NOW - 10,
                "source": "ais-north",
            }),
        );
        let rec = clean(&r, NOW, &cfg).unwrap();
        match rec.body {
            RecordBody::VesselPosition(v) => {
                assert_eq!(v.vessel_id, "244660000");
                assert!((v.lat - 52.1).abs() < f64::EPSILON);
                assert_eq!(v.heading_deg, Some(181.0));
                assert_eq!(v.source.as_deref(), Some("ais-north"));
            }
            other => panic!("unexpected body: {other:?}"),
        }
        assert!(rec.quality > 0.9); // all optional signals present and fresh
    }

    #[test]
    fn rfc3339_timestamps_parse() {
        assert_eq!(
            parse_ts(&TsAny::Text("2023-11-14T22:13:20Z".into())),
            Some(1_700_000_000)
        );
        assert_eq!(parse_ts(&TsAny::Text("not a date".into())), None);
    }

    #[test]
    fn port_congestion_must_be_normalized() {
        let cfg = ValidatorConfig::default();
        let payload = |congestion: f64| {
            json!({
                "code": "sgsin",
                "arrivals": 12,
                "departures": 9,
                "congestion": congestion,
                "timestamp": NOW - 5,
            })
        };
        let rec = clean(&raw(Category::PortMetric, payload(0.55)), NOW, &cfg).unwrap();
        match rec.body {
            RecordBody::PortMetric(p) => {
                assert_eq!(p.code, "SGSIN");
                assert_eq!(p.arrivals, 12);
            }
            other => panic!("unexpected body: {other:?}"),
        }
        assert_eq!(
            clean(&raw(Category::PortMetric, payload(1.4)), NOW, &cfg).unwrap_err(),
            DropReason::OutOfRange("congestion")
        );
    }

    #[test]
    fn news_severity_defaults_low_but_rejects_garbage() {
        let cfg = ValidatorConfig::default();
        let r = raw(
            Category::News,
            json!({
                "title": "  Strike closes  container terminal ",
                "summary": "<p>Freight backlog grows at the port.</p>",
                "timestamp": NOW - 120,
            }),
        );
        let rec = clean(&r, NOW, &cfg).unwrap();
        match &rec.body {
            RecordBody::News(n) => {
                assert_eq!(n.title, "Strike closes container terminal");
                assert_eq!(n.severity, Severity::Low);
                assert!(n.relevance > 0.0); // keyword-derived
            }
            other => panic!("unexpected body: {other:?}"),
        }

        let r = raw(
            Category::News,
            json!({ "title": "x", "severity": "catastrophic", "timestamp": NOW }),
        );
        assert_eq!(clean(&r, NOW, &cfg).unwrap_err(), DropReason::UnknownSeverity);
    }

    #[test]
    fn alert_requires_known_severity() {
        let cfg = ValidatorConfig::default();
        let r = raw(
            Category::Alert,
            json!({ "kind": "Piracy", "severity": "HIGH", "region": "Gulf of Aden", "ts": NOW }),
        );
        let rec = clean(&r, NOW, &cfg).unwrap();
        match rec.body {
            RecordBody::Alert(a) => {
                assert_eq!(a.kind, "piracy");
                assert_eq!(a.severity, Severity::High);
                assert_eq!(a.location.as_deref(), Some("Gulf of Aden"));
            }
            other => panic!("unexpected body: {other:?}"),
        }

        let r = raw(Category::Alert, json!({ "kind": "storm", "ts": NOW }));
        assert_eq!(clean(&r, NOW, &cfg).unwrap_err(), DropReason::UnknownSeverity);
    }

    #[test]
    fn quality_stays_in_unit_interval() {
        let cfg = ValidatorConfig::default();
        let r = raw(
            Category::Economic,
            json!({ "name": "baltic_dry", "value": 1420.0, "change_pct": 2.4, "ts": NOW }),
        );
        let rec = clean(&r, NOW, &cfg).unwrap();
        assert!((0.0..=1.0).contains(&rec.quality));
    }
}
