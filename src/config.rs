// src/config.rs
//! Static pipeline configuration: stream descriptors plus component
//! settings, loaded once at process start. Supports TOML or JSON, with an
//! env-var path override and file fallbacks:
//! 1) $PIPELINE_CONFIG_PATH
//! 2) config/pipeline.toml
//! 3) config/pipeline.json

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::batch::BatchConfig;
use crate::detector::DetectorConfig;
use crate::ingest::dedup::DedupConfig;
use crate::ingest::types::Category;
use crate::ingest::validate::ValidatorConfig;

const ENV_PATH: &str = "PIPELINE_CONFIG_PATH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    PersistentPush,
    Polled,
}

/// One configured stream. Immutable after load; "reloading" a stream means
/// `StreamSupervisor::restart(name)`, never mutation.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamDescriptor {
    pub name: String,
    pub transport: TransportKind,
    pub uri: String,
    /// Polled transports only.
    pub poll_interval_ms: Option<u64>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bounded read on persistent push transports.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Source names to accept; empty means everything.
    #[serde(default)]
    pub filters: Vec<String>,
    /// Which validator/buffer handles this stream's payloads.
    pub category: Category,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_read_timeout_ms() -> u64 {
    30_000
}
fn default_reconnect_delay_ms() -> u64 {
    5_000
}
fn default_max_retries() -> u32 {
    5
}

impl StreamDescriptor {
    /// A malformed descriptor prevents this one stream from starting; the
    /// rest of the pipeline proceeds.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("stream name must not be empty"));
        }
        if self.uri.trim().is_empty() {
            return Err(anyhow!("stream `{}`: uri must not be empty", self.name));
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(anyhow!("stream `{}`: timeouts must be positive", self.name));
        }
        if self.transport == TransportKind::Polled
            && self.poll_interval_ms.map_or(true, |ms| ms == 0)
        {
            return Err(anyhow!(
                "stream `{}`: polled transport requires poll_interval_ms > 0",
                self.name
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(0))
    }

    /// Interval the rate limiter gates this stream at: the poll cadence for
    /// polled transports, the reconnect delay for push transports.
    pub fn limiter_interval(&self) -> Duration {
        match self.transport {
            TransportKind::Polled => self.poll_interval(),
            TransportKind::PersistentPush => self.reconnect_delay(),
        }
    }

    /// `true` if the record source passes the descriptor's filter list.
    pub fn accepts_source(&self, source: Option<&str>) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        match source {
            Some(s) => self.filters.iter().any(|f| f.eq_ignore_ascii_case(s)),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Per-category ring capacity.
    pub capacity: usize,
    /// Occupancy that triggers an early batch cycle.
    pub high_water: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            capacity: 200,
            high_water: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub streams: Vec<StreamDescriptor>,
    pub buffer: BufferSettings,
    pub dedup: DedupConfig,
    pub validator: ValidatorConfig,
    pub detector: DetectorConfig,
    pub batch: BatchConfig,
}

impl PipelineConfig {
    /// Split descriptors into startable and rejected, logging each rejection.
    /// Duplicate names are rejected past the first occurrence.
    pub fn partition_streams(&self) -> (Vec<StreamDescriptor>, usize) {
        let mut seen = std::collections::HashSet::new();
        let mut valid = Vec::with_capacity(self.streams.len());
        let mut rejected = 0usize;
        for d in &self.streams {
            if let Err(e) = d.validate() {
                tracing::error!(error = %e, "rejecting malformed stream descriptor");
                rejected += 1;
                continue;
            }
            if !seen.insert(d.name.clone()) {
                tracing::error!(stream = %d.name, "rejecting duplicate stream name");
                rejected += 1;
                continue;
            }
            valid.push(d.clone());
        }
        (valid, rejected)
    }
}

/// Load configuration from an explicit path. TOML or JSON by extension.
pub fn load_from(path: &Path) -> Result<PipelineConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading pipeline config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_config(&content, &ext)
}

/// Env var + fallbacks; an empty default when nothing is configured.
pub fn load_default() -> Result<PipelineConfig> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_from(&pb);
        }
        return Err(anyhow!("PIPELINE_CONFIG_PATH points to non-existent path"));
    }
    let toml_p = PathBuf::from("config/pipeline.toml");
    if toml_p.exists() {
        return load_from(&toml_p);
    }
    let json_p = PathBuf::from("config/pipeline.json");
    if json_p.exists() {
        return load_from(&json_p);
    }
    Ok(PipelineConfig::default())
}

fn parse_config(s: &str, hint_ext: &str) -> Result<PipelineConfig> {
    if hint_ext == "json" {
        return serde_json::from_str(s).context("parsing pipeline config json");
    }
    toml::from_str(s).context("parsing pipeline config toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[streams]]
        name = "ais-north"
        transport = "persistent_push"
        uri = "tcp://153.44.253.27:5631"
        category = "vessel_position"
        read_timeout_ms = 15000

        [[streams]]
        name = "port-metrics"
        transport = "polled"
        uri = "https://example.test/ports"
        poll_interval_ms = 60000
        category = "port_metric"
        filters = ["PortAuthority"]

        [buffer]
        capacity = 100
        high_water = 25

        [dedup]
        ttl_secs = 120
    "#;

    #[test]
    fn toml_parses_with_defaults_filled() {
        let cfg = parse_config(SAMPLE, "toml").unwrap();
        assert_eq!(cfg.streams.len(), 2);
        let ais = &cfg.streams[0];
        assert_eq!(ais.transport, TransportKind::PersistentPush);
        assert_eq!(ais.category, Category::VesselPosition);
        assert_eq!(ais.read_timeout_ms, 15_000);
        assert_eq!(ais.max_retries, 5); // default
        assert_eq!(cfg.buffer.capacity, 100);
        assert_eq!(cfg.dedup.ttl_secs, 120);
        assert_eq!(cfg.dedup.capacity, 8192); // default survives partial table
    }

    #[test]
    fn polled_without_interval_is_rejected() {
        let d = StreamDescriptor {
            name: "x".into(),
            transport: TransportKind::Polled,
            uri: "https://example.test".into(),
            poll_interval_ms: None,
            connect_timeout_ms: 1000,
            read_timeout_ms: 1000,
            reconnect_delay_ms: 1000,
            max_retries: 3,
            filters: vec![],
            category: Category::News,
        };
        assert!(d.validate().is_err());
    }

    #[test]
    fn partition_drops_bad_and_duplicate_descriptors() {
        let mut cfg = parse_config(SAMPLE, "toml").unwrap();
        let mut dup = cfg.streams[0].clone();
        dup.poll_interval_ms = None;
        cfg.streams.push(dup); // duplicate name
        let mut bad = cfg.streams[1].clone();
        bad.name = "broken".into();
        bad.uri = " ".into();
        cfg.streams.push(bad);

        let (valid, rejected) = cfg.partition_streams();
        assert_eq!(valid.len(), 2);
        assert_eq!(rejected, 2);
    }

    #[test]
    fn source_filters_match_case_insensitively() {
        let cfg = parse_config(SAMPLE, "toml").unwrap();
        let d = &cfg.streams[1];
        assert!(d.accepts_source(Some("portauthority")));
        assert!(!d.accepts_source(Some("other")));
        assert!(!d.accepts_source(None));
        assert!(cfg.streams[0].accepts_source(None)); // empty filter list
    }

    #[serial_test::serial]
    #[test]
    fn default_load_uses_env_then_fallbacks() {
        let old = std::env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_current_dir(tmp.path()).unwrap();
        std::env::remove_var(ENV_PATH);

        // No files in temp CWD: empty default.
        let cfg = load_default().unwrap();
        assert!(cfg.streams.is_empty());

        // Env override wins.
        let p = tmp.path().join("pipeline.json");
        std::fs::write(&p, r#"{"buffer": {"capacity": 7, "high_water": 2}}"#).unwrap();
        std::env::set_var(ENV_PATH, p.display().to_string());
        let cfg = load_default().unwrap();
        assert_eq!(cfg.buffer.capacity, 7);
        std::env::remove_var(ENV_PATH);

        std::env::set_current_dir(&old).unwrap();
    }
}
