// src/stats.rs
//! Concurrency-safe per-stream counters plus a snapshot view for the ops
//! surface. Each stream unit owns one `Arc<StreamStats>` handle and is the
//! only writer; snapshots read the atomics without coordination.
//!
//! `messages_received` counts raw arrivals; `valid_records` counts
//! post-validation survivors. The two are never conflated.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::ingest::buffer::BufferSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl StreamState {
    fn as_u8(self) -> u8 {
        match self {
            StreamState::Idle => 0,
            StreamState::Connecting => 1,
            StreamState::Connected => 2,
            StreamState::Disconnected => 3,
            StreamState::Failed => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamState::Connecting,
            2 => StreamState::Connected,
            3 => StreamState::Disconnected,
            4 => StreamState::Failed,
            _ => StreamState::Idle,
        }
    }
}

#[derive(Debug)]
pub struct StreamStats {
    connected: AtomicBool,
    state: AtomicU8,
    messages_received: AtomicU64,
    valid_records: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
    last_message_at: AtomicU64,
    uptime_start: u64,
}

impl StreamStats {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            state: AtomicU8::new(StreamState::Idle.as_u8()),
            messages_received: AtomicU64::new(0),
            valid_records: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_message_at: AtomicU64::new(0),
            uptime_start: now_unix(),
        }
    }

    pub fn set_state(&self, state: StreamState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
        self.connected
            .store(state == StreamState::Connected, Ordering::Relaxed);
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_message(&self, now: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_at.store(now, Ordering::Relaxed);
    }

    pub fn record_valid(&self) {
        self.valid_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn valid_records(&self) -> u64 {
        self.valid_records.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    fn snapshot(&self, name: &str) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            name: name.to_string(),
            state: self.state(),
            connected: self.is_connected(),
            messages_received: self.messages_received(),
            valid_records: self.valid_records(),
            errors: self.errors(),
            reconnects: self.reconnects(),
            last_message_at: self.last_message_at.load(Ordering::Relaxed),
            uptime_start: self.uptime_start,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatsSnapshot {
    pub name: String,
    pub state: StreamState,
    pub connected: bool,
    pub messages_received: u64,
    pub valid_records: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub last_message_at: u64,
    pub uptime_start: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub per_stream: Vec<StreamStatsSnapshot>,
    pub buffer_occupancy: BTreeMap<String, usize>,
    pub connected_count: usize,
    pub total_streams: usize,
}

#[derive(Debug, Default)]
pub struct StatisticsRegistry {
    streams: RwLock<HashMap<String, Arc<StreamStats>>>,
}

impl StatisticsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch-or-create the stats handle for a stream. A `restart` keeps the
    /// existing counters; `Failed` streams stay visible here.
    pub fn register(&self, name: &str) -> Arc<StreamStats> {
        let mut streams = self.streams.write().expect("stats lock poisoned");
        Arc::clone(
            streams
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(StreamStats::new())),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<StreamStats>> {
        self.streams
            .read()
            .expect("stats lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn snapshot(&self, buffers: &BufferSet) -> StatsSnapshot {
        let streams = self.streams.read().expect("stats lock poisoned");
        let mut per_stream: Vec<StreamStatsSnapshot> = streams
            .iter()
            .map(|(name, stats)| stats.snapshot(name))
            .collect();
        per_stream.sort_by(|a, b| a.name.cmp(&b.name));

        let connected_count = per_stream.iter().filter(|s| s.connected).count();
        let total_streams = per_stream.len();
        let buffer_occupancy = buffers
            .occupancy()
            .into_iter()
            .map(|(c, n)| (c.as_str().to_string(), n))
            .collect();

        StatsSnapshot {
            per_stream,
            buffer_occupancy,
            connected_count,
            total_streams,
        }
    }
}

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
