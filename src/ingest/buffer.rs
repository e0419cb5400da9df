// src/ingest/buffer.rs
//! Bounded rolling stores, one per category. Producers never block on
//! capacity: at the limit the oldest entry is dropped, counted in stats.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use metrics::counter;

use crate::ingest::types::{Category, CleanedRecord};

/// CleanedRecord plus its monotonic insertion index.
#[derive(Debug, Clone)]
pub struct BufferEntry {
    pub index: u64,
    pub record: CleanedRecord,
}

#[derive(Debug)]
struct Inner {
    buf: VecDeque<BufferEntry>,
    next_index: u64,
    dropped: u64,
}

/// Fixed-capacity ring with atomic drain.
#[derive(Debug)]
pub struct IngestionBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl IngestionBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                next_index: 0,
                dropped: 0,
            }),
            capacity,
        }
    }

    /// Insert a record, evicting the oldest entry first when at capacity.
    /// Returns `true` if an eviction happened.
    pub fn append(&self, record: CleanedRecord) -> bool {
        let mut inner = self.inner.lock().expect("buffer mutex poisoned");
        let mut evicted = false;
        while inner.buf.len() >= self.capacity {
            inner.buf.pop_front();
            inner.dropped += 1;
            evicted = true;
        }
        let index = inner.next_index;
        inner.next_index += 1;
        inner.buf.push_back(BufferEntry { index, record });
        evicted
    }

    /// Atomically take everything. A concurrent `append` lands either in the
    /// returned slice or in the buffer afterwards, never both or neither.
    pub fn drain_all(&self) -> Vec<CleanedRecord> {
        let mut inner = self.inner.lock().expect("buffer mutex poisoned");
        inner.buf.drain(..).map(|e| e.record).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("buffer mutex poisoned").buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total drop-oldest evictions since startup.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("buffer mutex poisoned").dropped
    }
}

/// All per-category buffers, supervisor-owned and passed by reference to the
/// batch processor and detector.
#[derive(Debug)]
pub struct BufferSet {
    buffers: HashMap<Category, IngestionBuffer>,
}

impl BufferSet {
    pub fn new(capacity: usize) -> Self {
        let buffers = Category::ALL
            .iter()
            .map(|&c| (c, IngestionBuffer::with_capacity(capacity)))
            .collect();
        Self { buffers }
    }

    fn buffer(&self, category: Category) -> &IngestionBuffer {
        // Every category is inserted in `new`.
        &self.buffers[&category]
    }

    /// Returns `true` if the append evicted an older entry.
    pub fn append(&self, record: CleanedRecord) -> bool {
        let category = record.category();
        let evicted = self.buffer(category).append(record);
        if evicted {
            counter!("buffer_evictions_total", "category" => category.as_str()).increment(1);
        }
        evicted
    }

    pub fn len(&self, category: Category) -> usize {
        self.buffer(category).len()
    }

    pub fn is_empty(&self) -> bool {
        Category::ALL.iter().all(|&c| self.buffer(c).is_empty())
    }

    pub fn drain(&self, category: Category) -> Vec<CleanedRecord> {
        self.buffer(category).drain_all()
    }

    /// Drain every category; keyed result for the batch processor.
    pub fn drain_all(&self) -> HashMap<Category, Vec<CleanedRecord>> {
        Category::ALL
            .iter()
            .map(|&c| (c, self.buffer(c).drain_all()))
            .collect()
    }

    pub fn occupancy(&self) -> HashMap<Category, usize> {
        Category::ALL
            .iter()
            .map(|&c| (c, self.buffer(c).len()))
            .collect()
    }

    pub fn dropped(&self, category: Category) -> u64 {
        self.buffer(category).dropped()
    }
}
