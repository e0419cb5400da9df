// src/ingest/dedup.rs
//! Short-lived identity cache suppressing redundant records.
//!
//! Bounded two ways: a TTL sweep (background task) and a hard capacity with
//! least-recently-used eviction. The check-and-insert runs in one critical
//! section, so no two concurrent callers can both see `is_new = true` for
//! the same key.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ingest::types::DedupKey;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
    /// How often the background sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 5 * 60,
            capacity: 8192,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug)]
struct Inner {
    /// key -> (inserted_at unix secs, lru sequence)
    map: HashMap<DedupKey, (u64, u64)>,
    /// lru sequence -> key; lowest sequence is the eviction victim.
    order: BTreeMap<u64, DedupKey>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct DedupCache {
    inner: Mutex<Inner>,
    ttl_secs: u64,
    capacity: usize,
}

impl DedupCache {
    pub fn new(cfg: &DedupConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            ttl_secs: cfg.ttl_secs,
            capacity: cfg.capacity.max(1),
        }
    }

    /// Returns `true` iff the key was not present (within TTL). A duplicate
    /// hit refreshes the entry's LRU position but not its TTL.
    pub fn check_and_insert(&self, key: &DedupKey) -> bool {
        self.check_and_insert_at(key, now_unix())
    }

    /// Clock-injected form; the public entry point above feeds it wall time.
    pub fn check_and_insert_at(&self, key: &DedupKey, now: u64) -> bool {
        let mut inner = self.inner.lock().expect("dedup mutex poisoned");

        if let Some((inserted_at, seq)) = inner.map.get(key).copied() {
            if now.saturating_sub(inserted_at) <= self.ttl_secs {
                // Still fresh: refresh LRU position, report duplicate.
                let new_seq = inner.next_seq;
                inner.next_seq += 1;
                inner.order.remove(&seq);
                inner.order.insert(new_seq, key.clone());
                inner.map.insert(key.clone(), (inserted_at, new_seq));
                return false;
            }
            // Expired entry the sweeper has not reaped yet.
            inner.map.remove(key);
            inner.order.remove(&seq);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.map.insert(key.clone(), (now, seq));
        inner.order.insert(seq, key.clone());

        while inner.map.len() > self.capacity {
            let Some(victim_seq) = inner.order.keys().next().copied() else {
                break;
            };
            if let Some(victim) = inner.order.remove(&victim_seq) {
                inner.map.remove(&victim);
                counter!("dedup_capacity_evictions_total").increment(1);
            }
        }

        true
    }

    /// Evict everything older than the TTL. Returns the eviction count.
    pub fn sweep_expired_at(&self, now: u64) -> usize {
        let mut inner = self.inner.lock().expect("dedup mutex poisoned");
        let expired: Vec<(DedupKey, u64)> = inner
            .map
            .iter()
            .filter(|(_, &(inserted_at, _))| now.saturating_sub(inserted_at) > self.ttl_secs)
            .map(|(k, &(_, seq))| (k.clone(), seq))
            .collect();
        for (key, seq) in &expired {
            inner.map.remove(key);
            inner.order.remove(seq);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedup mutex poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background TTL sweep; exits when the shutdown flag flips.
pub fn spawn_ttl_sweeper(
    cache: Arc<DedupCache>,
    cfg: &DedupConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let every = Duration::from_secs(cfg.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = cache.sweep_expired_at(now_unix());
                    if evicted > 0 {
                        counter!("dedup_ttl_evictions_total").increment(evicted as u64);
                        tracing::debug!(evicted, "dedup ttl sweep");
                    }
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

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl: u64, cap: usize) -> DedupCache {
        DedupCache::new(&DedupConfig {
            ttl_secs: ttl,
            capacity: cap,
            sweep_interval_secs: 30,
        })
    }

    #[test]
    fn second_insert_within_ttl_is_duplicate() {
        let c = cache(300, 100);
        let k = DedupKey::raw("vessel:V1:100");
        assert!(c.check_and_insert_at(&k, 1000));
        assert!(!c.check_and_insert_at(&k, 1100));
    }

    #[test]
    fn key_is_new_again_after_ttl() {
        let c = cache(300, 100);
        let k = DedupKey::raw("vessel:V1:100");
        assert!(c.check_and_insert_at(&k, 1000));
        assert!(!c.check_and_insert_at(&k, 1300)); // exactly at ttl: still fresh
        assert!(c.check_and_insert_at(&k, 1301));
    }

    #[test]
    fn sweep_reaps_only_expired_entries() {
        let c = cache(300, 100);
        c.check_and_insert_at(&DedupKey::raw("a"), 1000);
        c.check_and_insert_at(&DedupKey::raw("b"), 1250);
        assert_eq!(c.sweep_expired_at(1400), 1); // only "a" is past ttl
        assert_eq!(c.len(), 1);
        assert!(!c.check_and_insert_at(&DedupKey::raw("b"), 1400));
        assert!(c.check_and_insert_at(&DedupKey::raw("a"), 1400));
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let c = cache(10_000, 2);
        let (a, b, x) = (
            DedupKey::raw("a"),
            DedupKey::raw("b"),
            DedupKey::raw("x"),
        );
        assert!(c.check_and_insert_at(&a, 1));
        assert!(c.check_and_insert_at(&b, 2));
        // Touch "a" so "b" becomes the LRU victim.
        assert!(!c.check_and_insert_at(&a, 3));
        assert!(c.check_and_insert_at(&x, 4));
        assert_eq!(c.len(), 2);
        assert!(!c.check_and_insert_at(&a, 5)); // survived
        assert!(c.check_and_insert_at(&b, 6)); // evicted, new again
    }

    #[test]
    fn concurrent_same_key_yields_one_winner() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let c = Arc::new(cache(300, 1000));
        let wins = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&c);
            let wins = Arc::clone(&wins);
            handles.push(std::thread::spawn(move || {
                if c.check_and_insert_at(&DedupKey::raw("same"), 1000) {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
