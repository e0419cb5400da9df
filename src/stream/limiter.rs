// src/stream/limiter.rs
//! Per-stream minimum-interval gate. `acquire` parks the caller until the
//! stream's interval has elapsed since its last granted request, then stamps
//! the grant. Check-and-stamp happens in one critical section; the sleep
//! happens with the lock released.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct Slot {
    interval_ms: u64,
    last_granted_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    slots: Mutex<HashMap<String, Slot>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a stream with its minimum interval.
    pub fn register(&self, name: &str, interval: Duration) {
        let mut slots = self.slots.lock().expect("limiter mutex poisoned");
        slots.insert(
            name.to_string(),
            Slot {
                interval_ms: interval.as_millis() as u64,
                last_granted_ms: None,
            },
        );
    }

    /// Block until the stream may proceed, then record the grant.
    pub async fn acquire(&self, name: &str) {
        loop {
            match self.try_acquire_at(name, now_ms()) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Single-step grant attempt against an injected clock. `Ok` means the
    /// grant was recorded; `Err` carries the remaining wait. Unregistered
    /// streams pass freely.
    pub fn try_acquire_at(&self, name: &str, now_ms: u64) -> Result<(), Duration> {
        let mut slots = self.slots.lock().expect("limiter mutex poisoned");
        let Some(slot) = slots.get_mut(name) else {
            return Ok(());
        };
        match slot.last_granted_ms {
            Some(last) if now_ms.saturating_sub(last) < slot.interval_ms => {
                let remaining = slot.interval_ms - now_ms.saturating_sub(last);
                Err(Duration::from_millis(remaining))
            }
            _ => {
                slot.last_granted_ms = Some(now_ms);
                Ok(())
            }
        }
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
