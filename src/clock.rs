//! Millisecond clock sources
//!
//! Node bookkeeping (stale-since markers, pending request timestamps) reads
//! time through [`Clock`] so tests can drive it by hand.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// System clock that never goes backward.
///
/// If the wall clock steps back (e.g. NTP adjustment), the previous
/// high-water mark is returned instead.
pub struct MonotonicClock {
    high_water_ms: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            high_water_ms: AtomicI64::new(0),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        let prev = self.high_water_ms.fetch_max(wall, Ordering::AcqRel);
        wall.max(prev)
    }
}

/// Clock advanced explicitly by the caller.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance_millis(&self, delta: i64) {
        self.now_ms.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn set_millis(&self, now: i64) {
        self.now_ms.store(now, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::Acquire)
    }
}
