//! Wall clock abstraction.
//!
//! Timestamps are milliseconds since the Unix epoch. Engine components take
//! time from a [`Clock`] so tests can drive time by hand.

use crate::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now(&self) -> Timestamp;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, timestamp: Timestamp) {
        self.now.store(timestamp, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Stamp for a local write to a record last written at `previous`.
///
/// Local writes to the same id must order strictly, even inside one clock
/// tick or after a backwards clock step.
pub fn next_write_stamp(now: Timestamp, previous: Option<Timestamp>) -> Timestamp {
    match previous {
        Some(prev) if prev >= now => prev + 1,
        _ => now,
    }
}
