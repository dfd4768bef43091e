//! Millisecond clocks that drive a [`TimingWheel`](super::TimingWheel).

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// Source of the current time in milliseconds.
pub trait Clock: Send + Sync {
    /// Milliseconds since the clock's epoch.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time since the Unix epoch. May move backwards.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Steady time since construction.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Start a clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self { Self::new() }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 { u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX) }
}

/// Clock moved only by explicit calls, for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Start at `ms`.
    #[must_use]
    pub fn new(ms: u64) -> Self {
        Self {
            now: AtomicU64::new(ms),
        }
    }

    /// Jump to `ms`, forwards or backwards.
    pub fn set(&self, ms: u64) { self.now.store(ms, Ordering::SeqCst); }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 { self.now.load(Ordering::SeqCst) }
}
