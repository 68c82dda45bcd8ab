//! Wall-clock sources
//!
//! The scheduler ages cached batches by both frame count and seconds. The
//! seconds come from a [`Clock`] so tests can drive time by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source in seconds
pub trait Clock: Send + Sync {
    fn now_seconds(&self) -> f64;
}

/// Real time measured from construction
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock with microsecond resolution
#[derive(Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.micros.fetch_add(by.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn set_seconds(&self, seconds: f64) {
        self.micros.store((seconds.max(0.0) * 1_000_000.0) as u64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_seconds(&self) -> f64 {
        self.micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
}
