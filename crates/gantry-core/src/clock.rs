//! Wall-clock abstraction so heartbeat and retry math is testable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time, in epoch seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// The real clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// A hand-driven clock for tests. Stores milliseconds so `advance` with
/// fractional seconds stays exact.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Arc<Self> {
        Arc::new(ManualClock {
            millis: AtomicU64::new((start * 1000.0) as u64),
        })
    }

    pub fn advance(&self, seconds: f64) {
        self.millis
            .fetch_add((seconds * 1000.0) as u64, Ordering::SeqCst);
    }

    pub fn set(&self, seconds: f64) {
        self.millis
            .store((seconds * 1000.0) as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.millis.load(Ordering::SeqCst) as f64 / 1000.0
    }
}
