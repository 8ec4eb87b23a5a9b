//! Time sources for the pipeline.
//!
//! Scheduled times in the primary queue and "now" in the heuristic must come
//! from the same monotonic clock, so both take a [`Clock`]. The confirmation
//! loop sleeps through a [`Sleeper`] so its 20 s budget can be exercised in
//! tests without real waiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Monotonic milliseconds since an arbitrary process-local origin.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Process uptime clock backed by [`Instant`].
///
/// All instances share one origin, so timestamps from different
/// `MonotonicClock` values are comparable.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        let origin = ORIGIN.get_or_init(Instant::now);
        // Offset by one so a real reading is never the "unscheduled" zero.
        u64::try_from(origin.elapsed().as_millis())
            .unwrap_or(u64::MAX - 1)
            .saturating_add(1)
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Blocking sleep used between confirmation polls.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real blocking sleep on the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested sleeps without blocking.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sleeps requested so far.
    pub fn count(&self) -> usize {
        self.sleeps.lock().map_or(0, |s| s.len())
    }

    /// Sum of all requested sleeps.
    pub fn total(&self) -> Duration {
        self.sleeps
            .lock()
            .map_or(Duration::ZERO, |s| s.iter().sum())
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
    }
}
