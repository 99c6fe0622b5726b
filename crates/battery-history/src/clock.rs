//! Time sources used for segment naming and wall-clock anchors.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Milliseconds on a clock that never goes backwards.
    fn monotonic_time_ms(&self) -> i64;

    /// Wall-clock milliseconds since the Unix epoch.
    fn current_time_ms(&self) -> i64;
}

/// Clock backed by the operating system.
///
/// Monotonic time starts at the wall-clock time of construction and then
/// advances with [`Instant`], so segment names stay close to real time while
/// never moving backwards within a process.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
    origin_ms: i64,
}

impl SystemClock {
    /// Creates a clock anchored at the current time.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_ms: wall_clock_ms(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_time_ms(&self) -> i64 {
        self.origin_ms + self.origin.elapsed().as_millis() as i64
    }

    fn current_time_ms(&self) -> i64 {
        wall_clock_ms()
    }
}

fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Manually driven clock for tests and replay.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    monotonic_ms: Arc<AtomicI64>,
    current_ms: Arc<AtomicI64>,
}

impl ManualClock {
    /// Creates a clock at the given times.
    pub fn new(monotonic_ms: i64, current_ms: i64) -> Self {
        Self {
            monotonic_ms: Arc::new(AtomicI64::new(monotonic_ms)),
            current_ms: Arc::new(AtomicI64::new(current_ms)),
        }
    }

    /// Moves both clocks forward by `ms`.
    pub fn advance(&self, ms: i64) {
        self.monotonic_ms.fetch_add(ms, Ordering::SeqCst);
        self.current_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Sets the monotonic time.
    pub fn set_monotonic_time_ms(&self, ms: i64) {
        self.monotonic_ms.store(ms, Ordering::SeqCst);
    }

    /// Sets the wall-clock time.
    pub fn set_current_time_ms(&self, ms: i64) {
        self.current_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn monotonic_time_ms(&self) -> i64 {
        self.monotonic_ms.load(Ordering::SeqCst)
    }

    fn current_time_ms(&self) -> i64 {
        self.current_ms.load(Ordering::SeqCst)
    }
}
