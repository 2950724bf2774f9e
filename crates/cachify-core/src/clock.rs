//! Injected time source.
//!
//! Every time comparison in the caching stack goes through a [`Clock`] so
//! tests can advance time deterministically. [`SystemClock`] is the default;
//! [`ManualClock`] is the test double.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use time::OffsetDateTime;

/// A source of the current UTC instant.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> OffsetDateTime;
}

/// Shared, dynamically-dispatched clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A manually-advanced clock for deterministic tests.
///
/// Cloning shares the underlying instant, so a clone handed to the cache and
/// one kept by the test observe the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<OffsetDateTime>>,
}

impl ManualClock {
    /// Create a clock pinned at `start`.
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Create a clock pinned at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(OffsetDateTime::now_utc())
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.write().expect("clock lock poisoned");
        *now += delta;
    }

    /// Pin the clock to an absolute instant.
    pub fn set(&self, instant: OffsetDateTime) {
        let mut now = self.now.write().expect("clock lock poisoned");
        *now = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.read().expect("clock lock poisoned")
    }
}
