//! Clock abstraction for dependency injection.
//!
//! All sale-engine time comparisons (reservation expiry, terminal-record
//! retention, window boundaries) go through the [`Clock`] trait so tests can
//! drive expiry deterministically instead of sleeping. Persisted timestamps
//! are UTC milliseconds since the Unix epoch.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// UTC milliseconds since the Unix epoch.
///
/// Signed to match the persisted column type; values before 1970 never occur
/// in practice.
pub type UnixMillis = i64;

/// Abstraction over the system clock for dependency injection.
///
/// The default implementation ([`SystemClock`]) delegates to
/// `std::time::SystemTime`. Tests use [`ManualClock`] to advance time
/// explicitly.
pub trait Clock: Send + Sync {
    /// Returns the current time as UTC milliseconds since the Unix epoch.
    fn now_millis(&self) -> UnixMillis;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn now_millis(&self) -> UnixMillis {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch")
            .as_millis() as i64
    }
}

/// Manually-advanced clock for deterministic tests.
///
/// Starts at an arbitrary fixed instant and only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Creates a manual clock pinned at `start` milliseconds.
    #[must_use]
    pub fn new(start: UnixMillis) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Advances the clock by `millis`.
    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Pins the clock at an absolute instant.
    pub fn set(&self, millis: UnixMillis) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> UnixMillis {
        self.now.load(Ordering::SeqCst)
    }
}
