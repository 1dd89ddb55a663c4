//! Time sources for the rate limiting core.
//!
//! Every timestamp the store and limiters handle comes from a [`Clock`], so
//! window behaviour can be driven deterministically in tests with a
//! [`ManualClock`] instead of sleeping.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// A source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system clock.
///
/// The wall-clock reading is taken once at construction; later readings add
/// monotonic elapsed time to it, so `now` never steps backwards when the
/// system clock is adjusted.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    base: DateTime<Utc>,
    started: Instant,
}

impl SystemClock {
    /// Anchor a new clock at the current wall-clock time.
    pub fn new() -> Self {
        Self {
            base: Utc::now(),
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        shift_forward(self.base, to_delta(self.started.elapsed()))
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a manual clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = shift_forward(*now, to_delta(by));
    }

    /// Jump the clock to an exact instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Convert a std duration to a chrono delta, saturating at ten thousand years.
pub(crate) fn to_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 10_000))
}

pub(crate) fn shift_forward(instant: DateTime<Utc>, by: chrono::Duration) -> DateTime<Utc> {
    instant
        .checked_add_signed(by)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn shift_back(instant: DateTime<Utc>, by: chrono::Duration) -> DateTime<Utc> {
    instant
        .checked_sub_signed(by)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
