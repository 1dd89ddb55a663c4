//! Fixed window rate limiting.
//!
//! Each key's first request opens a window of the configured length. Requests
//! are counted until the window elapses, at which point the count is
//! discarded and a new window opens at the next request. Windows are phased
//! per key rather than aligned to wall-clock boundaries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::backend::{Decision, RateLimiterBackend};
use super::clock::{shift_forward, to_delta, Clock};
use super::store::ExpiringStore;

/// Per-key accounting for a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowRecord {
    /// Requests admitted in the current window
    pub count: u64,
    /// When the current window opened
    pub window_start: DateTime<Utc>,
}

impl FixedWindowRecord {
    /// A fresh, empty window starting at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }
}

/// A rate limiter that counts requests in non-overlapping per-key windows.
pub struct FixedWindowLimiter {
    store: Arc<ExpiringStore<FixedWindowRecord>>,
    clock: Arc<dyn Clock>,
    /// Requests allowed per window, inclusive
    limit: u64,
    window: Duration,
}

impl FixedWindowLimiter {
    /// Create a fixed window limiter over a dedicated store.
    pub fn new(
        store: Arc<ExpiringStore<FixedWindowRecord>>,
        clock: Arc<dyn Clock>,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            limit,
            window,
        }
    }

    /// The store holding this limiter's records.
    pub fn store(&self) -> &Arc<ExpiringStore<FixedWindowRecord>> {
        &self.store
    }

    /// Requests allowed per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests admitted so far in the key's current window.
    ///
    /// Returns `None` if the key has no live record or its window has elapsed.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        self.store
            .get(key)
            .filter(|record| !self.window_elapsed(record, now))
            .map(|record| record.count)
    }

    /// A window that starts after `now` was opened before the clock stepped
    /// back; it is treated as elapsed so the key is not locked out.
    fn window_elapsed(&self, record: &FixedWindowRecord, now: DateTime<Utc>) -> bool {
        now < record.window_start || now - record.window_start >= to_delta(self.window)
    }
}

impl RateLimiterBackend for FixedWindowLimiter {
    fn allow(&self, key: &str) -> Decision {
        let now = self.clock.now();

        let decision = self.store.update(key, |current| {
            let mut record = match current {
                Some(record) if !self.window_elapsed(record, now) => *record,
                _ => FixedWindowRecord::new(now),
            };
            let reset_at = shift_forward(record.window_start, to_delta(self.window));

            if record.count >= self.limit {
                let denied = Decision {
                    allowed: false,
                    limit: self.limit,
                    remaining: 0,
                    reset_at,
                };
                return (None, denied);
            }

            record.count += 1;
            let allowed = Decision {
                allowed: true,
                limit: self.limit,
                remaining: self.limit - record.count,
                reset_at,
            };
            (Some(record), allowed)
        });

        if decision.allowed {
            trace!(key = %key, remaining = decision.remaining, "Fixed window request admitted");
        } else {
            debug!(key = %key, reset_at = %decision.reset_at, "Fixed window limit exceeded");
        }

        decision
    }
}
