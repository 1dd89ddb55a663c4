//! Sliding window log rate limiting.
//!
//! Every admitted request's timestamp is kept in a per-key log. On each call
//! entries older than the trailing window are dropped and the remaining
//! length is compared with the limit, giving exact rolling-window counts at
//! the cost of O(limit) state per key.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::backend::{Decision, RateLimiterBackend};
use super::clock::{shift_back, shift_forward, to_delta, Clock};
use super::store::ExpiringStore;

/// Per-key log of admitted request timestamps, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlidingWindowRecord {
    /// Admission timestamps in ascending order
    pub timestamps: VecDeque<DateTime<Utc>>,
}

impl SlidingWindowRecord {
    /// Drop every timestamp at or before `cutoff`.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) {
        self.timestamps.retain(|ts| *ts > cutoff);
    }

    /// Record an admission at `at`, keeping the log in ascending order even
    /// if `at` precedes entries already logged.
    pub fn record(&mut self, at: DateTime<Utc>) {
        let position = self.timestamps.partition_point(|ts| *ts <= at);
        self.timestamps.insert(position, at);
    }

    /// The oldest retained timestamp.
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.timestamps.front().copied()
    }

    /// Number of retained timestamps.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// A rate limiter that admits at most `limit` requests in any trailing window.
pub struct SlidingWindowLimiter {
    store: Arc<ExpiringStore<SlidingWindowRecord>>,
    clock: Arc<dyn Clock>,
    limit: u64,
    window: Duration,
    /// Write the pruned log back when a request is denied
    persist_pruned_on_deny: bool,
}

impl SlidingWindowLimiter {
    /// Create a sliding window limiter over a dedicated store.
    ///
    /// Denied calls leave the stored log untouched; see
    /// [`persist_pruned_on_deny`](Self::persist_pruned_on_deny).
    pub fn new(
        store: Arc<ExpiringStore<SlidingWindowRecord>>,
        clock: Arc<dyn Clock>,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            limit,
            window,
            persist_pruned_on_deny: false,
        }
    }

    /// Also write back the pruned log when a request is denied.
    ///
    /// Each such write refreshes the entry's expiration, so a client that
    /// keeps being denied stays tracked, and counts towards the store's
    /// request total.
    pub fn persist_pruned_on_deny(mut self, enabled: bool) -> Self {
        self.persist_pruned_on_deny = enabled;
        self
    }

    /// The store holding this limiter's records.
    pub fn store(&self) -> &Arc<ExpiringStore<SlidingWindowRecord>> {
        &self.store
    }

    /// Requests allowed per trailing window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests counted against the key right now, without recording one.
    pub fn current_count(&self, key: &str) -> usize {
        let now = self.clock.now();
        let Some(mut record) = self.store.get(key) else {
            return 0;
        };
        record.prune(shift_back(now, to_delta(self.window)));
        record.len()
    }
}

impl RateLimiterBackend for SlidingWindowLimiter {
    fn allow(&self, key: &str) -> Decision {
        let now = self.clock.now();
        let window = to_delta(self.window);
        let cutoff = shift_back(now, window);

        let decision = self.store.update(key, |current| {
            let mut record = current.cloned().unwrap_or_default();
            record.prune(cutoff);

            if record.len() as u64 >= self.limit {
                let oldest = record.oldest().unwrap_or(now);
                let denied = Decision {
                    allowed: false,
                    limit: self.limit,
                    remaining: 0,
                    reset_at: shift_forward(oldest, window),
                };
                let write_back = self.persist_pruned_on_deny.then_some(record);
                return (write_back, denied);
            }

            record.record(now);
            let oldest = record.oldest().unwrap_or(now);
            let allowed = Decision {
                allowed: true,
                limit: self.limit,
                remaining: self.limit - record.len() as u64,
                reset_at: shift_forward(oldest, window),
            };
            (Some(record), allowed)
        });

        if decision.allowed {
            trace!(key = %key, remaining = decision.remaining, "Sliding window request admitted");
        } else {
            debug!(key = %key, reset_at = %decision.reset_at, "Sliding window limit exceeded");
        }

        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn test_limiter(limit: u64, window: Duration) -> (Arc<ManualClock>, SlidingWindowLimiter) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(ExpiringStore::new(Duration::from_secs(600), clock.clone()));
        let limiter = SlidingWindowLimiter::new(store, clock.clone(), limit, window);
        (clock, limiter)
    }

    #[test]
    fn test_exact_trailing_window() {
        let (clock, limiter) = test_limiter(2, Duration::from_secs(1));

        assert!(limiter.allow("k").allowed);
        clock.advance(Duration::from_millis(500));
        assert!(limiter.allow("k").allowed);
        clock.advance(Duration::from_millis(400));
        assert!(!limiter.allow("k").allowed);
        clock.advance(Duration::from_millis(200));
        assert!(limiter.allow("k").allowed);
    }

    #[test]
    fn test_reset_at_is_oldest_plus_window() {
        let (clock, limiter) = test_limiter(2, Duration::from_secs(1));
        let start = clock.now();

        limiter.allow("k");
        clock.advance(Duration::from_millis(300));
        limiter.allow("k");
        clock.advance(Duration::from_millis(300));

        let denied = limiter.allow("k");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, start + chrono::Duration::seconds(1));

        clock.set(denied.reset_at);
        let decision = limiter.allow("k");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(
            decision.reset_at,
            start + chrono::Duration::milliseconds(1300)
        );
    }

    #[test]
    fn test_allowed_reports_remaining_and_oldest_reset() {
        let (clock, limiter) = test_limiter(3, Duration::from_secs(10));
        let start = clock.now();

        let first = limiter.allow("k");
        assert_eq!(first.remaining, 2);
        assert_eq!(first.reset_at, start + chrono::Duration::seconds(10));

        clock.advance(Duration::from_secs(2));
        let second = limiter.allow("k");
        assert_eq!(second.remaining, 1);
        assert_eq!(second.reset_at, first.reset_at);
    }

    #[test]
    fn test_denial_leaves_stored_log_untouched() {
        let (clock, limiter) = test_limiter(2, Duration::from_secs(1));

        limiter.allow("k");
        clock.advance(Duration::from_millis(600));
        limiter.allow("k");
        clock.advance(Duration::from_millis(200));
        assert!(!limiter.allow("k").allowed);

        let stored = limiter.store().get("k").unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(limiter.store().stats().total_requests, 2);
    }

    #[test]
    fn test_persist_pruned_on_deny() {
        let (clock, limiter) = test_limiter(2, Duration::from_secs(1));
        let limiter = limiter.persist_pruned_on_deny(true);

        limiter.allow("k");
        clock.advance(Duration::from_millis(500));
        limiter.allow("k");
        assert!(!limiter.allow("k").allowed);
        assert!(!limiter.allow("k").allowed);

        assert_eq!(limiter.store().get("k").unwrap().len(), 2);
        assert_eq!(limiter.store().stats().total_requests, 4);

        clock.advance(Duration::from_millis(500));
        assert!(limiter.allow("k").allowed);
    }

    #[test]
    fn test_current_count_prunes_without_recording() {
        let (clock, limiter) = test_limiter(5, Duration::from_secs(1));

        limiter.allow("k");
        clock.advance(Duration::from_millis(700));
        limiter.allow("k");
        assert_eq!(limiter.current_count("k"), 2);

        clock.advance(Duration::from_millis(300));
        assert_eq!(limiter.current_count("k"), 1);
        assert_eq!(limiter.current_count("other"), 0);
        assert_eq!(limiter.store().stats().total_requests, 2);
    }

    #[test]
    fn test_clock_stepping_back_keeps_log_ordered() {
        let (clock, limiter) = test_limiter(2, Duration::from_secs(10));
        let start = clock.now();

        assert!(limiter.allow("k").allowed);
        clock.set(start - chrono::Duration::seconds(5));
        let second = limiter.allow("k");
        assert!(second.allowed);
        assert_eq!(second.reset_at, start + chrono::Duration::seconds(5));

        let denied = limiter.allow("k");
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at, start + chrono::Duration::seconds(5));

        let stored = limiter.store().get("k").unwrap();
        assert_eq!(stored.oldest(), Some(start - chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_record_inserts_in_order() {
        let base = Utc::now();
        let mut record = SlidingWindowRecord::default();

        record.record(base);
        record.record(base - chrono::Duration::seconds(2));
        record.record(base - chrono::Duration::seconds(1));

        let ordered: Vec<_> = record.timestamps.iter().copied().collect();
        assert_eq!(
            ordered,
            vec![
                base - chrono::Duration::seconds(2),
                base - chrono::Duration::seconds(1),
                base,
            ]
        );
    }

    #[test]
    fn test_record_prune_boundary_is_exclusive() {
        let base = Utc::now();
        let mut record = SlidingWindowRecord {
            timestamps: VecDeque::from(vec![
                base,
                base + chrono::Duration::milliseconds(1),
                base + chrono::Duration::milliseconds(2),
            ]),
        };

        record.prune(base + chrono::Duration::milliseconds(1));
        assert_eq!(record.len(), 1);
        assert_eq!(record.oldest(), Some(base + chrono::Duration::milliseconds(2)));
    }
}
