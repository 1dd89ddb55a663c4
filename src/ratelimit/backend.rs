//! Rate limiter trait for abstracting the windowing algorithms.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// The outcome of a single admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is permitted
    pub allowed: bool,
    /// Configured request limit for the window
    pub limit: u64,
    /// Requests still available in the current window
    pub remaining: u64,
    /// When the quota governing this decision frees up
    pub reset_at: DateTime<Utc>,
}

impl Decision {
    /// How long a denied caller should wait before retrying.
    ///
    /// Zero for permitted decisions and once `reset_at` has passed.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        if self.allowed {
            return Duration::ZERO;
        }
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the fixed and sliding window limiters so the
/// HTTP layer can work with either. Absence of prior state for a key is the
/// normal first-use case; the call never fails.
pub trait RateLimiterBackend: Send + Sync {
    /// Record a request for `key` and decide whether it is permitted.
    fn allow(&self, key: &str) -> Decision;
}
