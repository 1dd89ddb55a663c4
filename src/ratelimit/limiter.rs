//! Rate limiter facade selecting the active windowing algorithm.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::backend::{Decision, RateLimiterBackend};
use super::clock::{Clock, SystemClock};
use super::fixed_window::FixedWindowLimiter;
use super::sliding_window::SlidingWindowLimiter;
use super::store::{ExpiringStore, Stats, SweeperHandle};
use crate::config::RateLimitingConfig;
use crate::error::TollgateError;

/// Windowing algorithm used to count requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Non-overlapping per-key windows
    Fixed,
    /// Exact trailing window over a timestamp log
    #[default]
    Sliding,
}

impl Algorithm {
    /// The configuration name of this algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Fixed => "fixed",
            Algorithm::Sliding => "sliding",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Algorithm::Fixed),
            "sliding" => Ok(Algorithm::Sliding),
            other => Err(TollgateError::Config(format!(
                "unknown rate limiting algorithm '{}', expected 'fixed' or 'sliding'",
                other
            ))),
        }
    }
}

enum LimiterInner {
    Fixed(FixedWindowLimiter),
    Sliding(SlidingWindowLimiter),
}

/// The rate limiter used by the service.
///
/// Wraps one of the windowing algorithms together with its dedicated store.
/// Thread-safe; share it behind an `Arc`.
pub struct RateLimiter {
    inner: LimiterInner,
    /// Time source shared with the active limiter and its store
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Build the limiter described by `settings`, reading time from `clock`.
    pub fn new(settings: &RateLimitingConfig, clock: Arc<dyn Clock>) -> Self {
        let limit = settings.requests_limit;
        let window = settings.window();
        let ttl = settings.store_ttl();

        info!(
            algorithm = %settings.algorithm,
            limit,
            window = ?window,
            store_ttl = ?ttl,
            "Creating rate limiter"
        );

        let inner = match settings.algorithm {
            Algorithm::Fixed => {
                let store = Arc::new(ExpiringStore::new(ttl, clock.clone()));
                LimiterInner::Fixed(FixedWindowLimiter::new(store, clock.clone(), limit, window))
            }
            Algorithm::Sliding => {
                let store = Arc::new(ExpiringStore::new(ttl, clock.clone()));
                LimiterInner::Sliding(
                    SlidingWindowLimiter::new(store, clock.clone(), limit, window)
                        .persist_pruned_on_deny(settings.persist_pruned_on_deny),
                )
            }
        };

        Self { inner, clock }
    }

    /// Build the limiter described by `settings` on the system clock.
    pub fn from_settings(settings: &RateLimitingConfig) -> Self {
        Self::new(settings, Arc::new(SystemClock::new()))
    }

    /// The active algorithm.
    pub fn algorithm(&self) -> Algorithm {
        match &self.inner {
            LimiterInner::Fixed(_) => Algorithm::Fixed,
            LimiterInner::Sliding(_) => Algorithm::Sliding,
        }
    }

    /// Requests allowed per window.
    pub fn limit(&self) -> u64 {
        match &self.inner {
            LimiterInner::Fixed(limiter) => limiter.limit(),
            LimiterInner::Sliding(limiter) => limiter.limit(),
        }
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        match &self.inner {
            LimiterInner::Fixed(limiter) => limiter.window(),
            LimiterInner::Sliding(limiter) => limiter.window(),
        }
    }

    /// Current time as seen by the limiter.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// How long an idle key's record is kept.
    pub fn store_ttl(&self) -> Duration {
        match &self.inner {
            LimiterInner::Fixed(limiter) => limiter.store().ttl(),
            LimiterInner::Sliding(limiter) => limiter.store().ttl(),
        }
    }

    /// Snapshot of the backing store's counters.
    pub fn stats(&self) -> Stats {
        match &self.inner {
            LimiterInner::Fixed(limiter) => limiter.store().stats(),
            LimiterInner::Sliding(limiter) => limiter.store().stats(),
        }
    }

    /// Forget all accounting for `key`. Returns whether it was tracked.
    pub fn reset(&self, key: &str) -> bool {
        match &self.inner {
            LimiterInner::Fixed(limiter) => limiter.store().delete(key),
            LimiterInner::Sliding(limiter) => limiter.store().delete(key),
        }
    }

    /// Forget all accounting for every key.
    pub fn clear(&self) {
        match &self.inner {
            LimiterInner::Fixed(limiter) => limiter.store().clear(),
            LimiterInner::Sliding(limiter) => limiter.store().clear(),
        }
    }

    /// Start the background sweep of the backing store.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        match &self.inner {
            LimiterInner::Fixed(limiter) => limiter.store().spawn_sweeper(),
            LimiterInner::Sliding(limiter) => limiter.store().spawn_sweeper(),
        }
    }
}

impl RateLimiterBackend for RateLimiter {
    fn allow(&self, key: &str) -> Decision {
        match &self.inner {
            LimiterInner::Fixed(limiter) => limiter.allow(key),
            LimiterInner::Sliding(limiter) => limiter.allow(key),
        }
    }
}
