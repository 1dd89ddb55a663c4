//! Expiring key-value store backing the rate limiters.
//!
//! Entries carry an absolute expiration. Reads treat expired entries as
//! absent without removing them; a background sweeper evicts them once per
//! TTL so keys that stop being used do not accumulate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::clock::{shift_forward, to_delta, Clock};

/// Shortest period the sweeper will tick at.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

/// Longest period the sweeper will tick at; keeps timer deadlines representable.
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A stored value together with the instant it stops being visible.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoreEntry<V> {
    /// The stored record
    pub value: V,
    /// Absolute expiration instant
    pub expires_at: DateTime<Utc>,
}

impl<V> StoreEntry<V> {
    /// Whether the entry is still visible at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Aggregate usage statistics for a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Entries currently held, including expired ones not yet swept
    pub total_keys: usize,
    /// Number of writes since the store was created
    pub total_requests: u64,
}

/// A concurrent key-value store whose entries expire a fixed TTL after
/// their last write.
pub struct ExpiringStore<V> {
    /// Entries indexed by client key
    entries: DashMap<String, StoreEntry<V>>,
    /// Lifetime of an entry after each write; also the sweep period
    ttl: Duration,
    clock: Arc<dyn Clock>,
    /// Monotonic write counter
    total_requests: AtomicU64,
}

impl<V> std::fmt::Debug for ExpiringStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringStore")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .field("total_requests", &self.total_requests.load(Ordering::Relaxed))
            .finish()
    }
}

impl<V> ExpiringStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty store whose entries live for `ttl` after each write.
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
            total_requests: AtomicU64::new(0),
        }
    }

    /// The configured entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or replace the entry for `key`, refreshing its expiration.
    pub fn set(&self, key: &str, value: V) {
        let entry = self.fresh_entry(value);
        self.entries.insert(key.to_string(), entry);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the value for `key` if present and not yet expired.
    ///
    /// Expired entries are reported as absent but left for the sweeper.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Atomically read, transform and optionally write back the entry for `key`.
    ///
    /// `f` receives the live value (expired entries appear as `None`) and
    /// returns the value to persist, if any, along with a result for the
    /// caller. The key's shard stays locked for the whole call, so concurrent
    /// updates of the same key never interleave. A persisted value counts as
    /// a write exactly like [`set`](Self::set).
    pub fn update<R, F>(&self, key: &str, f: F) -> R
    where
        F: FnOnce(Option<&V>) -> (Option<V>, R),
    {
        let now = self.clock.now();

        let (written, result) = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get())
                    .filter(|entry| entry.is_live(now))
                    .map(|entry| &entry.value);
                let (next, result) = f(current);
                let written = next.is_some();
                if let Some(value) = next {
                    occupied.insert(self.fresh_entry_at(value, now));
                }
                (written, result)
            }
            Entry::Vacant(vacant) => {
                let (next, result) = f(None);
                let written = next.is_some();
                if let Some(value) = next {
                    vacant.insert(self.fresh_entry_at(value, now));
                }
                (written, result)
            }
        };

        if written {
            self.total_requests.fetch_add(1, Ordering::Relaxed);
        }
        trace!(key = %key, written, "Store entry updated");

        result
    }

    /// Remove the entry for `key`. Returns whether an entry was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry. The write counter is left untouched.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Snapshot of the aggregate counters.
    pub fn stats(&self) -> Stats {
        Stats {
            total_keys: self.entries.len(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
        }
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict every expired entry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();

        self.entries.retain(|_key, entry| entry.is_live(now));

        let remaining = self.entries.len();
        let evicted = before.saturating_sub(remaining);
        debug!(evicted, remaining, "Store sweep complete");
        evicted
    }

    /// Spawn the background task that sweeps the store once per TTL.
    ///
    /// The task holds only a weak reference; it exits when the returned
    /// handle is shut down or dropped, or when the store itself is dropped.
    /// Must be called from within a Tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let store = Arc::downgrade(self);
        let period = self.ttl.clamp(MIN_SWEEP_PERIOD, MAX_SWEEP_PERIOD);
        let (stop_tx, stop_rx) = oneshot::channel();

        debug!(period = ?period, "Starting store sweeper");
        let task = tokio::spawn(run_sweeper(store, period, stop_rx));

        SweeperHandle {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    fn fresh_entry(&self, value: V) -> StoreEntry<V> {
        self.fresh_entry_at(value, self.clock.now())
    }

    fn fresh_entry_at(&self, value: V, now: DateTime<Utc>) -> StoreEntry<V> {
        StoreEntry {
            value,
            expires_at: shift_forward(now, to_delta(self.ttl)),
        }
    }
}

async fn run_sweeper<V>(
    store: Weak<ExpiringStore<V>>,
    period: Duration,
    mut stop: oneshot::Receiver<()>,
) where
    V: Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(live) = store.upgrade() else {
                    debug!("Store dropped, sweeper exiting");
                    break;
                };
                live.sweep();
            }
            // Fires on an explicit stop and when the handle is dropped.
            _ = &mut stop => {
                debug!("Store sweeper stopped");
                break;
            }
        }
    }
}

/// Handle to a running store sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Store sweeper terminated abnormally");
            }
        }
    }

    /// Whether the sweeper task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}
