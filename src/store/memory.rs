//! Process-local fixed-window counter store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{CounterStore, StoreError};
use crate::ratelimit::{Clock, CounterKey, SystemClock};

/// Request count for one key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests seen in the current window
    pub count: u64,
    /// Start of the current window, epoch milliseconds
    pub window_start: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl CounterEntry {
    fn new(now: u64, window_ms: u64) -> Self {
        Self {
            count: 0,
            window_start: now,
            window_ms,
        }
    }

    /// Whether the window this entry belongs to has elapsed at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.window_start) >= self.window_ms
    }
}

/// In-memory counter store keyed by `identifier:window`.
///
/// Each update runs under the owning shard's write lock, so concurrent
/// increments of the same key from different threads never lose a count.
/// Cloning is cheap and clones share the same counters.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    counters: Arc<DashMap<String, CounterEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Record one request and return the count in the current window.
    pub fn increment(&self, key: &CounterKey) -> u64 {
        let now = self.clock.now_millis();
        let mut entry = self
            .counters
            .entry(key.to_string_key())
            .or_insert_with(|| CounterEntry::new(now, key.window_ms));

        if entry.is_expired(now) {
            trace!(key = %key, "Starting new window");
            *entry = CounterEntry {
                count: 1,
                window_start: now,
                window_ms: key.window_ms,
            };
        } else {
            entry.count = entry.count.saturating_add(1);
        }
        entry.count
    }

    /// Current count for a key, or `None` if it has no live window.
    pub fn count(&self, key: &CounterKey) -> Option<u64> {
        let now = self.clock.now_millis();
        self.counters
            .get(&key.to_string_key())
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count)
    }

    /// Drop every entry whose window has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.counters.len();
        self.counters.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Purge expired entries every `interval` on a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        let store = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "Purged expired rate limit windows");
                }
            }
        });
        SweeperHandle { handle }
    }

    /// Number of tracked keys, including ones not yet purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn increment(&self, key: &CounterKey) -> Result<u64, StoreError> {
        Ok(MemoryStore::increment(self, key))
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

/// Background sweeper task. Stops when dropped.
#[derive(Debug)]
pub struct SweeperHandle {
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper.
    pub fn stop(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
