//! Counter stores backing the rate limiter.
//!
//! Two implementations share the [`CounterStore`] contract: the process-local
//! [`MemoryStore`] and the Redis-backed [`RedisStore`] shared across
//! processes. Both return `Result<u64, StoreError>` so the limiter decides
//! explicitly what to do with a failing store.

mod memory;
mod distributed;

pub use self::memory::{CounterEntry, MemoryStore, SweeperHandle};
pub use self::distributed::{RedisConfig, RedisStore};

#[cfg(test)]
pub(crate) use self::distributed::silent_server;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::ratelimit::CounterKey;

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store was closed and will not reconnect
    #[error("store is closed")]
    Closed,

    /// The operation did not complete within its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// No connection to the store could be established
    #[error("connection unavailable: {0}")]
    Connection(String),

    /// The store rejected or failed a command
    #[error("command failed: {0}")]
    Command(#[from] redis::RedisError),

    /// The store answered with something a counter cannot be
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The connection string could not be parsed
    #[error("invalid connection string: {0}")]
    InvalidUrl(String),
}

/// A fixed-window counter store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Record one request against `key` and return the count in the current
    /// window, starting a new window at 1 if the previous one has elapsed.
    async fn increment(&self, key: &CounterKey) -> Result<u64, StoreError>;

    /// Liveness probe. Never fails; an unreachable store reports `false`.
    async fn health_check(&self) -> bool;

    /// Release any held connection. Safe to call more than once.
    async fn close(&self);
}
