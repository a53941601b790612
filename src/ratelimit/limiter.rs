//! Core rate limiter implementation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};
use super::key::CounterKey;
use super::policy::{PolicyCatalog, RateLimitConfig, REQUIRED_POLICIES};
use crate::config::TollgateConfig;
use crate::error::Result;
use crate::store::{CounterStore, MemoryStore, RedisStore, SweeperHandle};

/// Outcome of a single rate limit check.
///
/// Computed fresh on every check and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub success: bool,
    /// Requests left in the current window, never negative
    pub remaining: u64,
    /// When the caller can expect the window to have reset
    pub reset_time: DateTime<Utc>,
    /// The limit that was applied
    pub limit: u64,
}

impl RateLimitResult {
    fn evaluate(count: u64, config: &RateLimitConfig, now_millis: u64) -> Self {
        let reset_millis = now_millis.saturating_add(config.window_ms);
        Self {
            success: count <= config.limit,
            remaining: config.limit.saturating_sub(count),
            reset_time: to_datetime(reset_millis),
            limit: config.limit,
        }
    }

    /// Whole seconds from `now` until `reset_time`, at least one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_time - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

fn to_datetime(millis: u64) -> DateTime<Utc> {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A rejected request, ready to be turned into a `429 Too Many Requests`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("too many requests, retry after {retry_after_secs}s")]
pub struct Rejection {
    /// The limit that was exceeded
    pub limit: u64,
    /// Always zero for a rejection, kept for response symmetry
    pub remaining: u64,
    /// When the window resets
    pub reset_time: DateTime<Utc>,
    /// Seconds the client should wait before retrying
    pub retry_after_secs: u64,
}

impl Rejection {
    /// HTTP status a caller should answer with.
    pub const STATUS: u16 = 429;

    fn from_result(result: &RateLimitResult, now: DateTime<Utc>) -> Self {
        Self {
            limit: result.limit,
            remaining: result.remaining,
            reset_time: result.reset_time,
            retry_after_secs: result.retry_after_secs(now),
        }
    }

    /// Response headers advertising the limit to the client.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Retry-After", self.retry_after_secs.to_string()),
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_time.timestamp().to_string()),
        ]
    }
}

/// Fixed-window rate limiter with a distributed store and a memory fallback.
///
/// The distributed store is optional. When it is absent or fails, the check
/// is counted in the process-local [`MemoryStore`] instead: an unreachable
/// Redis degrades limiting to per-process rather than blocking requests.
pub struct RateLimiter {
    memory: MemoryStore,
    distributed: Option<Arc<dyn CounterStore>>,
    clock: Arc<dyn Clock>,
    policies: PolicyCatalog,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl RateLimiter {
    /// Create a memory-only rate limiter with the built-in policies.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// Build a rate limiter from configuration and start its memory sweeper.
    /// Must be called inside a Tokio runtime.
    ///
    /// Fails on a malformed policy catalog, a missing required policy or an
    /// unparseable Redis URL. An unreachable Redis is not an error.
    pub async fn from_config(config: &TollgateConfig) -> Result<Self> {
        let policies = PolicyCatalog::load(config.policies_path.as_deref())?;
        policies.validate(&REQUIRED_POLICIES)?;

        let mut builder = Self::builder().policies(policies);
        match config.store.redis() {
            Some(redis) => {
                let store = RedisStore::connect(redis).await?;
                builder = builder.distributed(Arc::new(store));
            }
            None => info!("No Redis configured, using in-memory rate limiting"),
        }

        let limiter = builder.build();
        let interval = config.store.sweep_interval();
        limiter.start_sweeper(interval);
        debug!(interval_secs = interval.as_secs(), "Started memory counter sweeper");
        Ok(limiter)
    }

    /// Check the rate limit for an identifier under the given policy.
    ///
    /// Exceeding the limit is a normal outcome (`success == false`), and store
    /// failures are absorbed, so this never fails.
    pub async fn check(&self, identifier: &str, config: &RateLimitConfig) -> RateLimitResult {
        let key = CounterKey::new(identifier, config.window_ms);
        let now = self.clock.now_millis();

        trace!(key = %key, limit = config.limit, "Checking rate limit");

        let count = self.increment(&key).await;
        let result = RateLimitResult::evaluate(count, config, now);

        if !result.success {
            debug!(
                key = %key,
                count,
                limit = config.limit,
                "Rate limit exceeded"
            );
        }
        result
    }

    /// Check the rate limit for an identifier under a named policy.
    pub async fn check_policy(&self, identifier: &str, policy: &str) -> Result<RateLimitResult> {
        let config = *self.policies.resolve(policy)?;
        Ok(self.check(identifier, &config).await)
    }

    /// Check and turn an over-limit outcome into a [`Rejection`].
    pub async fn enforce(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
    ) -> std::result::Result<RateLimitResult, Rejection> {
        let result = self.check(identifier, config).await;
        if result.success {
            Ok(result)
        } else {
            let now = to_datetime(self.clock.now_millis());
            Err(Rejection::from_result(&result, now))
        }
    }

    async fn increment(&self, key: &CounterKey) -> u64 {
        if let Some(store) = &self.distributed {
            match store.increment(key).await {
                Ok(count) => return count,
                Err(e) => {
                    warn!(
                        key = %key,
                        store = store.name(),
                        error = %e,
                        "Distributed store failed, falling back to in-memory counter"
                    );
                }
            }
        }
        self.memory.increment(key)
    }

    /// Liveness of the distributed store, `None` when running memory-only.
    pub async fn health_check(&self) -> Option<bool> {
        match &self.distributed {
            Some(store) => Some(store.health_check().await),
            None => None,
        }
    }

    /// Start purging expired in-memory windows every `interval`.
    ///
    /// Replaces any sweeper already running.
    pub fn start_sweeper(&self, interval: Duration) {
        let handle = self.memory.spawn_sweeper(interval);
        *self.sweeper.lock() = Some(handle);
    }

    /// Stop the sweeper and release the distributed store. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.stop();
        }
        if let Some(store) = &self.distributed {
            store.close().await;
        }
    }

    pub fn policies(&self) -> &PolicyCatalog {
        &self.policies
    }

    /// The process-local fallback store.
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed.is_some()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`RateLimiter`].
#[derive(Default)]
pub struct RateLimiterBuilder {
    distributed: Option<Arc<dyn CounterStore>>,
    clock: Option<Arc<dyn Clock>>,
    policies: Option<PolicyCatalog>,
}

impl RateLimiterBuilder {
    /// Use a shared store ahead of the memory fallback.
    pub fn distributed(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.distributed = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn policies(mut self, policies: PolicyCatalog) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn build(self) -> RateLimiter {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        RateLimiter {
            memory: MemoryStore::with_clock(clock.clone()),
            distributed: self.distributed,
            clock,
            policies: self.policies.unwrap_or_default(),
            sweeper: Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::{LOGIN, SIGNUP};
    use crate::ratelimit::ManualClock;
    use crate::store::{silent_server, RedisConfig, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const START: u64 = 1_700_000_000_000;

    fn limiter_at(start: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let limiter = RateLimiter::builder().clock(clock.clone()).build();
        (limiter, clock)
    }

    /// A distributed store that is always down.
    #[derive(Default)]
    struct FailingStore {
        calls: AtomicUsize,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for FailingStore {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn increment(&self, _key: &CounterKey) -> std::result::Result<u64, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Connection("connection refused".to_string()))
        }

        async fn health_check(&self) -> bool {
            false
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A distributed store that always reports a fixed count.
    struct FixedStore(u64);

    #[async_trait]
    impl CounterStore for FixedStore {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn increment(&self, _key: &CounterKey) -> std::result::Result<u64, StoreError> {
            Ok(self.0)
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_three_per_second_scenario() {
        let (limiter, clock) = limiter_at(START);
        let config = RateLimitConfig::new(3, 1000);

        for expected_remaining in [2, 1, 0] {
            let result = limiter.check("u1", &config).await;
            assert!(result.success);
            assert_eq!(result.remaining, expected_remaining);
            clock.advance(Duration::from_millis(10));
        }

        let fourth = limiter.check("u1", &config).await;
        assert!(!fourth.success);
        assert_eq!(fourth.remaining, 0);

        // 1001ms after the first call
        clock.set(START + 1001);
        let fifth = limiter.check("u1", &config).await;
        assert!(fifth.success);
        assert_eq!(fifth.remaining, 2);
    }

    #[tokio::test]
    async fn test_new_identifier_starts_at_one() {
        let (limiter, _) = limiter_at(START);
        let config = RateLimitConfig::new(10, 60_000);

        let result = limiter.check("fresh", &config).await;
        assert!(result.success);
        assert_eq!(result.remaining, 9);
        assert_eq!(result.limit, 10);
    }

    #[tokio::test]
    async fn test_remaining_never_negative() {
        let (limiter, _) = limiter_at(START);
        let config = RateLimitConfig::new(2, 60_000);

        for i in 1..=10u64 {
            let result = limiter.check("u1", &config).await;
            assert_eq!(result.success, i <= 2);
            assert_eq!(result.remaining, 2u64.saturating_sub(i));
        }
    }

    #[tokio::test]
    async fn test_distinct_identifiers_do_not_share_counters() {
        let (limiter, _) = limiter_at(START);
        let config = RateLimitConfig::new(3, 1000);

        for _ in 0..5 {
            limiter.check("u1", &config).await;
        }
        assert!(!limiter.check("u1", &config).await.success);

        let u2 = limiter.check("u2", &config).await;
        assert!(u2.success);
        assert_eq!(u2.remaining, 2);
    }

    #[tokio::test]
    async fn test_policies_with_same_identifier_are_separate() {
        let (limiter, _) = limiter_at(START);

        for _ in 0..5 {
            limiter.check_policy("a@example.com", LOGIN).await.unwrap();
        }
        assert!(!limiter.check_policy("a@example.com", LOGIN).await.unwrap().success);

        let signup = limiter.check_policy("a@example.com", SIGNUP).await.unwrap();
        assert!(signup.success);
        assert_eq!(signup.remaining, 2);
    }

    #[tokio::test]
    async fn test_reset_time_is_now_plus_window() {
        let (limiter, _) = limiter_at(START);
        let config = RateLimitConfig::new(3, 1000);

        let result = limiter.check("u1", &config).await;
        assert_eq!(result.reset_time.timestamp_millis(), (START + 1000) as i64);
    }

    #[tokio::test]
    async fn test_unknown_policy_is_an_error() {
        let (limiter, _) = limiter_at(START);
        let result = limiter.check_policy("u1", "nope").await;
        assert!(matches!(result, Err(crate::error::TollgateError::UnknownPolicy(_))));
    }

    #[tokio::test]
    async fn test_enforce_rejects_over_limit() {
        let (limiter, _) = limiter_at(START);
        let config = RateLimitConfig::new(1, 30_000);

        tokio_test::assert_ok!(limiter.enforce("u1", &config).await);
        let rejection = tokio_test::assert_err!(limiter.enforce("u1", &config).await);

        assert_eq!(Rejection::STATUS, 429);
        assert_eq!(rejection.limit, 1);
        assert_eq!(rejection.remaining, 0);
        assert_eq!(rejection.retry_after_secs, 30);

        let headers = rejection.headers();
        assert!(headers.contains(&("Retry-After", "30".to_string())));
        assert!(headers.contains(&("X-RateLimit-Remaining", "0".to_string())));
    }

    #[tokio::test]
    async fn test_retry_after_rounds_up() {
        let (limiter, _) = limiter_at(START);
        let config = RateLimitConfig::new(1, 1500);

        limiter.check("u1", &config).await;
        let rejection = limiter.enforce("u1", &config).await.unwrap_err();
        assert_eq!(rejection.retry_after_secs, 2);
    }

    #[tokio::test]
    async fn test_failing_distributed_store_falls_back_to_memory() {
        let clock = Arc::new(ManualClock::new(START));
        let failing = Arc::new(FailingStore::default());
        let limiter = RateLimiter::builder()
            .clock(clock.clone())
            .distributed(failing.clone())
            .build();
        let config = RateLimitConfig::new(3, 1000);

        let remaining: Vec<u64> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(limiter.check("u1", &config).await.remaining);
            }
            out
        };
        assert_eq!(remaining, vec![2, 1, 0]);
        assert!(!limiter.check("u1", &config).await.success);

        // Every check tried the distributed store first
        assert_eq!(failing.calls.load(Ordering::SeqCst), 4);
        assert_eq!(limiter.memory().count(&CounterKey::new("u1", 1000)), Some(4));

        clock.advance(Duration::from_millis(1001));
        assert!(limiter.check("u1", &config).await.success);
    }

    #[tokio::test]
    async fn test_distributed_count_is_used_when_available() {
        let limiter = RateLimiter::builder()
            .distributed(Arc::new(FixedStore(7)))
            .build();
        let config = RateLimitConfig::new(5, 1000);

        let result = limiter.check("u1", &config).await;
        assert!(!result.success);
        assert_eq!(result.remaining, 0);
        assert!(limiter.memory().is_empty());
        assert_eq!(limiter.health_check().await, Some(true));
    }

    #[tokio::test]
    async fn test_unreachable_redis_never_fails_checks() {
        let redis = RedisConfig {
            connect_timeout: Duration::from_millis(200),
            operation_timeout: Duration::from_millis(300),
            ..RedisConfig::new("redis://127.0.0.1:1/")
        };
        let store = RedisStore::connect(redis).await.unwrap();
        let limiter = RateLimiter::builder().distributed(Arc::new(store)).build();
        let config = RateLimitConfig::new(2, 60_000);

        assert!(limiter.check("u1", &config).await.success);
        assert!(limiter.check("u1", &config).await.success);
        assert!(!limiter.check("u1", &config).await.success);
        assert_eq!(limiter.health_check().await, Some(false));

        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let failing = Arc::new(FailingStore::default());
        let limiter = RateLimiter::builder().distributed(failing.clone()).build();
        limiter.start_sweeper(Duration::from_secs(60));

        limiter.shutdown().await;
        limiter.shutdown().await;

        assert_eq!(failing.closes.load(Ordering::SeqCst), 2);
        assert!(limiter.sweeper.lock().is_none());
    }

    #[tokio::test]
    async fn test_memory_only_has_no_health() {
        let limiter = RateLimiter::new();
        assert!(!limiter.is_distributed());
        assert_eq!(limiter.health_check().await, None);
    }

    #[tokio::test]
    async fn test_from_config_memory_only() {
        let config = TollgateConfig::default();
        let limiter = RateLimiter::from_config(&config).await.unwrap();

        assert!(!limiter.is_distributed());
        assert!(limiter.policies().get(LOGIN).is_some());
        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_from_config_starts_sweeper() {
        let mut config = TollgateConfig::default();
        config.store.sweep_interval_secs = 1;
        let limiter = RateLimiter::from_config(&config).await.unwrap();

        let running = limiter
            .sweeper
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished());
        assert_eq!(running, Some(true));

        limiter.shutdown().await;
        assert!(limiter.sweeper.lock().is_none());
    }

    #[tokio::test]
    async fn test_silent_redis_times_out_and_falls_back() {
        let url = silent_server().await;
        let redis = RedisConfig {
            connect_timeout: Duration::from_secs(1),
            operation_timeout: Duration::from_millis(150),
            ..RedisConfig::new(url)
        };
        let store = RedisStore::connect(redis).await.unwrap();
        if !store.is_connected().await {
            tokio::time::sleep(Duration::from_millis(1100)).await;
        }
        let limiter = RateLimiter::builder().distributed(Arc::new(store)).build();
        let config = RateLimitConfig::new(3, 1000);

        let started = std::time::Instant::now();
        let result = limiter.check("u1", &config).await;
        assert!(started.elapsed() < Duration::from_millis(650));

        assert!(result.success);
        assert_eq!(result.remaining, 2);
        assert_eq!(limiter.memory().count(&CounterKey::new("u1", 1000)), Some(1));

        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_from_config_rejects_bad_redis_url() {
        let mut config = TollgateConfig::default();
        config.store.redis_url = Some("http://localhost:6379".to_string());

        let result = RateLimiter::from_config(&config).await;
        assert!(matches!(
            result,
            Err(crate::error::TollgateError::Store(StoreError::InvalidUrl(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_admit_exactly_limit() {
        let limiter = Arc::new(RateLimiter::new());
        let config = RateLimitConfig::new(50, 60_000);

        let tasks = (0..200).map(move |_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check("hot", &config).await.success })
        });
        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();

        assert_eq!(admitted, 50);
    }
}
