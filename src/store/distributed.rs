//! Redis-backed fixed-window counter store.
//!
//! Counters live in Redis under `{key_prefix}{identifier}:{window_ms}` and
//! expire with their window, so every process pointed at the same server
//! shares one strictly ordered count per key.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult, Script};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CounterStore, StoreError};
use crate::ratelimit::CounterKey;

/// Increment and arm the expiry in one atomic step.
///
/// The `PTTL == -1` branch re-arms keys that lost their expiry, e.g. ones
/// written by an older two-step client that crashed between the calls.
const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('PTTL', KEYS[1]) == -1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// Minimum time between reconnection attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection string, e.g. `redis://:password@host:6379/0`
    pub url: String,
    /// Namespace prepended to every counter key
    pub key_prefix: String,
    /// Upper bound on establishing a connection
    pub connect_timeout: Duration,
    /// Upper bound on a single operation, reconnect included
    pub operation_timeout: Duration,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: "ratelimit:".to_string(),
            connect_timeout: Duration::from_millis(1000),
            operation_timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    connection: Option<MultiplexedConnection>,
    /// No reconnection is attempted before this instant.
    retry_at: Option<Instant>,
}

/// Counter store shared across processes through Redis.
pub struct RedisStore {
    client: Client,
    config: RedisConfig,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
    script: Script,
}

impl RedisStore {
    /// Create the store and try to connect.
    ///
    /// Only an unparseable connection string is an error. An unreachable
    /// server is logged and the store reconnects on a later operation.
    pub async fn connect(config: RedisConfig) -> Result<Self, StoreError> {
        info!(url = %mask_url(&config.url), "Creating Redis counter store");

        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::InvalidUrl(e.to_string()))?;

        let store = Self {
            client,
            config,
            state: Mutex::new(ConnectionState::default()),
            closed: AtomicBool::new(false),
            script: Script::new(INCREMENT_SCRIPT),
        };

        {
            let mut state = store.state.lock().await;
            match store.establish(&mut state).await {
                Ok(_) => info!("Connected to Redis"),
                Err(e) => warn!(
                    error = %e,
                    "Redis unreachable at startup, counters fall back to memory until it recovers"
                ),
            }
        }

        Ok(store)
    }

    /// Whether a connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connection.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// The Redis key a counter key is stored under.
    pub fn redis_key(&self, key: &CounterKey) -> String {
        format!("{}{}", self.config.key_prefix, key.to_string_key())
    }

    async fn establish(
        &self,
        state: &mut ConnectionState,
    ) -> Result<MultiplexedConnection, StoreError> {
        // Armed before connecting so a cancelled attempt still backs off
        state.retry_at = Some(Instant::now() + RECONNECT_BACKOFF);

        let timeout = self.config.connect_timeout;
        let connection = tokio::time::timeout(timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        state.connection = Some(connection.clone());
        state.retry_at = None;
        Ok(connection)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        let mut state = self.state.lock().await;
        if let Some(connection) = &state.connection {
            return Ok(connection.clone());
        }
        if let Some(retry_at) = state.retry_at {
            if Instant::now() < retry_at {
                return Err(StoreError::Connection("waiting to reconnect".to_string()));
            }
        }

        debug!("Reconnecting to Redis");
        self.establish(&mut state).await
    }

    /// Drop the cached connection so the next operation reconnects.
    async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if state.connection.take().is_some() {
            debug!("Dropped Redis connection after failure");
        }
    }

    /// Run one operation under the operation timeout.
    async fn run<T, F, Fut>(&self, operation: F) -> Result<T, StoreError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let timeout = self.config.operation_timeout;
        let result = tokio::time::timeout(timeout, async {
            let connection = self.connection().await?;
            operation(connection).await.map_err(StoreError::from)
        })
        .await
        .unwrap_or_else(|_| Err(StoreError::Timeout(timeout)));

        if let Err(ref err) = result {
            if is_connection_failure(err) {
                self.invalidate().await;
            }
        }
        result
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn increment(&self, key: &CounterKey) -> Result<u64, StoreError> {
        let redis_key = self.redis_key(key);
        let window_ms = key.window_ms;
        let script = &self.script;

        let count: i64 = self
            .run(|mut connection| async move {
                let mut invocation = script.key(redis_key);
                invocation.arg(window_ms);
                invocation.invoke_async(&mut connection).await
            })
            .await?;

        debug!(key = %key, count, "Incremented Redis counter");
        u64::try_from(count)
            .map_err(|_| StoreError::UnexpectedReply(format!("negative counter {}", count)))
    }

    async fn health_check(&self) -> bool {
        let reply = self
            .run(|mut connection| async move {
                redis::cmd("PING").query_async::<_, String>(&mut connection).await
            })
            .await;

        match reply {
            Ok(response) if response == "PONG" => true,
            Ok(response) => {
                warn!(response = %response, "Redis health check returned unexpected response");
                false
            }
            Err(e) => {
                warn!(error = %e, "Redis health check failed");
                false
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().await;
        state.connection = None;
        info!("Redis counter store closed");
    }
}

fn is_connection_failure(err: &StoreError) -> bool {
    match err {
        StoreError::Timeout(_) => true,
        StoreError::Command(e) => is_io_failure(e),
        _ => false,
    }
}

fn is_io_failure(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

/// Hide credentials in a connection string before logging it.
pub(crate) fn mask_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// A TCP server that accepts connections and never answers, for exercising
/// the operation timeout. Returns its `redis://` URL.
#[cfg(test)]
pub(crate) async fn silent_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind silent server");
    let addr = listener.local_addr().expect("silent server address");

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    format!("redis://{}/", addr)
}
