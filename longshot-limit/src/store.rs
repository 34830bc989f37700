//! Shared-state backends for the [`Distributed`](crate::Distributed) limiter.
//!
//! A store keeps one sliding-window log per key and must perform
//! "purge expired + count + insert if room" as a single indivisible operation, so that
//! any number of processes can share a limit without a read-modify-write race.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

/// Errors produced while talking to a shared store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("shared store unavailable: {0}")]
    Unavailable(String),

    /// The store answered, but not with something we understand.
    #[error("shared store returned an unexpected reply: {0}")]
    Backend(String),
}

/// The identity of one log entry.
///
/// Generated once per admission attempt; the same value is what ends up stored, so there is
/// never a need to re-derive it later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryId(String);

impl EntryId {
    pub fn generate(now_ms: u64) -> Self {
        Self(format!("{now_ms}-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The outcome of one atomic admission against a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Whether the entry was inserted.
    pub admitted: bool,
    /// Entries inside the window once the operation completed.
    pub count: usize,
    /// Timestamp (epoch ms) of the oldest entry still inside the window.
    pub oldest_ms: Option<u64>,
}

/// A store shared by every process enforcing the same limits.
#[async_trait]
pub trait SharedStore: Debug + Send + Sync {
    /// Atomically purge entries of `key` at or before `now_ms - window`, count what is left
    /// and, if fewer than `max` remain, insert `entry` at `now_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached or replies unexpectedly.
    async fn admit(
        &self,
        key: &str,
        entry: &EntryId,
        now_ms: u64,
        window: Duration,
        max: usize,
    ) -> Result<WindowCount, StoreError>;

    /// Drop every key whose newest entry is at or before `now_ms - window`. Returns how many
    /// keys were dropped.
    ///
    /// Stores that expire keys on their own (Redis, through `PEXPIRE`) keep the default.
    fn evict_expired(&self, _now_ms: u64, _window: Duration) -> usize {
        0
    }

    /// A short name for logs.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T> SharedStore for Arc<T>
where
    T: SharedStore + ?Sized,
{
    async fn admit(
        &self,
        key: &str,
        entry: &EntryId,
        now_ms: u64,
        window: Duration,
        max: usize,
    ) -> Result<WindowCount, StoreError> {
        (**self).admit(key, entry, now_ms, window, max).await
    }

    fn evict_expired(&self, now_ms: u64, window: Duration) -> usize {
        (**self).evict_expired(now_ms, window)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// An in-process [`SharedStore`].
///
/// Useful for tests and single-node deployments. Every operation runs under one mutex,
/// mirroring a single-threaded store server. The store can be switched offline to simulate
/// an outage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: Mutex<HashMap<String, VecDeque<(u64, EntryId)>>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        !self.offline.load(Ordering::Acquire)
    }

    /// The ids currently logged for `key`, oldest first.
    pub fn entries(&self, key: &str) -> Vec<EntryId> {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        logs.get(key)
            .map(|log| log.iter().map(|(_, id)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// How many keys currently hold a log.
    pub fn keys(&self) -> usize {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn admit(
        &self,
        key: &str,
        entry: &EntryId,
        now_ms: u64,
        window: Duration,
        max: usize,
    ) -> Result<WindowCount, StoreError> {
        if !self.is_available() {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }

        let window_ms = window.as_millis() as u64;
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let log = logs.entry(key.to_owned()).or_default();

        while log
            .front()
            .is_some_and(|(ts, _)| ts.saturating_add(window_ms) <= now_ms)
        {
            log.pop_front();
        }

        let admitted = log.len() < max;
        if admitted {
            log.push_back((now_ms, entry.clone()));
        }

        Ok(WindowCount {
            admitted,
            count: log.len(),
            oldest_ms: log.front().map(|(ts, _)| *ts),
        })
    }

    fn evict_expired(&self, now_ms: u64, window: Duration) -> usize {
        let window_ms = window.as_millis() as u64;
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let before = logs.len();
        logs.retain(|_, log| {
            log.back()
                .is_some_and(|(ts, _)| ts.saturating_add(window_ms) > now_ms)
        });
        before - logs.len()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(feature = "redis")]
mod redis_store {
    use std::fmt;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use redis::Script;
    use redis::aio::ConnectionManager;
    use redis::aio::ConnectionManagerConfig;
    use tokio::sync::OnceCell;

    use super::EntryId;
    use super::SharedStore;
    use super::StoreError;
    use super::WindowCount;

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

    // Purge, count and conditional insert in one server-side step.
    const ADMIT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < max then
  redis.call('ZADD', key, now, ARGV[4])
  count = count + 1
  admitted = 1
end
redis.call('PEXPIRE', key, window)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ts = -1
if oldest[2] then
  oldest_ts = tonumber(oldest[2])
end
return {admitted, count, oldest_ts}
"#;

    /// A [`SharedStore`] backed by a Redis sorted set per key.
    ///
    /// The connection is made on first use and retried on every call until it succeeds, so
    /// a server that is down at startup is reported through [`StoreError::Unavailable`] like
    /// any later outage.
    #[derive(Clone)]
    pub struct RedisStore {
        client: redis::Client,
        conn: Arc<OnceCell<ConnectionManager>>,
        script: Arc<Script>,
    }

    impl fmt::Debug for RedisStore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RedisStore")
                .field("connected", &self.conn.initialized())
                .finish_non_exhaustive()
        }
    }

    impl RedisStore {
        /// A store for the Redis server at `url`. Nothing is sent until the first
        /// [`admit`](SharedStore::admit).
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::Backend`] if `url` is not a valid Redis url.
        pub fn open(url: &str) -> Result<Self, StoreError> {
            let client = redis::Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(Self {
                client,
                conn: Arc::new(OnceCell::new()),
                script: Arc::new(Script::new(ADMIT)),
            })
        }

        pub fn is_connected(&self) -> bool {
            self.conn.initialized()
        }

        async fn connection(&self) -> Result<ConnectionManager, StoreError> {
            let conn = self
                .conn
                .get_or_try_init(|| {
                    let config = ConnectionManagerConfig::new()
                        .set_number_of_retries(1)
                        .set_connection_timeout(CONNECT_TIMEOUT);
                    ConnectionManager::new_with_config(self.client.clone(), config)
                })
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            Ok(conn.clone())
        }
    }

    #[async_trait]
    impl SharedStore for RedisStore {
        async fn admit(
            &self,
            key: &str,
            entry: &EntryId,
            now_ms: u64,
            window: Duration,
            max: usize,
        ) -> Result<WindowCount, StoreError> {
            let mut conn = self.connection().await?;
            let (admitted, count, oldest): (i64, i64, i64) = self
                .script
                .key(key)
                .arg(now_ms)
                .arg(window.as_millis() as u64)
                .arg(max)
                .arg(entry.as_str())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;

            let count = usize::try_from(count)
                .map_err(|_| StoreError::Backend(format!("negative count {count}")))?;

            Ok(WindowCount {
                admitted: admitted == 1,
                count,
                oldest_ms: u64::try_from(oldest).ok(),
            })
        }

        fn name(&self) -> &'static str {
            "redis"
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
