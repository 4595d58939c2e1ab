//! Client-facing request limits, counted in fixed windows aligned to the wall clock.
//!
//! Each limiter counts hits per key (a client IP, or a sender and nonce) within the current
//! window. Replicas sharing a Redis instance share the counters.

use crate::store::{CacheError, RedisStore};
use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::Script;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const INC_WINDOW_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[1]))
end
return count
";

/// Fixed-window counter keyed by client.
#[async_trait]
pub trait FrontendRateLimiter: Send + Sync {
    /// Counts one hit for `key`. Returns `false` once the window's limit is exceeded.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] when the shared store is unreachable.
    async fn take(&self, key: &str) -> Result<bool, CacheError>;
}

fn interval_millis(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn window_index(interval_ms: u64) -> u64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    u64::try_from(now.as_millis()).unwrap_or(u64::MAX) / interval_ms
}

#[derive(Debug, Default)]
struct Window {
    index: u64,
    counts: AHashMap<String, u64>,
}

/// In-process [`FrontendRateLimiter`]. Counters are dropped wholesale when the window rolls.
#[derive(Debug)]
pub struct MemoryFrontendRateLimiter {
    interval_ms: u64,
    limit: u64,
    window: Mutex<Window>,
}

impl MemoryFrontendRateLimiter {
    #[must_use]
    pub fn new(interval: Duration, limit: u64) -> Self {
        Self { interval_ms: interval_millis(interval), limit, window: Mutex::new(Window::default()) }
    }
}

#[async_trait]
impl FrontendRateLimiter for MemoryFrontendRateLimiter {
    async fn take(&self, key: &str) -> Result<bool, CacheError> {
        let index = window_index(self.interval_ms);
        let mut window = self.window.lock();
        if window.index != index {
            window.index = index;
            window.counts.clear();
        }
        let count = window.counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        Ok(*count <= self.limit)
    }
}

/// [`FrontendRateLimiter`] shared through Redis under `rate_limit:<prefix>:<key>:<window>`.
pub struct RedisFrontendRateLimiter {
    store: RedisStore,
    prefix: String,
    interval_ms: u64,
    limit: u64,
    inc_window: Script,
}

impl RedisFrontendRateLimiter {
    #[must_use]
    pub fn new(store: RedisStore, prefix: impl Into<String>, interval: Duration, limit: u64) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            interval_ms: interval_millis(interval),
            limit,
            inc_window: Script::new(INC_WINDOW_SCRIPT),
        }
    }

    fn window_key(&self, key: &str, index: u64) -> String {
        format!("rate_limit:{}:{key}:{index}", self.prefix)
    }
}

#[async_trait]
impl FrontendRateLimiter for RedisFrontendRateLimiter {
    async fn take(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.store.connection();
        let count: u64 = self
            .inc_window
            .key(self.window_key(key, window_index(self.interval_ms)))
            .arg(self.interval_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.store.backend_error("frontend_rate_limit", &e))?;
        Ok(count <= self.limit)
    }
}
