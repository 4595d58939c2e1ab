use super::{Cache, CacheError};
use crate::metrics::MetricsCollector;
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client, RedisError};
use std::time::Duration;
use tracing::{error, info};

/// Redis-backed [`Cache`], shared by every proxy replica pointed at the same instance.
///
/// Holds a multiplexed connection; clones are cheap and share the underlying socket.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    metrics: MetricsCollector,
}

impl RedisStore {
    /// Opens a connection to `url` and verifies it with `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] if the URL is invalid or Redis is unreachable.
    pub async fn connect(url: &str, metrics: MetricsCollector) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(|e| CacheError::Backend(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        info!(reply = %pong, "connected to redis");

        Ok(Self { conn, metrics })
    }

    /// Returns a handle to the shared multiplexed connection.
    #[must_use]
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Records a failed Redis call under `source` and converts it to a [`CacheError`].
    pub fn backend_error(&self, source: &'static str, err: &RedisError) -> CacheError {
        error!(source, error = %err, "redis operation failed");
        self.metrics.record_redis_error(source);
        CacheError::Backend(err.to_string())
    }
}

#[async_trait]
impl Cache for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection();
        conn.get::<_, Option<String>>(key).await.map_err(|e| self.backend_error("cache_get", &e))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection();
        let result = match ttl {
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                conn.pset_ex::<_, _, ()>(key, value, millis).await
            }
            None => conn.set::<_, _, ()>(key, value).await,
        };
        result.map_err(|e| self.backend_error("cache_put", &e))
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection();
        conn.del::<_, ()>(key).await.map_err(|e| self.backend_error("cache_remove", &e))
    }
}
