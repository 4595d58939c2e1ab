//! Key-value storage shared by the RPC cache, the last-value cache and the Redis-backed rate
//! limiter.
//!
//! The [`Cache`] trait is the seam between the proxy and its storage. Two implementations are
//! provided: [`MemoryCache`] for single-replica deployments and [`RedisStore`] when a Redis URL
//! is configured.

mod memory;
mod redis;

pub use memory::MemoryCache;
pub use redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the storage layer and the caches built on it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CacheError {
    /// The backing store failed or was unreachable.
    #[error("cache backend error: {0}")]
    Backend(String),

    /// Request params could not be interpreted by a cache handler.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// A last-value cache key has not been populated yet.
    #[error("last value cache miss: {0}")]
    LvcMiss(&'static str),

    /// A stored value could not be decoded.
    #[error("corrupt cache entry for key {0}")]
    Corrupt(String),
}

/// String-keyed store with optional per-entry TTL.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns `Ok(None)` for an absent or expired key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] when the store cannot be reached.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Stores `value` under `key`, expiring after `ttl` when given.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] when the store cannot be reached.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] when the store cannot be reached.
    async fn remove(&self, key: &str) -> Result<(), CacheError>;
}
