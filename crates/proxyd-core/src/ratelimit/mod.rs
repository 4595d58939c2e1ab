//! Backend admission state: per-second request counters, quarantine flags and WebSocket
//! connection counts. Client-facing request limits live in [`frontend`].
//!
//! [`LocalRateLimiter`] keeps the state in process. [`RedisRateLimiter`] shares it across proxy
//! replicas. Callers decide what a store failure means for each operation, see
//! [`crate::backend::Backend`].

pub mod frontend;
mod local;
mod redis;

pub use frontend::{FrontendRateLimiter, MemoryFrontendRateLimiter, RedisFrontendRateLimiter};
pub use local::LocalRateLimiter;
pub use redis::RedisRateLimiter;

use crate::store::CacheError;
use async_trait::async_trait;
use std::time::Duration;

/// Shared state consulted before a request or connection is admitted to a backend.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] when the shared store is unreachable.
    async fn is_backend_online(&self, name: &str) -> Result<bool, CacheError>;

    /// Quarantines `name` for `duration`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] when the shared store is unreachable.
    async fn set_backend_offline(&self, name: &str, duration: Duration) -> Result<(), CacheError>;

    /// Increments the request counter of the current one-second window and returns its value.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] when the shared store is unreachable.
    async fn inc_backend_rps(&self, name: &str) -> Result<u64, CacheError>;

    /// Reserves a WebSocket slot on `name`. Returns `false` when `max` slots are already in use;
    /// a `max` of zero means unlimited.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] when the shared store is unreachable.
    async fn inc_backend_ws_conns(&self, name: &str, max: u64) -> Result<bool, CacheError>;

    /// Releases a slot reserved by [`RateLimiter::inc_backend_ws_conns`].
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] when the shared store is unreachable.
    async fn dec_backend_ws_conns(&self, name: &str) -> Result<(), CacheError>;

    /// Drops every slot this replica holds on the named backends. Called on shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] when the shared store is unreachable.
    async fn flush_backend_ws_conns(&self, names: &[String]) -> Result<(), CacheError>;
}
