//! Component container for the proxyd runtime.

use crate::{
    backend::{Backend, BackendGroup, WsWhitelist},
    cache::RpcCache,
    metrics::MetricsCollector,
    proxy::ProxyEngine,
    ratelimit::{LocalRateLimiter, RateLimiter, RedisRateLimiter},
    store::Cache,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::broadcast, task::JoinHandle};

/// The configured rate limiter, kept concrete so its background task can be started.
#[derive(Clone)]
pub enum LimiterHandle {
    Local(Arc<LocalRateLimiter>),
    Redis(Arc<RedisRateLimiter>),
}

impl LimiterHandle {
    #[must_use]
    pub fn as_rate_limiter(&self) -> Arc<dyn RateLimiter> {
        match self {
            Self::Local(limiter) => Arc::clone(limiter) as Arc<dyn RateLimiter>,
            Self::Redis(limiter) => Arc::clone(limiter) as Arc<dyn RateLimiter>,
        }
    }

    /// Starts the window reset task (local) or the replica key refresher (Redis).
    pub(super) fn start_background_task(&self, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        match self {
            Self::Local(limiter) => limiter.start_reset_task(shutdown_rx),
            Self::Redis(limiter) => limiter.start_refresh_task(shutdown_rx),
        }
    }
}

/// Backend group and method whitelist serving WebSocket clients.
#[derive(Clone)]
pub struct WsSettings {
    pub group: Arc<BackendGroup>,
    pub whitelist: WsWhitelist,
}

/// Container for all initialized components.
#[derive(Clone)]
pub struct ProxydComponents {
    metrics: MetricsCollector,
    store: Arc<dyn Cache>,
    limiter: LimiterHandle,
    backends: Vec<Arc<Backend>>,
    groups: BTreeMap<String, Arc<BackendGroup>>,
    rpc_cache: Option<Arc<RpcCache>>,
    proxy_engine: Arc<ProxyEngine>,
    ws: Option<WsSettings>,
}

impl ProxydComponents {
    /// Called by [`super::ProxydRuntimeBuilder`] during initialization.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        metrics: MetricsCollector,
        store: Arc<dyn Cache>,
        limiter: LimiterHandle,
        backends: Vec<Arc<Backend>>,
        groups: BTreeMap<String, Arc<BackendGroup>>,
        rpc_cache: Option<Arc<RpcCache>>,
        proxy_engine: Arc<ProxyEngine>,
        ws: Option<WsSettings>,
    ) -> Self {
        Self { metrics, store, limiter, backends, groups, rpc_cache, proxy_engine, ws }
    }

    #[must_use]
    pub fn metrics_collector(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// The key-value store shared by the cache and the last-value cache.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Cache> {
        &self.store
    }

    #[must_use]
    pub fn limiter(&self) -> &LimiterHandle {
        &self.limiter
    }

    /// All backends, sorted by name.
    #[must_use]
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    #[must_use]
    pub fn group(&self, name: &str) -> Option<&Arc<BackendGroup>> {
        self.groups.get(name)
    }

    /// `None` when `[cache] enabled = false`.
    #[must_use]
    pub fn rpc_cache(&self) -> Option<&Arc<RpcCache>> {
        self.rpc_cache.as_ref()
    }

    #[must_use]
    pub fn proxy_engine(&self) -> &Arc<ProxyEngine> {
        &self.proxy_engine
    }

    /// `None` when no backend group serves WebSocket clients.
    #[must_use]
    pub fn ws(&self) -> Option<&WsSettings> {
        self.ws.as_ref()
    }
}
