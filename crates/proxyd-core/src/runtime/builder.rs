//! Builder assembling the proxy components from configuration.

use super::{
    components::{LimiterHandle, WsSettings},
    lifecycle::ProxydRuntime,
    ProxydComponents,
};
use crate::{
    backend::{Backend, BackendGroup},
    cache::{LastValueCache, LvcPoller, RpcCache},
    config::AppConfig,
    metrics::MetricsCollector,
    proxy::{MethodRouter, ProxyEngine, RequestLimits},
    ratelimit::{
        FrontendRateLimiter, LocalRateLimiter, MemoryFrontendRateLimiter, RateLimiter, RedisFrontendRateLimiter,
        RedisRateLimiter,
    },
    store::{Cache, MemoryCache, RedisStore},
};
use ahash::{AHashMap, AHashSet};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Errors that can occur during runtime initialization.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// Configuration is missing or violates a startup rule.
    #[error("configuration validation failed: {0}")]
    ConfigValidation(String),

    /// The shared-state store could not be reached.
    #[error("failed to connect to shared store: {0}")]
    Store(String),

    /// A backend client could not be built.
    #[error("failed to initialize backend {name}: {reason}")]
    Backend { name: String, reason: String },
}

#[derive(Clone)]
struct RuntimeOptions {
    enable_lvc_poller: bool,
    shutdown_channel_capacity: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self { enable_lvc_poller: false, shutdown_channel_capacity: 16 }
    }
}

/// Builder for constructing a [`ProxydRuntime`].
///
/// ```no_run
/// # use proxyd_core::{config::AppConfig, runtime::ProxydRuntimeBuilder};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = AppConfig::load(None)?;
/// let runtime = ProxydRuntimeBuilder::new().with_config(config).enable_lvc_poller().build().await?;
/// # Ok(())
/// # }
/// ```
pub struct ProxydRuntimeBuilder {
    config: Option<AppConfig>,
    options: RuntimeOptions,
}

impl ProxydRuntimeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self { config: None, options: RuntimeOptions::default() }
    }

    #[must_use]
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Polls the head block number and gas price into the last-value cache every second.
    ///
    /// Without the poller the last-value cache only learns values from forwarded
    /// `eth_blockNumber` and `eth_gasPrice` responses.
    #[must_use]
    pub fn enable_lvc_poller(mut self) -> Self {
        self.options.enable_lvc_poller = true;
        self
    }

    #[must_use]
    pub fn with_shutdown_channel_capacity(mut self, capacity: usize) -> Self {
        self.options.shutdown_channel_capacity = capacity;
        self
    }

    /// Builds the runtime and starts its background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] if the configuration is missing or invalid, the Redis store
    /// cannot be reached, or a backend client cannot be built.
    pub async fn build(self) -> Result<ProxydRuntime, RuntimeError> {
        let config = self
            .config
            .ok_or_else(|| RuntimeError::ConfigValidation("no configuration provided".to_string()))?;
        config.validate().map_err(RuntimeError::ConfigValidation)?;

        info!(
            backends = config.backends.len(),
            groups = config.backend_groups.len(),
            methods = config.rpc_method_mappings.len(),
            shared_store = config.redis_url().is_some(),
            cache_enabled = config.cache.enabled,
            "initializing proxyd runtime"
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(self.options.shutdown_channel_capacity);
        let metrics = MetricsCollector::new();

        let mut redis_store = None;
        let (store, limiter): (Arc<dyn Cache>, LimiterHandle) = match config.redis_url() {
            Some(url) => {
                let redis = RedisStore::connect(url, metrics.clone())
                    .await
                    .map_err(|e| RuntimeError::Store(e.to_string()))?;
                info!("connected to redis");
                let limiter = Arc::new(RedisRateLimiter::new(redis.clone()));
                redis_store = Some(redis.clone());
                (Arc::new(redis), LimiterHandle::Redis(limiter))
            }
            None => {
                debug!("using in-process store and rate limiter");
                (Arc::new(MemoryCache::default()), LimiterHandle::Local(Arc::new(LocalRateLimiter::new())))
            }
        };
        let shared_limiter: Arc<dyn RateLimiter> = limiter.as_rate_limiter();

        let mut backends = AHashMap::new();
        for settings in config.backend_settings() {
            let name = settings.name.to_string();
            let backend = Backend::new(settings, Arc::clone(&shared_limiter), metrics.clone())
                .map_err(|e| RuntimeError::Backend { name: name.clone(), reason: e.to_string() })?;
            debug!(backend = %name, "backend initialized");
            backends.insert(name, Arc::new(backend));
        }

        let mut groups = BTreeMap::new();
        for (name, group_config) in &config.backend_groups {
            let members = group_config
                .backends
                .iter()
                .filter_map(|backend| backends.get(backend).cloned())
                .collect();
            groups.insert(name.clone(), Arc::new(BackendGroup::new(name.as_str(), members, metrics.clone())));
        }

        let routes = config
            .rpc_method_mappings
            .iter()
            .filter_map(|(method, group)| groups.get(group).map(|g| (method.clone(), Arc::clone(g))))
            .collect();

        let rpc_cache = config.cache.enabled.then(|| Arc::new(RpcCache::new(Arc::clone(&store), metrics.clone())));

        let lvc_poller = if self.options.enable_lvc_poller && config.cache.enabled {
            lvc_group(&config, &groups).map(|group| {
                info!(group = group.name(), "last value cache poller enabled");
                Arc::new(LvcPoller::new(LastValueCache::new(Arc::clone(&store)), group, metrics.clone()))
            })
        } else {
            None
        };

        let ws = config.ws_group().and_then(|name| groups.get(name)).map(|group| WsSettings {
            group: Arc::clone(group),
            whitelist: Arc::new(config.ws_method_whitelist.iter().cloned().collect::<AHashSet<_>>()),
        });

        let shared_counters = redis_store.filter(|_| config.rate_limit.use_redis);
        let limiter_factory = |interval: Duration, limit: u64, prefix: &str| -> Arc<dyn FrontendRateLimiter> {
            match &shared_counters {
                Some(redis) => Arc::new(RedisFrontendRateLimiter::new(redis.clone(), prefix, interval, limit)),
                None => Arc::new(MemoryFrontendRateLimiter::new(interval, limit)),
            }
        };
        let limits = RequestLimits::from_config(&config.rate_limit, &config.sender_rate_limit, &limiter_factory)
            .map_err(|e| RuntimeError::ConfigValidation(e.to_string()))?;
        if config.rate_limit.is_enabled() || config.sender_rate_limit.enabled {
            info!(
                base_rate = config.rate_limit.base_rate,
                method_overrides = config.rate_limit.method_overrides.len(),
                sender_limit = config.sender_rate_limit.enabled,
                shared = shared_counters.is_some(),
                "client rate limits enabled"
            );
        }

        let engine = ProxyEngine::new(
            MethodRouter::new(routes),
            rpc_cache.clone(),
            metrics.clone(),
            config.server.max_batch_size,
        )
        .with_limits(limits)
        .with_max_upstream_batch_size(config.server.max_upstream_batch_size);
        let engine = Arc::new(engine);
        debug!("proxy engine initialized");

        let mut backend_list: Vec<_> = backends.into_values().collect();
        backend_list.sort_by(|a, b| a.name().cmp(b.name()));

        let components =
            ProxydComponents::new(metrics, store, limiter, backend_list, groups, rpc_cache, engine, ws);
        let runtime = ProxydRuntime::new(components, shutdown_tx, config, lvc_poller);

        info!("proxyd runtime initialization complete");
        Ok(runtime)
    }
}

/// The group polled by the last-value cache: the one serving `eth_blockNumber`, else the
/// first group by name.
fn lvc_group(
    config: &AppConfig,
    groups: &BTreeMap<String, Arc<BackendGroup>>,
) -> Option<Arc<BackendGroup>> {
    config
        .rpc_method_mappings
        .get("eth_blockNumber")
        .and_then(|name| groups.get(name))
        .or_else(|| groups.values().next())
        .cloned()
}

impl Default for ProxydRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
