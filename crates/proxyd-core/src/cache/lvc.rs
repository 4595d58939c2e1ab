//! Last-value cache: the chain head and gas price, refreshed in the background.
//!
//! The values are stored as the raw hex quantities returned by the backend under fixed keys of
//! the shared [`Cache`], so every replica sharing a Redis instance sees the same head.

use crate::{
    backend::{calc_backoff, BackendGroup},
    metrics::MetricsCollector,
    proxy::context::RequestContext,
    store::{Cache, CacheError},
    types::JsonRpcRequest,
    utils::BlockParameter,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

pub const BLOCK_NUMBER_KEY: &str = "lvc:blockNumber";
pub const GAS_PRICE_KEY: &str = "lvc:gasPrice";

/// Interval between polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts per key per poll before giving up until the next tick.
pub const MAX_POLL_ATTEMPTS: u32 = 5;

/// Key under which the LVC stores the result of `method`, if it is served from the LVC.
#[must_use]
pub fn lvc_key_for(method: &str) -> Option<&'static str> {
    match method {
        "eth_blockNumber" => Some(BLOCK_NUMBER_KEY),
        "eth_gasPrice" => Some(GAS_PRICE_KEY),
        _ => None,
    }
}

/// Read/write view over the LVC keys.
#[derive(Clone)]
pub struct LastValueCache {
    cache: Arc<dyn Cache>,
}

impl LastValueCache {
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get(&self, key: &'static str) -> Result<Option<String>, CacheError> {
        self.cache.get(key).await
    }

    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn put(&self, key: &'static str, value: &str) -> Result<(), CacheError> {
        self.cache.put(key, value, None).await
    }

    /// # Errors
    ///
    /// Returns [`CacheError::LvcMiss`] before the first successful poll and
    /// [`CacheError::Corrupt`] if the stored value is not a hex quantity.
    pub async fn latest_block_number(&self) -> Result<u64, CacheError> {
        self.quantity(BLOCK_NUMBER_KEY).await
    }

    /// # Errors
    ///
    /// See [`LastValueCache::latest_block_number`].
    pub async fn latest_gas_price(&self) -> Result<u64, CacheError> {
        self.quantity(GAS_PRICE_KEY).await
    }

    async fn quantity(&self, key: &'static str) -> Result<u64, CacheError> {
        let raw = self.get(key).await?.ok_or(CacheError::LvcMiss(key))?;
        BlockParameter::parse_hex(&raw).ok_or_else(|| CacheError::Corrupt(key.to_string()))
    }
}

/// Background task polling the head and gas price from a backend group.
pub struct LvcPoller {
    lvc: LastValueCache,
    group: Arc<BackendGroup>,
    metrics: MetricsCollector,
}

impl LvcPoller {
    #[must_use]
    pub fn new(lvc: LastValueCache, group: Arc<BackendGroup>, metrics: MetricsCollector) -> Self {
        Self { lvc, group, metrics }
    }

    /// Polls every [`POLL_INTERVAL`] until shutdown. An in-flight poll is abandoned on shutdown.
    pub fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(group = self.group.name(), "lvc poller started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        info!("lvc poller shutting down");
                        break;
                    }
                    () = async {
                        interval.tick().await;
                        self.poll_once().await;
                    } => {}
                }
            }
        })
    }

    /// Refreshes both keys once.
    pub async fn poll_once(&self) {
        for (key, method) in [(BLOCK_NUMBER_KEY, "eth_blockNumber"), (GAS_PRICE_KEY, "eth_gasPrice")] {
            match self.poll_key(method).await {
                Some(value) => match self.lvc.put(key, &value).await {
                    Ok(()) => {
                        self.metrics.record_lvc_poll(key);
                        debug!(key, value = %value, "lvc updated");
                    }
                    Err(e) => warn!(key, error = %e, "failed to store lvc value"),
                },
                None => warn!(key, attempts = MAX_POLL_ATTEMPTS, "lvc poll failed"),
            }
        }
    }

    async fn poll_key(&self, method: &'static str) -> Option<String> {
        let ctx = RequestContext::internal();
        let req = JsonRpcRequest::new(method, json!([]), json!(1));

        for attempt in 0..MAX_POLL_ATTEMPTS {
            match self.group.forward(&ctx, &req).await {
                Ok((response, _)) => match response.result {
                    Some(Value::String(value)) if BlockParameter::parse_hex(&value).is_some() => {
                        return Some(value);
                    }
                    _ => warn!(method, attempt, "unexpected lvc poll response"),
                },
                Err(e) => warn!(method, attempt, error = %e, "lvc poll request failed"),
            }

            if attempt + 1 < MAX_POLL_ATTEMPTS {
                tokio::time::sleep(calc_backoff(attempt)).await;
            }
        }
        None
    }
}
