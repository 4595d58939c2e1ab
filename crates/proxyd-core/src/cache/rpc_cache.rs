use super::{
    handlers::HandlerRegistry,
    lvc::{lvc_key_for, LastValueCache},
};
use crate::{
    metrics::MetricsCollector,
    store::{Cache, CacheError},
    types::{JsonRpcRequest, JsonRpcResponse},
};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Deterministic response cache in front of the backend groups.
///
/// Only results that can never change are stored: static chain constants and block-relative
/// reads of blocks older than the confirmation window. `eth_blockNumber` and `eth_gasPrice`
/// are answered from the [`LastValueCache`] instead.
pub struct RpcCache {
    cache: Arc<dyn Cache>,
    lvc: LastValueCache,
    handlers: HandlerRegistry,
    metrics: MetricsCollector,
}

impl RpcCache {
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>, metrics: MetricsCollector) -> Self {
        let lvc = LastValueCache::new(Arc::clone(&cache));
        Self { cache, lvc, handlers: HandlerRegistry::default(), metrics }
    }

    #[must_use]
    pub fn lvc(&self) -> &LastValueCache {
        &self.lvc
    }

    /// Looks up a cached response for `req`, rewritten to carry the request's id.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidParams`] when a cacheable method has malformed params,
    /// [`CacheError::Corrupt`] for undecodable entries, or a store error.
    pub async fn get_rpc(&self, req: &JsonRpcRequest) -> Result<Option<JsonRpcResponse>, CacheError> {
        let cached = self.lookup(req).await?;
        if self.is_cached_method(req) {
            self.metrics.record_cache_lookup(&req.method, cached.is_some());
        }
        Ok(cached)
    }

    /// Whether `req` is answered from the LVC or has a cache handler.
    #[must_use]
    pub fn is_cached_method(&self, req: &JsonRpcRequest) -> bool {
        lvc_key_for(&req.method).is_some() || self.handlers.get(&req.method).is_some()
    }

    async fn lookup(&self, req: &JsonRpcRequest) -> Result<Option<JsonRpcResponse>, CacheError> {
        if let Some(key) = lvc_key_for(&req.method) {
            let value = self.lvc.get(key).await?;
            return Ok(value.map(|v| JsonRpcResponse::success(Value::String(v), Arc::clone(&req.id))));
        }

        let Some(handler) = self.handlers.get(&req.method) else {
            return Ok(None);
        };
        if !handler.is_cacheable(req)? {
            return Ok(None);
        }

        let key = handler.cache_key(req)?;
        match self.cache.get(&key).await? {
            Some(raw) => serde_json::from_str::<JsonRpcResponse>(&raw)
                .map(|res| Some(res.with_id(Arc::clone(&req.id))))
                .map_err(|_| CacheError::Corrupt(key)),
            None => Ok(None),
        }
    }

    /// Stores the result of a forwarded request when it is safe to replay.
    ///
    /// `head_at_request` is the LVC head observed before forwarding. If the head moved while the
    /// request was in flight the entry is skipped, since the confirmation check would otherwise
    /// be evaluated against a different chain state than the one the backend answered from.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidParams`] for malformed params or a store error.
    pub async fn put_rpc(
        &self,
        req: &JsonRpcRequest,
        res: &JsonRpcResponse,
        head_at_request: Option<u64>,
    ) -> Result<(), CacheError> {
        if res.is_error() || res.has_null_result() {
            return Ok(());
        }
        let Some(result) = res.result.as_ref() else {
            return Ok(());
        };

        if let Some(key) = lvc_key_for(&req.method) {
            if let Value::String(value) = result {
                self.lvc.put(key, value).await?;
            }
            return Ok(());
        }

        let Some(handler) = self.handlers.get(&req.method) else {
            return Ok(());
        };
        if !handler.is_cacheable(req)? {
            return Ok(());
        }

        match handler.requires_unconfirmed_blocks(req, &self.lvc).await {
            Ok(false) => {}
            Ok(true) => return Ok(()),
            Err(CacheError::LvcMiss(_)) => {
                debug!(method = %req.method, "head unknown, not caching");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if head_at_request.is_some() && self.current_head().await != head_at_request {
            debug!(method = %req.method, "head moved during request, not caching");
            return Ok(());
        }

        let key = handler.cache_key(req)?;
        let encoded = serde_json::to_string(res).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        self.cache.put(&key, &encoded, handler.ttl()).await
    }

    /// The LVC head, or `None` when unknown or unreadable.
    pub async fn current_head(&self) -> Option<u64> {
        self.lvc.latest_block_number().await.ok()
    }
}
