//! Per-method cache policies.
//!
//! Each cacheable method has a [`MethodHandler`] deciding whether a request may be cached,
//! which key it is stored under, and whether it touches blocks that may still be reorged.

use super::lvc::LastValueCache;
use crate::{
    store::CacheError,
    types::JsonRpcRequest,
    utils::{sha256_canonical, BlockParameter, BlockRef, BlockTag},
};
use ahash::AHashMap;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Blocks at most this far behind the head are treated as unconfirmed.
pub const NUM_BLOCK_CONFIRMATIONS: u64 = 50;

/// TTL applied to cached entries of block-relative methods.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Cache policy for one JSON-RPC method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Deterministic key for `req`. Only meaningful when [`MethodHandler::is_cacheable`] holds.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidParams`] for malformed params.
    fn cache_key(&self, req: &JsonRpcRequest) -> Result<String, CacheError>;

    /// # Errors
    ///
    /// Returns [`CacheError::InvalidParams`] for malformed params.
    fn is_cacheable(&self, req: &JsonRpcRequest) -> Result<bool, CacheError>;

    /// True when the request reads a block within [`NUM_BLOCK_CONFIRMATIONS`] of the head.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::LvcMiss`] when the head is unknown, or
    /// [`CacheError::InvalidParams`] for malformed params.
    async fn requires_unconfirmed_blocks(
        &self,
        req: &JsonRpcRequest,
        lvc: &LastValueCache,
    ) -> Result<bool, CacheError>;

    fn ttl(&self) -> Option<Duration> {
        Some(DEFAULT_CACHE_TTL)
    }
}

fn invalid(msg: impl Into<String>) -> CacheError {
    CacheError::InvalidParams(msg.into())
}

fn params_with_len<'a>(
    req: &'a JsonRpcRequest,
    min: usize,
    max: usize,
) -> Result<&'a [Value], CacheError> {
    let params = req.params_array().ok_or_else(|| invalid("params must be an array"))?;
    if params.len() < min || params.len() > max {
        return Err(invalid(format!("expected {min} to {max} params, got {}", params.len())));
    }
    Ok(params)
}

fn block_ref(value: &Value) -> Result<BlockRef, CacheError> {
    BlockParameter::from_json_value(value).map_err(|e| invalid(e.to_string()))
}

fn bool_param(value: &Value) -> Result<bool, CacheError> {
    value.as_bool().ok_or_else(|| invalid("expected boolean param"))
}

/// Whether `block` is a moving tag or within the confirmation window of the LVC head.
async fn is_unconfirmed(block: BlockRef, lvc: &LastValueCache) -> Result<bool, CacheError> {
    match block {
        BlockRef::Tag(BlockTag::Earliest) => Ok(false),
        BlockRef::Tag(_) => Ok(true),
        BlockRef::Number(n) => {
            let head = lvc.latest_block_number().await?;
            Ok(head <= n.saturating_add(NUM_BLOCK_CONFIRMATIONS))
        }
    }
}

/// Methods whose result never changes for the lifetime of a chain.
pub struct StaticMethodHandler {
    method: &'static str,
}

#[async_trait]
impl MethodHandler for StaticMethodHandler {
    fn cache_key(&self, _req: &JsonRpcRequest) -> Result<String, CacheError> {
        Ok(format!("method:{}", self.method))
    }

    fn is_cacheable(&self, _req: &JsonRpcRequest) -> Result<bool, CacheError> {
        Ok(true)
    }

    async fn requires_unconfirmed_blocks(
        &self,
        _req: &JsonRpcRequest,
        _lvc: &LastValueCache,
    ) -> Result<bool, CacheError> {
        Ok(false)
    }

    fn ttl(&self) -> Option<Duration> {
        None
    }
}

/// `eth_getBlockByNumber(blockTag, includeTransactions)`.
pub struct BlockByNumberHandler;

impl BlockByNumberHandler {
    fn parse(req: &JsonRpcRequest) -> Result<(BlockRef, bool), CacheError> {
        let params = params_with_len(req, 2, 2)?;
        Ok((block_ref(&params[0])?, bool_param(&params[1])?))
    }
}

#[async_trait]
impl MethodHandler for BlockByNumberHandler {
    fn cache_key(&self, req: &JsonRpcRequest) -> Result<String, CacheError> {
        let (block, include_txs) = Self::parse(req)?;
        Ok(format!("method:eth_getBlockByNumber:{}:{include_txs}", block.canonical()))
    }

    fn is_cacheable(&self, req: &JsonRpcRequest) -> Result<bool, CacheError> {
        let (block, _) = Self::parse(req)?;
        Ok(!block.is_moving())
    }

    async fn requires_unconfirmed_blocks(
        &self,
        req: &JsonRpcRequest,
        lvc: &LastValueCache,
    ) -> Result<bool, CacheError> {
        let (block, _) = Self::parse(req)?;
        is_unconfirmed(block, lvc).await
    }
}

/// `eth_getBlockRange(start, end, includeTransactions)`.
pub struct BlockRangeHandler;

impl BlockRangeHandler {
    fn parse(req: &JsonRpcRequest) -> Result<(BlockRef, BlockRef, bool), CacheError> {
        let params = params_with_len(req, 3, 3)?;
        Ok((block_ref(&params[0])?, block_ref(&params[1])?, bool_param(&params[2])?))
    }
}

#[async_trait]
impl MethodHandler for BlockRangeHandler {
    fn cache_key(&self, req: &JsonRpcRequest) -> Result<String, CacheError> {
        let (start, end, include_txs) = Self::parse(req)?;
        Ok(format!(
            "method:eth_getBlockRange:{}:{}:{include_txs}",
            start.canonical(),
            end.canonical()
        ))
    }

    fn is_cacheable(&self, req: &JsonRpcRequest) -> Result<bool, CacheError> {
        let (start, end, _) = Self::parse(req)?;
        Ok(!start.is_moving() && !end.is_moving())
    }

    async fn requires_unconfirmed_blocks(
        &self,
        req: &JsonRpcRequest,
        lvc: &LastValueCache,
    ) -> Result<bool, CacheError> {
        let (start, end, _) = Self::parse(req)?;
        if start.is_moving() || end.is_moving() {
            return Ok(true);
        }
        Ok(is_unconfirmed(start, lvc).await? || is_unconfirmed(end, lvc).await?)
    }
}

/// `eth_call(callObject, blockTag?, stateOverrides?)`.
///
/// Only calls pinned to a concrete block number are cacheable. The key hashes the canonical
/// params so that call objects differing only in key order share an entry.
pub struct EthCallHandler;

impl EthCallHandler {
    /// Returns the block reference, or `None` for an EIP-1898 block object. An omitted block
    /// defaults to `latest`.
    fn block(req: &JsonRpcRequest) -> Result<Option<BlockRef>, CacheError> {
        let params = params_with_len(req, 1, 3)?;
        if !params[0].is_object() {
            return Err(invalid("call object must be an object"));
        }
        match params.get(1) {
            None => Ok(Some(BlockRef::Tag(BlockTag::Latest))),
            Some(Value::Object(_)) => Ok(None),
            Some(value) => block_ref(value).map(Some),
        }
    }
}

#[async_trait]
impl MethodHandler for EthCallHandler {
    fn cache_key(&self, req: &JsonRpcRequest) -> Result<String, CacheError> {
        Self::block(req)?;
        Ok(format!("method:eth_call:{}", sha256_canonical(&req.params)))
    }

    fn is_cacheable(&self, req: &JsonRpcRequest) -> Result<bool, CacheError> {
        Ok(matches!(Self::block(req)?, Some(BlockRef::Number(_))))
    }

    async fn requires_unconfirmed_blocks(
        &self,
        req: &JsonRpcRequest,
        lvc: &LastValueCache,
    ) -> Result<bool, CacheError> {
        match Self::block(req)? {
            Some(block) => is_unconfirmed(block, lvc).await,
            None => Ok(true),
        }
    }
}

/// Lookup table from method name to its cache policy.
pub struct HandlerRegistry {
    handlers: AHashMap<&'static str, Box<dyn MethodHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut handlers: AHashMap<&'static str, Box<dyn MethodHandler>> = AHashMap::new();
        for method in ["eth_chainId", "net_version"] {
            handlers.insert(method, Box::new(StaticMethodHandler { method }));
        }
        handlers.insert("eth_getBlockByNumber", Box::new(BlockByNumberHandler));
        handlers.insert("eth_getBlockRange", Box::new(BlockRangeHandler));
        handlers.insert("eth_call", Box::new(EthCallHandler));
        Self { handlers }
    }
}

impl HandlerRegistry {
    #[must_use]
    pub fn get(&self, method: &str) -> Option<&dyn MethodHandler> {
        self.handlers.get(method).map(|handler| handler.as_ref())
    }
}
