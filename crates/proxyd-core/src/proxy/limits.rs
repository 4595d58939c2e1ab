//! Client-facing rate limits applied before a request reaches a backend group.
//!
//! The base limit counts every HTTP request per client IP. Method overrides count individual
//! calls, batch elements included. The sender limit counts `eth_sendRawTransaction` calls per
//! recovered sender and nonce.

use super::{context::RequestContext, errors::ProxyError};
use crate::{
    config::{RateLimitConfig, SenderRateLimitConfig},
    ratelimit::FrontendRateLimiter,
    types::JsonRpcRequest,
};
use ahash::{AHashMap, AHashSet};
use alloy_consensus::{transaction::SignerRecoverable, Transaction, TxEnvelope};
use alloy_eips::eip2718::Decodable2718;
use regex::Regex;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};

const SEND_RAW_TRANSACTION: &str = "eth_sendRawTransaction";

/// Builds a limiter from `(interval, limit, key prefix)`.
pub type LimiterFactory<'a> = &'a dyn Fn(Duration, u64, &str) -> Arc<dyn FrontendRateLimiter>;

struct SenderLimit {
    limiter: Arc<dyn FrontendRateLimiter>,
    allowed_chain_ids: Vec<u64>,
}

/// Every client-facing limit configured for the HTTP listener.
#[derive(Default)]
pub struct RequestLimits {
    main: Option<Arc<dyn FrontendRateLimiter>>,
    overrides: AHashMap<String, Arc<dyn FrontendRateLimiter>>,
    global_methods: AHashSet<String>,
    exempt_origins: Vec<Regex>,
    exempt_user_agents: Vec<Regex>,
    sender: Option<SenderLimit>,
}

impl std::fmt::Debug for RequestLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLimits")
            .field("main", &self.main.is_some())
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .field("sender", &self.sender.is_some())
            .finish_non_exhaustive()
    }
}

impl RequestLimits {
    /// # Errors
    ///
    /// Returns the first exemption pattern that is not a valid regex.
    pub fn from_config(
        limits: &RateLimitConfig,
        sender: &SenderRateLimitConfig,
        factory: LimiterFactory<'_>,
    ) -> Result<Self, regex::Error> {
        let main = (limits.base_rate > 0)
            .then(|| factory(Duration::from_secs(limits.base_interval_seconds), limits.base_rate, "main"));

        let overrides = limits
            .method_overrides
            .iter()
            .map(|(method, o)| {
                let limiter = factory(Duration::from_secs(o.interval_seconds), o.limit, method.as_str());
                (method.clone(), limiter)
            })
            .collect();
        let global_methods =
            limits.method_overrides.iter().filter(|(_, o)| o.global).map(|(method, _)| method.clone()).collect();

        let sender = sender.enabled.then(|| SenderLimit {
            limiter: factory(Duration::from_secs(sender.interval_seconds), sender.limit, "senders"),
            allowed_chain_ids: sender.allowed_chain_ids.clone(),
        });

        Ok(Self {
            main,
            overrides,
            global_methods,
            exempt_origins: compile(&limits.exempt_origins)?,
            exempt_user_agents: compile(&limits.exempt_user_agents)?,
            sender,
        })
    }

    /// True when requests must carry a client IP.
    #[must_use]
    pub fn requires_remote_ip(&self) -> bool {
        self.main.is_some() || !self.overrides.is_empty()
    }

    fn is_exempt(&self, ctx: &RequestContext) -> bool {
        let matches = |patterns: &[Regex], value: Option<&str>| {
            value.is_some_and(|value| patterns.iter().any(|p| p.is_match(value)))
        };
        matches(&self.exempt_origins, ctx.origin.as_deref()) ||
            matches(&self.exempt_user_agents, ctx.user_agent.as_deref())
    }

    /// Store failures count as limited.
    async fn is_limited(&self, ctx: &RequestContext, limiter: &dyn FrontendRateLimiter, global: bool) -> bool {
        if !global && self.is_exempt(ctx) {
            return false;
        }
        let Some(ip) = ctx.remote_ip() else { return false };
        match limiter.take(ip).await {
            Ok(admitted) => !admitted,
            Err(e) => {
                warn!(req_id = %ctx.request_id, error = %e, "error taking rate limit");
                true
            }
        }
    }

    /// Admits an HTTP request against the base limit. Runs before the body is read.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidRequest`] when limits are configured and the client IP is
    /// unknown, or [`ProxyError::OverRateLimit`].
    pub async fn check_request(&self, ctx: &RequestContext) -> Result<(), ProxyError> {
        if self.requires_remote_ip() && ctx.remote_ip().is_none() {
            return Err(ProxyError::InvalidRequest("request does not include a remote IP".to_string()));
        }
        let Some(main) = &self.main else { return Ok(()) };
        if self.is_limited(ctx, main.as_ref(), false).await {
            warn!(
                req_id = %ctx.request_id,
                remote_ip = ctx.remote_ip().unwrap_or_default(),
                origin = ctx.origin.as_deref().unwrap_or_default(),
                user_agent = ctx.user_agent.as_deref().unwrap_or_default(),
                "rate limited request"
            );
            return Err(ProxyError::OverRateLimit);
        }
        Ok(())
    }

    /// Applies the per-method override and, for raw transactions, the sender limit.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::OverRateLimit`], [`ProxyError::OverSenderRateLimit`], or the error
    /// describing why a raw transaction could not be attributed to a sender.
    pub async fn check_method(&self, ctx: &RequestContext, req: &JsonRpcRequest) -> Result<(), ProxyError> {
        if let Some(limiter) = self.overrides.get(&req.method) {
            let global = self.global_methods.contains(&req.method);
            if self.is_limited(ctx, limiter.as_ref(), global).await {
                debug!(req_id = %ctx.request_id, method = %req.method, "rate limited specific rpc");
                return Err(ProxyError::OverRateLimit);
            }
        }

        let Some(sender) = self.sender.as_ref().filter(|_| req.method == SEND_RAW_TRANSACTION) else {
            return Ok(());
        };
        let key = sender_key(&req.params, &sender.allowed_chain_ids).inspect_err(|e| {
            debug!(req_id = %ctx.request_id, error = %e, "cannot attribute raw transaction to a sender");
        })?;
        match sender.limiter.take(&key).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(req_id = %ctx.request_id, sender = %key, "sender rate limit exceeded");
                Err(ProxyError::OverSenderRateLimit)
            }
            Err(e) => {
                error!(req_id = %ctx.request_id, error = %e, "error taking from sender limiter");
                Err(ProxyError::Internal)
            }
        }
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
    patterns.iter().map(|pattern| Regex::new(pattern)).collect()
}

/// Recovers `<checksummed sender>:<nonce>` from `eth_sendRawTransaction` params.
///
/// # Errors
///
/// Mirrors what an execution node answers for the same malformed params: a parse error for
/// non-string params, `-32602` for a wrong arity or undecodable transaction, and
/// [`ProxyError::InvalidSender`] for a chain id outside `allowed_chain_ids`.
pub fn sender_key(params: &Value, allowed_chain_ids: &[u64]) -> Result<String, ProxyError> {
    let params: Vec<String> = serde_json::from_value(params.clone()).map_err(|_| ProxyError::Parse)?;
    let [raw] = params.as_slice() else {
        return Err(ProxyError::InvalidParams("missing value for required argument 0".to_string()));
    };

    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| ProxyError::InvalidParams("hex string without 0x prefix".to_string()))?;
    let bytes = hex::decode(digits).map_err(|e| ProxyError::InvalidParams(e.to_string()))?;
    let tx = TxEnvelope::decode_2718(&mut bytes.as_slice()).map_err(|e| ProxyError::InvalidParams(e.to_string()))?;

    let chain_id = tx.chain_id().unwrap_or_default();
    if !allowed_chain_ids.is_empty() && !allowed_chain_ids.contains(&chain_id) {
        return Err(ProxyError::InvalidSender);
    }

    let from = tx.recover_signer().map_err(|e| ProxyError::InvalidParams(e.to_string()))?;
    Ok(format!("{from}:{}", tx.nonce()))
}
