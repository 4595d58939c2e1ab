//! JSON-RPC 2.0 envelope codec for the inbound path.
//!
//! Bodies are classified with [`is_batch`] and then decoded with [`parse_single`] or
//! [`parse_batch`] + [`parse_value`]. All envelope-level failures are reported as
//! [`ProxyError`] values so the caller can answer them with a null-id error envelope.

use crate::{
    proxy::errors::ProxyError,
    types::{JsonRpcRequest, JSONRPC_VERSION, JSONRPC_VERSION_COW},
};
use serde_json::{Map, Number, Value};
use std::sync::Arc;

/// Returns true when the first non-whitespace byte of `body` opens a JSON array.
#[must_use]
pub fn is_batch(body: &[u8]) -> bool {
    body.iter().find(|b| !b.is_ascii_whitespace()).is_some_and(|b| *b == b'[')
}

/// Decodes a single request envelope.
///
/// # Errors
///
/// Returns [`ProxyError::Parse`] when the body is not a JSON object, and
/// [`ProxyError::InvalidRequest`] when the object is not an admissible JSON-RPC 2.0 request.
pub fn parse_single(body: &[u8]) -> Result<JsonRpcRequest, ProxyError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| ProxyError::Parse)?;
    parse_value(value)
}

/// Decodes a batch body into its raw elements.
///
/// Elements are validated individually with [`parse_value`] so that one malformed element
/// only fails its own slot.
///
/// # Errors
///
/// Returns [`ProxyError::Parse`] when the body is not a JSON array.
pub fn parse_batch(body: &[u8]) -> Result<Vec<Value>, ProxyError> {
    serde_json::from_slice(body).map_err(|_| ProxyError::Parse)
}

/// Rejects empty batches and batches larger than `max_batch_size`.
///
/// # Errors
///
/// Returns [`ProxyError::InvalidRequest`] for an empty batch and
/// [`ProxyError::TooManyBatchRequests`] when the limit is exceeded.
pub fn check_batch_size(len: usize, max_batch_size: usize) -> Result<(), ProxyError> {
    if len == 0 {
        return Err(ProxyError::InvalidRequest("must specify at least one batch call".into()));
    }
    if len > max_batch_size {
        return Err(ProxyError::TooManyBatchRequests);
    }
    Ok(())
}

/// Validates a decoded JSON value as a request envelope.
///
/// The id must be present and scalar. Integral numeric ids are normalized to `i64` so that
/// `1` and `1.0` echo back identically.
///
/// # Errors
///
/// See [`parse_single`].
pub fn parse_value(value: Value) -> Result<JsonRpcRequest, ProxyError> {
    let Value::Object(mut obj) = value else {
        return Err(ProxyError::Parse);
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(ProxyError::InvalidRequest("invalid jsonrpc version".into()));
    }

    let method = match obj.remove("method") {
        Some(Value::String(method)) if !method.is_empty() => method,
        _ => return Err(ProxyError::InvalidRequest("no method specified".into())),
    };

    let id = normalize_id(&mut obj)?;
    let params = obj.remove("params").unwrap_or_else(|| Value::Array(Vec::new()));

    Ok(JsonRpcRequest { jsonrpc: JSONRPC_VERSION_COW, method, params, id: Arc::new(id) })
}

fn normalize_id(obj: &mut Map<String, Value>) -> Result<Value, ProxyError> {
    let invalid = || ProxyError::InvalidRequest("invalid id".into());

    match obj.remove("id").ok_or_else(invalid)? {
        id @ (Value::Null | Value::Bool(_) | Value::String(_)) => Ok(id),
        Value::Number(n) => integral_id(&n).map(Value::from).ok_or_else(invalid),
        Value::Array(_) | Value::Object(_) => Err(invalid()),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn integral_id(n: &Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    let f = n.as_f64()?;
    if f.fract() != 0.0 || f < i64::MIN as f64 || f >= i64::MAX as f64 {
        return None;
    }
    Some(f as i64)
}
