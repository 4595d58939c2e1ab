//! Core type definitions for the JSON-RPC 2.0 envelope.
//!
//! # Type Categories
//!
//! - [`JsonRpcRequest`], [`JsonRpcResponse`], [`JsonRpcError`]: protocol envelopes
//! - [`CacheStatus`]: value of the `X-Proxyd-Cache-Status` response header
//!
//! # Performance Notes
//!
//! - `jsonrpc` is a `Cow<'static, str>` so envelopes built by the proxy never allocate the
//!   version string. Use [`JSONRPC_VERSION_COW`].
//! - `id` is an `Arc<Value>` so error responses and cached entries can echo the client's id
//!   with a reference-count bump.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{borrow::Cow, sync::Arc};

/// JSON-RPC protocol version.
pub const JSONRPC_VERSION: &str = "2.0";

/// Pre-allocated `Cow` for the JSON-RPC version.
pub const JSONRPC_VERSION_COW: Cow<'static, str> = Cow::Borrowed(JSONRPC_VERSION);

/// Response header reporting whether any envelope in the reply came from the cache.
pub const CACHE_STATUS_HEADER: &str = "x-proxyd-cache-status";

/// Whether a reply was served (at least partly) from the RPC cache.
///
/// ```
/// use proxyd_core::types::CacheStatus;
///
/// assert_eq!(CacheStatus::from_hit(true).to_string(), "HIT");
/// assert_eq!(CacheStatus::from_hit(false).to_string(), "MISS");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// At least one envelope in the reply was read from the cache.
    Hit,
    /// Every envelope was produced by a backend or by the proxy itself.
    Miss,
}

impl CacheStatus {
    #[must_use]
    pub fn from_hit(hit: bool) -> Self {
        if hit {
            Self::Hit
        } else {
            Self::Miss
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_params() -> Value {
    Value::Array(Vec::new())
}

fn null_id() -> Arc<Value> {
    Arc::new(Value::Null)
}

/// Distinguishes an explicit `"result": null` from an absent `result` field.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// JSON-RPC 2.0 request.
///
/// Requests are only constructed through [`crate::rpc::parse_single`] and
/// [`crate::rpc::parse_value`] on the inbound path, which enforce version, method and id
/// admissibility. [`JsonRpcRequest::new`] is used for requests the proxy issues itself.
///
/// ```
/// use proxyd_core::types::JsonRpcRequest;
/// use serde_json::json;
///
/// let request = JsonRpcRequest::new("eth_blockNumber", json!([]), json!(1));
/// assert_eq!(request.method, "eth_blockNumber");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(default = "default_params")]
    pub params: Value,
    #[serde(default = "null_id")]
    pub id: Arc<Value>,
}

impl JsonRpcRequest {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value, id: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, method: method.into(), params, id: Arc::new(id) }
    }

    /// Returns the positional params, or `None` when params is not an array.
    #[must_use]
    pub fn params_array(&self) -> Option<&[Value]> {
        self.params.as_array().map(Vec::as_slice)
    }
}

/// JSON-RPC 2.0 response.
///
/// Exactly one of `result` and `error` is present on the wire. An explicit `"result": null`
/// deserializes to `Some(Value::Null)` and serializes back unchanged.
///
/// ```
/// use proxyd_core::types::JsonRpcResponse;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let response = JsonRpcResponse::success(json!("0x420"), Arc::new(json!(1)));
/// assert_eq!(
///     serde_json::to_value(&response).unwrap(),
///     json!({"jsonrpc": "2.0", "result": "0x420", "id": 1})
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: Cow<'static, str>,
    #[serde(default, deserialize_with = "deserialize_present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(default = "null_id")]
    pub id: Arc<Value>,
}

fn default_version() -> Cow<'static, str> {
    JSONRPC_VERSION_COW
}

impl JsonRpcResponse {
    #[must_use]
    pub fn success(result: Value, id: Arc<Value>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, result: Some(result), error: None, id }
    }

    #[must_use]
    pub fn error(code: i32, message: impl Into<String>, id: Arc<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
            id,
        }
    }

    /// Replaces the envelope id, used when serving a cached entry to a new client.
    #[must_use]
    pub fn with_id(mut self, id: Arc<Value>) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// True when the envelope carries `"result": null` or no result at all.
    #[must_use]
    pub fn has_null_result(&self) -> bool {
        matches!(self.result, None | Some(Value::Null))
    }

    /// A backend envelope is well-formed when it carries a result or an error.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.result.is_some() != self.error.is_some()
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}
