use crate::{backend::errors::BackendError, types::JsonRpcResponse};
use serde_json::Value;
use std::sync::Arc;

/// JSON-RPC error codes emitted by the proxy itself.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_WHITELISTED: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const LIMIT_EXCEEDED: i32 = -32005;
    pub const OVER_RATE_LIMIT: i32 = -32016;
    pub const OVER_SENDER_RATE_LIMIT: i32 = -32017;
}

/// Errors the proxy reports to clients as JSON-RPC error envelopes.
///
/// Every variant maps to a fixed `(code, message, http status)` triple. A single request
/// that fails is answered with the variant's HTTP status; inside a batch the error becomes
/// one element of a `200 OK` array.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// Body is not valid JSON, or a batch element is not an object.
    #[error("parse error")]
    Parse,

    /// Envelope is JSON but violates JSON-RPC 2.0.
    #[error("{0}")]
    InvalidRequest(String),

    /// Params are malformed for a method the proxy inspects itself.
    #[error("{0}")]
    InvalidParams(String),

    /// Method has no entry in the method mapping table.
    #[error("rpc method is not whitelisted")]
    MethodNotWhitelisted,

    /// Batch exceeds the configured maximum size.
    #[error("too many RPC calls in batch request")]
    TooManyBatchRequests,

    /// Request body is larger than `server.max_body_size_bytes`.
    #[error("request body too large")]
    RequestBodyTooLarge,

    /// Unexpected failure inside the proxy.
    #[error("internal error")]
    Internal,

    /// Every backend in the group is quarantined.
    #[error("backend offline")]
    BackendOffline,

    /// No backend in the group could serve the request.
    #[error("no backends available for method")]
    NoBackends,

    /// Backend RPS or connection limit was exceeded.
    #[error("backend is over capacity")]
    BackendOverCapacity,

    /// Backend returned something that is not a JSON-RPC envelope.
    #[error("backend returned an invalid response")]
    BackendBadResponse,

    /// Backend response exceeded `backend.max_response_size_bytes`.
    #[error("backend response too large")]
    BackendResponseTooLarge,

    /// Request did not finish within `server.rpc_timeout_seconds`.
    #[error("gateway timeout")]
    GatewayTimeout,

    /// Reserved for consensus-aware routing.
    #[error("backends returned inconsistent responses")]
    BackendsInconsistent,

    /// Client exceeded the base rate or a per-method limit.
    #[error("over rate limit")]
    OverRateLimit,

    /// Sender and nonce of a raw transaction exceeded the sender limit.
    #[error("sender is over rate limit")]
    OverSenderRateLimit,

    /// Raw transaction is signed for a chain id outside the allowed list.
    #[error("invalid sender")]
    InvalidSender,
}

impl ProxyError {
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse => codes::PARSE_ERROR,
            Self::InvalidRequest(_) | Self::RequestBodyTooLarge => codes::INVALID_REQUEST,
            Self::MethodNotWhitelisted => codes::METHOD_NOT_WHITELISTED,
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::TooManyBatchRequests => codes::LIMIT_EXCEEDED,
            Self::OverRateLimit => codes::OVER_RATE_LIMIT,
            Self::OverSenderRateLimit => codes::OVER_SENDER_RATE_LIMIT,
            Self::InvalidSender |
            Self::Internal |
            Self::BackendOffline |
            Self::NoBackends |
            Self::BackendOverCapacity |
            Self::BackendBadResponse |
            Self::BackendResponseTooLarge |
            Self::GatewayTimeout |
            Self::BackendsInconsistent => codes::INTERNAL_ERROR,
        }
    }

    /// HTTP status used when this error answers a non-batch request.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Parse |
            Self::InvalidRequest(_) |
            Self::InvalidParams(_) |
            Self::InvalidSender |
            Self::TooManyBatchRequests => 400,
            Self::MethodNotWhitelisted => 403,
            Self::RequestBodyTooLarge => 413,
            Self::BackendOverCapacity | Self::OverRateLimit | Self::OverSenderRateLimit => 429,
            Self::BackendOffline | Self::NoBackends => 503,
            Self::GatewayTimeout => 504,
            Self::Internal |
            Self::BackendBadResponse |
            Self::BackendResponseTooLarge |
            Self::BackendsInconsistent => 500,
        }
    }

    /// Builds the error envelope echoing `id`.
    #[must_use]
    pub fn to_response(&self, id: Arc<Value>) -> JsonRpcResponse {
        JsonRpcResponse::error(self.code(), self.to_string(), id)
    }

    /// Builds the error envelope for envelope-level failures, where no id is known.
    #[must_use]
    pub fn to_null_response(&self) -> JsonRpcResponse {
        self.to_response(Arc::new(Value::Null))
    }
}

impl From<BackendError> for ProxyError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Offline => Self::BackendOffline,
            BackendError::OverCapacity => Self::BackendOverCapacity,
            BackendError::BadResponse => Self::BackendBadResponse,
            BackendError::ResponseTooLarge => Self::BackendResponseTooLarge,
            BackendError::NoBackends => Self::NoBackends,
            BackendError::Inconsistent => Self::BackendsInconsistent,
            BackendError::Permanent(inner) => Self::from(*inner),
            BackendError::Timeout |
            BackendError::UnexpectedJsonRpc |
            BackendError::ConnectionFailed(_) |
            BackendError::HttpStatus(_) |
            BackendError::WsDial(_) => Self::Internal,
        }
    }
}
