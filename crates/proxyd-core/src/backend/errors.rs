use thiserror::Error;

/// Errors produced while forwarding a request to a backend or a backend group.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendError {
    /// Backend is quarantined after exhausting its retries.
    #[error("backend offline")]
    Offline,

    /// Backend RPS or WebSocket connection limit was exceeded.
    #[error("backend is over capacity")]
    OverCapacity,

    /// Request exceeded `backend.response_timeout_seconds`.
    #[error("request timeout")]
    Timeout,

    /// Transport-level failure talking to the backend.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Backend answered with a non-200 HTTP status.
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    /// Body was not a JSON-RPC response envelope.
    #[error("backend returned an invalid response")]
    BadResponse,

    /// Batch answer was a lone envelope or had the wrong number of responses.
    #[error("backend returned an unexpected JSON-RPC response")]
    UnexpectedJsonRpc,

    /// Body exceeded `backend.max_response_size_bytes`.
    #[error("backend response too large")]
    ResponseTooLarge,

    /// Retries were exhausted; the backend has been taken out of service.
    #[error("permanent error: {0}")]
    Permanent(Box<BackendError>),

    /// WebSocket dial to the backend failed.
    #[error("websocket dial failed: {0}")]
    WsDial(String),

    /// No backend in the group could serve the request.
    #[error("no backends available")]
    NoBackends,

    /// Reserved for consensus-aware routing.
    #[error("backends returned inconsistent responses")]
    Inconsistent,
}

impl BackendError {
    /// Returns `true` if another attempt against the same backend may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionFailed(_) | Self::HttpStatus(_))
    }

    /// Returns a static string representation for log fields and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::OverCapacity => "over_capacity",
            Self::Timeout => "timeout",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::HttpStatus(_) => "http_status",
            Self::BadResponse => "bad_response",
            Self::UnexpectedJsonRpc => "unexpected_jsonrpc",
            Self::ResponseTooLarge => "response_too_large",
            Self::Permanent(_) => "permanent",
            Self::WsDial(_) => "ws_dial",
            Self::NoBackends => "no_backends",
            Self::Inconsistent => "inconsistent",
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::ConnectionFailed(sanitize_network_error(&err))
        }
    }
}

/// Classifies transport errors without their message text, which may embed the backend URL
/// and its credentials.
#[must_use]
pub fn sanitize_network_error(error: &reqwest::Error) -> String {
    let reason = if error.is_connect() {
        "connection refused or unreachable"
    } else if error.is_timeout() {
        "connection timed out"
    } else if error.is_request() {
        "request failed"
    } else if error.is_body() {
        "response body error"
    } else if error.is_decode() {
        "response decode error"
    } else {
        "network error"
    };
    reason.to_string()
}
