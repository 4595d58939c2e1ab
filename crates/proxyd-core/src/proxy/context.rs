use crate::backend::strip_xff;
use rand::Rng;
use std::sync::Arc;

/// Length of the hex request id propagated through logs and the `X-Request-ID` header.
pub const REQUEST_ID_LEN: usize = 10;

/// Entry point a request arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSource {
    Http,
    Ws,
    /// Requests issued by the proxy itself, such as LVC polling.
    Internal,
}

impl RequestSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Ws => "ws",
            Self::Internal => "internal",
        }
    }
}

/// Per-request metadata threaded from the listener down to the backend client.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Arc<str>,
    /// Authorization principal resolved from the path token, if auth is enabled.
    pub auth: Option<Arc<str>>,
    /// Client address forwarded to backends in `X-Forwarded-For`.
    pub x_forwarded_for: Option<String>,
    /// `Origin` and `User-Agent` request headers, matched against rate limit exemptions.
    pub origin: Option<String>,
    pub user_agent: Option<String>,
    pub source: RequestSource,
}

impl RequestContext {
    #[must_use]
    pub fn new(source: RequestSource) -> Self {
        Self {
            request_id: generate_request_id().into(),
            auth: None,
            x_forwarded_for: None,
            origin: None,
            user_agent: None,
            source,
        }
    }

    #[must_use]
    pub fn internal() -> Self {
        Self::new(RequestSource::Internal)
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<Arc<str>>) -> Self {
        self.request_id = request_id.into();
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: Option<Arc<str>>) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_forwarded_for(mut self, xff: Option<String>) -> Self {
        self.x_forwarded_for = xff;
        self
    }

    #[must_use]
    pub fn with_client_headers(mut self, origin: Option<String>, user_agent: Option<String>) -> Self {
        self.origin = origin;
        self.user_agent = user_agent;
        self
    }

    /// First address of `X-Forwarded-For`, the key front-end rate limits are counted under.
    #[must_use]
    pub fn remote_ip(&self) -> Option<&str> {
        self.x_forwarded_for.as_deref().map(strip_xff).filter(|ip| !ip.is_empty())
    }
}

/// Generates a random lowercase hex id of [`REQUEST_ID_LEN`] characters.
#[must_use]
pub fn generate_request_id() -> String {
    let bytes: [u8; REQUEST_ID_LEN / 2] = rand::rng().random();
    hex::encode(bytes)
}
