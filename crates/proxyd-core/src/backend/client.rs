use super::errors::{sanitize_network_error, BackendError};
use crate::{
    metrics::MetricsCollector,
    proxy::context::RequestContext,
    ratelimit::RateLimiter,
    types::{JsonRpcRequest, JsonRpcResponse},
};
use ahash::AHashMap;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Client, ClientBuilder,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::header::AUTHORIZATION},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

/// Upper bound of [`calc_backoff`].
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

const USER_AGENT: &str = concat!("proxyd/", env!("CARGO_PKG_VERSION"));

/// Method label recorded for upstream batch calls.
const BATCH_METHOD_LABEL: &str = "<batch>";

/// WebSocket stream to a backend.
pub type BackendWsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Exponential backoff with jitter: `2^attempt` seconds plus up to 250ms, capped at
/// [`MAX_BACKOFF`].
#[must_use]
pub fn calc_backoff(attempt: u32) -> Duration {
    let base_ms = 1u64.checked_shl(attempt).map_or(u64::MAX, |factor| factor.saturating_mul(1000));
    let jitter_ms = rand::rng().random_range(0..250);
    Duration::from_millis(base_ms.saturating_add(jitter_ms)).min(MAX_BACKOFF)
}

/// Keeps only the first address of a comma-separated `X-Forwarded-For` value.
#[must_use]
pub fn strip_xff(xff: &str) -> &str {
    xff.split(',').next().unwrap_or_default().trim()
}

/// Static settings of one backend, resolved from configuration.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub name: Arc<str>,
    pub rpc_url: String,
    pub ws_url: String,
    pub username: String,
    pub password: String,
    pub headers: Vec<(String, String)>,
    pub response_timeout: Duration,
    /// Zero disables the limit.
    pub max_response_size: u64,
    pub max_retries: u32,
    pub out_of_service: Duration,
    /// Zero disables the limit.
    pub max_rps: u64,
    /// Zero disables the limit.
    pub max_ws_conns: u64,
    pub strip_trailing_xff: bool,
}

impl BackendSettings {
    /// Settings with the default timeouts and limits, used by tests and the LVC poller.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, rpc_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rpc_url: rpc_url.into(),
            ws_url: String::new(),
            username: String::new(),
            password: String::new(),
            headers: Vec::new(),
            response_timeout: Duration::from_secs(5),
            max_response_size: 5 * 1024 * 1024,
            max_retries: 0,
            out_of_service: Duration::from_secs(600),
            max_rps: 0,
            max_ws_conns: 0,
            strip_trailing_xff: false,
        }
    }
}

/// A single upstream Ethereum node.
///
/// Forwards requests with bounded retries. When every attempt of a request fails with a
/// transient error, the backend is taken out of service for `out_of_service` and reports
/// [`BackendError::Offline`] until then.
pub struct Backend {
    settings: BackendSettings,
    client: Client,
    headers: HeaderMap,
    limiter: Arc<dyn RateLimiter>,
    metrics: MetricsCollector,
    last_permanent_error: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("name", &self.settings.name).finish_non_exhaustive()
    }
}

impl Backend {
    /// # Errors
    ///
    /// Returns [`BackendError::ConnectionFailed`] if the HTTP client cannot be built.
    pub fn new(
        settings: BackendSettings,
        limiter: Arc<dyn RateLimiter>,
        metrics: MetricsCollector,
    ) -> Result<Self, BackendError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(100)
            .connect_timeout(Duration::from_secs(5))
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(USER_AGENT)
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                error!(backend = %settings.name, error = %e, "failed to build http client");
                BackendError::ConnectionFailed(format!("HTTP client build failed: {e}"))
            })?;

        let mut headers = HeaderMap::new();
        for (name, value) in &settings.headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(backend = %settings.name, header = %name, "ignoring invalid header"),
            }
        }

        Ok(Self {
            settings,
            client,
            headers,
            limiter,
            metrics,
            last_permanent_error: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    #[must_use]
    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    /// A backend is online unless it was quarantined within `out_of_service`.
    ///
    /// Store failures report the backend as online.
    pub async fn is_online(&self) -> bool {
        if let Some(at) = *self.last_permanent_error.lock() {
            if at.elapsed() < self.settings.out_of_service {
                return false;
            }
        }

        match self.limiter.is_backend_online(&self.settings.name).await {
            Ok(online) => online,
            Err(e) => {
                warn!(backend = %self.settings.name, error = %e, "failed to read backend status, assuming online");
                true
            }
        }
    }

    /// Counts one request against `max_rps`. Store failures admit the request.
    pub async fn is_over_capacity(&self) -> bool {
        if self.settings.max_rps == 0 {
            return false;
        }

        match self.limiter.inc_backend_rps(&self.settings.name).await {
            Ok(count) => count > self.settings.max_rps,
            Err(e) => {
                warn!(backend = %self.settings.name, error = %e, "failed to increment rps, admitting request");
                false
            }
        }
    }

    /// Forwards `req` with up to `max_retries` additional attempts on transient failures.
    ///
    /// # Errors
    ///
    /// - [`BackendError::Offline`] when the backend is quarantined
    /// - [`BackendError::OverCapacity`] when `max_rps` is exceeded
    /// - [`BackendError::BadResponse`] and [`BackendError::ResponseTooLarge`] immediately
    /// - [`BackendError::Permanent`] once all attempts failed; the backend is then quarantined
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        req: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, BackendError> {
        let mut responses = self.forward_payload(ctx, Payload::Single(req)).await?;
        responses.pop().ok_or(BackendError::BadResponse)
    }

    /// Forwards `reqs` as one JSON-RPC batch and returns the responses in request order.
    ///
    /// A single request is sent unwrapped, as a plain envelope. Request ids must be unique
    /// within `reqs`. Retries and quarantine follow [`Backend::forward`].
    ///
    /// # Errors
    ///
    /// As [`Backend::forward`], plus [`BackendError::UnexpectedJsonRpc`] when the backend answers
    /// with a single envelope or the wrong number of responses.
    pub async fn forward_batch(
        &self,
        ctx: &RequestContext,
        reqs: &[JsonRpcRequest],
    ) -> Result<Vec<JsonRpcResponse>, BackendError> {
        match reqs {
            [] => Ok(Vec::new()),
            [req] => self.forward_payload(ctx, Payload::Single(req)).await,
            _ => self.forward_payload(ctx, Payload::Batch(reqs)).await,
        }
    }

    async fn forward_payload(
        &self,
        ctx: &RequestContext,
        payload: Payload<'_>,
    ) -> Result<Vec<JsonRpcResponse>, BackendError> {
        if !self.is_online().await {
            return Err(BackendError::Offline);
        }
        if self.is_over_capacity().await {
            return Err(BackendError::OverCapacity);
        }

        let body = payload
            .encode()
            .map(Bytes::from)
            .map_err(|e| BackendError::ConnectionFailed(format!("request encoding failed: {e}")))?;

        let mut last_error = BackendError::Timeout;
        for attempt in 0..=self.settings.max_retries {
            let start = Instant::now();
            let result = self.do_forward(ctx, body.clone(), payload).await;
            self.metrics.record_backend_request(
                &self.settings.name,
                payload.method_label(),
                ctx.source.as_str(),
                start.elapsed(),
            );

            match result {
                Ok(responses) => {
                    for err in responses.iter().filter_map(|r| r.error.as_ref()) {
                        self.metrics.record_rpc_error(&self.settings.name, err.code);
                    }
                    return Ok(responses);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        backend = %self.settings.name,
                        req_id = %ctx.request_id,
                        attempt,
                        error = %e,
                        "backend request failed"
                    );
                    last_error = e;
                    if attempt < self.settings.max_retries {
                        tokio::time::sleep(calc_backoff(attempt)).await;
                    }
                }
                Err(BackendError::UnexpectedJsonRpc) => {
                    debug!(
                        backend = %self.settings.name,
                        req_id = %ctx.request_id,
                        "backend returned an unexpected batch response"
                    );
                    return Err(BackendError::UnexpectedJsonRpc);
                }
                Err(e) => return Err(e),
            }
        }

        self.quarantine().await;
        Err(BackendError::Permanent(Box::new(last_error)))
    }

    pub(crate) async fn quarantine(&self) {
        *self.last_permanent_error.lock() = Some(Instant::now());
        self.metrics.record_backend_permanent_error(&self.settings.name);
        error!(
            backend = %self.settings.name,
            out_of_service_secs = self.settings.out_of_service.as_secs(),
            "backend exhausted retries, taking out of service"
        );

        if let Err(e) =
            self.limiter.set_backend_offline(&self.settings.name, self.settings.out_of_service).await
        {
            warn!(backend = %self.settings.name, error = %e, "failed to share backend offline status");
        }
    }

    async fn do_forward(
        &self,
        ctx: &RequestContext,
        body: Bytes,
        payload: Payload<'_>,
    ) -> Result<Vec<JsonRpcResponse>, BackendError> {
        let mut request = self
            .client
            .post(&self.settings.rpc_url)
            .header(CONTENT_TYPE, "application/json")
            .headers(self.headers.clone())
            .timeout(self.settings.response_timeout)
            .body(body);

        if !self.settings.password.is_empty() {
            request = request.basic_auth(&self.settings.username, Some(&self.settings.password));
        }
        if let Some(xff) = &ctx.x_forwarded_for {
            let xff = if self.settings.strip_trailing_xff { strip_xff(xff) } else { xff.as_str() };
            request = request.header("X-Forwarded-For", xff);
        }

        let mut response = request.send().await?;

        let status = response.status().as_u16();
        if status != 200 {
            debug!(backend = %self.settings.name, status, "backend returned non-200 status");
            return Err(BackendError::HttpStatus(status));
        }

        let limit = self.settings.max_response_size;
        if limit > 0 && response.content_length().is_some_and(|len| len > limit) {
            return Err(BackendError::ResponseTooLarge);
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::ConnectionFailed(sanitize_network_error(&e))
            }
        })? {
            if limit > 0 && (buf.len() + chunk.len()) as u64 > limit {
                return Err(BackendError::ResponseTooLarge);
            }
            buf.extend_from_slice(&chunk);
        }

        match payload {
            Payload::Single(_) => {
                let parsed: JsonRpcResponse =
                    serde_json::from_slice(&buf).map_err(|_| BackendError::BadResponse)?;
                if !parsed.is_well_formed() {
                    return Err(BackendError::BadResponse);
                }
                Ok(vec![parsed])
            }
            Payload::Batch(reqs) => decode_batch(reqs, &buf),
        }
    }

    /// Opens a WebSocket to the backend's `ws_url`, with basic auth when a password is set.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::WsDial`] when the URL is invalid or the handshake fails.
    pub async fn dial_ws(&self) -> Result<BackendWsStream, BackendError> {
        let mut request = self
            .settings
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| BackendError::WsDial(e.to_string()))?;

        if !self.settings.password.is_empty() {
            let credentials = base64_basic(&self.settings.username, &self.settings.password);
            let value = format!("Basic {credentials}")
                .parse()
                .map_err(|_| BackendError::WsDial("invalid credentials".into()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request).await.map_err(|e| {
            BackendError::WsDial(match e {
                tokio_tungstenite::tungstenite::Error::Http(response) => {
                    format!("handshake rejected with status {}", response.status())
                }
                _ => "handshake failed".to_string(),
            })
        })?;
        Ok(stream)
    }

    pub(crate) fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    pub(crate) fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }
}

/// Body of one upstream call.
#[derive(Clone, Copy)]
pub(crate) enum Payload<'a> {
    Single(&'a JsonRpcRequest),
    Batch(&'a [JsonRpcRequest]),
}

impl Payload<'_> {
    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Self::Single(req) => serde_json::to_vec(req),
            Self::Batch(reqs) => serde_json::to_vec(reqs),
        }
    }

    pub(crate) fn method_label(&self) -> &str {
        match self {
            Self::Single(req) => &req.method,
            Self::Batch(_) => BATCH_METHOD_LABEL,
        }
    }
}

/// Decodes a batch response and orders it like `reqs`.
///
/// A lone envelope, which some providers send when one element of the batch fails, and a
/// response count that differs from the request count are both [`BackendError::UnexpectedJsonRpc`].
fn decode_batch(reqs: &[JsonRpcRequest], body: &[u8]) -> Result<Vec<JsonRpcResponse>, BackendError> {
    let mut responses: Vec<JsonRpcResponse> = match serde_json::from_slice(body) {
        Ok(responses) => responses,
        Err(_) if serde_json::from_slice::<JsonRpcResponse>(body).is_ok() => {
            return Err(BackendError::UnexpectedJsonRpc);
        }
        Err(_) => return Err(BackendError::BadResponse),
    };
    if responses.len() != reqs.len() {
        return Err(BackendError::UnexpectedJsonRpc);
    }
    if !responses.iter().all(JsonRpcResponse::is_well_formed) {
        return Err(BackendError::BadResponse);
    }

    let position: AHashMap<String, usize> =
        reqs.iter().enumerate().map(|(i, req)| (req.id.to_string(), i)).collect();
    responses.sort_by_key(|res| position.get(&res.id.to_string()).copied().unwrap_or(usize::MAX));
    Ok(responses)
}

/// Base64 encoding of `username:password` for the `Authorization: Basic` header.
fn base64_basic(username: &str, password: &str) -> String {
    STANDARD.encode(format!("{username}:{password}"))
}
