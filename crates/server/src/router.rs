//! HTTP routes: JSON-RPC over `POST /` and `POST /{authorization}`, health, and the metrics
//! exposition served on the separate metrics listener.

use crate::middleware::{create_request_id_layers, record_http_metrics, request_id, AuthTable};
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures_util::StreamExt;
use proxyd_core::{
    metrics::MetricsCollector,
    proxy::{ProxyEngine, ProxyError, RequestContext, RequestSource, RpcReply},
    runtime::ProxydRuntime,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::CompressionLayer;
use tracing::{error, info, warn};

/// `HIT` when any envelope in the reply came from the cache, else `MISS`.
pub static X_PROXYD_CACHE_STATUS: HeaderName = HeaderName::from_static("x-proxyd-cache-status");

/// `group/backend` of every backend that answered, when `server.enable_served_by_header` is set.
pub static X_SERVED_BY: HeaderName = HeaderName::from_static("x-served-by");

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Shared state of the RPC routes.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProxyEngine>,
    pub auth: Arc<AuthTable>,
    pub max_body_size: usize,
    /// Upper bound on handling one HTTP request, body read included.
    pub rpc_timeout: Duration,
    /// Header the client IP is read from, `X-Forwarded-For` unless overridden.
    pub client_ip_header: HeaderName,
    pub served_by_header: bool,
    /// Request bodies are logged, truncated to this many bytes, when set.
    pub request_log_limit: Option<usize>,
}

impl AppState {
    #[must_use]
    pub fn new(engine: Arc<ProxyEngine>, auth: AuthTable, max_body_size: usize, rpc_timeout: Duration) -> Self {
        Self {
            engine,
            auth: Arc::new(auth),
            max_body_size,
            rpc_timeout,
            client_ip_header: X_FORWARDED_FOR.clone(),
            served_by_header: false,
            request_log_limit: None,
        }
    }

    #[must_use]
    pub fn from_runtime(runtime: &ProxydRuntime) -> Self {
        let config = runtime.config();
        let mut state = Self::new(
            Arc::clone(runtime.proxy_engine()),
            AuthTable::new(&config.authentication),
            config.server.max_body_size_bytes,
            config.rpc_timeout(),
        );
        match HeaderName::try_from(config.rate_limit_header()) {
            Ok(name) => state.client_ip_header = name,
            Err(e) => warn!(header = config.rate_limit_header(), error = %e, "invalid client ip header, using default"),
        }
        state.served_by_header = config.server.enable_served_by_header;
        state.request_log_limit = config.server.enable_request_log.then_some(config.server.max_request_body_log_len);
        state
    }
}

/// Builds the RPC router with request ids, HTTP metrics, compression and a concurrency cap.
pub fn create_router(state: AppState, max_concurrent_requests: usize) -> Router {
    let (set_request_id, propagate_request_id) = create_request_id_layers();
    let metrics = state.engine.metrics().clone();

    Router::new()
        .route("/healthz", get(handle_health))
        .route("/", post(handle_rpc))
        .route("/{authorization}", post(handle_rpc_with_token))
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(metrics, record_http_metrics))
        .layer(CompressionLayer::new())
        .layer(propagate_request_id)
        .layer(set_request_id)
        .layer(ConcurrencyLimitLayer::new(max_concurrent_requests))
}

/// Builds the router of the metrics listener: the Prometheus exposition at `/` and `/metrics`.
pub fn create_metrics_router(metrics: MetricsCollector) -> Router {
    Router::new()
        .route("/", get(handle_metrics))
        .route("/metrics", get(handle_metrics))
        .with_state(metrics)
}

pub async fn handle_rpc(State(state): State<AppState>, request: Request) -> Response {
    serve_rpc(&state, None, request).await
}

pub async fn handle_rpc_with_token(
    State(state): State<AppState>,
    Path(authorization): Path<String>,
    request: Request,
) -> Response {
    serve_rpc(&state, Some(&authorization), request).await
}

async fn serve_rpc(state: &AppState, token: Option<&str>, request: Request) -> Response {
    let auth = match state.auth.authorize(token) {
        Ok(auth) => auth,
        Err(status) => return status.into_response(),
    };

    let (parts, body) = request.into_parts();
    let ctx = RequestContext::new(RequestSource::Http)
        .with_request_id(request_id(&parts.headers))
        .with_auth(auth)
        .with_forwarded_for(client_address(&parts, &state.client_ip_header))
        .with_client_headers(
            header_str(&parts.headers, &header::ORIGIN),
            header_str(&parts.headers, &header::USER_AGENT),
        );

    if let Err(err) = state.engine.admit(&ctx).await {
        return rpc_response(err.http_status(), false, &RpcReply::Single(err.to_null_response()));
    }
    info!(
        req_id = %ctx.request_id,
        auth = ctx.auth.as_deref().unwrap_or_default(),
        remote_ip = ctx.remote_ip().unwrap_or_default(),
        origin = ctx.origin.as_deref().unwrap_or_default(),
        user_agent = ctx.user_agent.as_deref().unwrap_or_default(),
        "received rpc request"
    );

    match tokio::time::timeout(state.rpc_timeout, proxy_body(state, &ctx, body)).await {
        Ok(response) => response,
        Err(_) => {
            let err = ProxyError::GatewayTimeout;
            warn!(req_id = %ctx.request_id, timeout_secs = state.rpc_timeout.as_secs(), "rpc request timed out");
            state.engine.metrics().record_rpc_error("proxyd", err.code());
            rpc_response(err.http_status(), false, &RpcReply::Single(err.to_null_response()))
        }
    }
}

async fn proxy_body(state: &AppState, ctx: &RequestContext, body: Body) -> Response {
    let body = match read_body(body, state.max_body_size).await {
        Ok(body) => body,
        Err(err) => {
            warn!(req_id = %ctx.request_id, error = %err, "error reading request body");
            state.engine.metrics().record_rpc_error("proxyd", err.code());
            return rpc_response(err.http_status(), false, &RpcReply::Single(err.to_null_response()));
        }
    };

    if let Some(limit) = state.request_log_limit {
        info!(req_id = %ctx.request_id, body = %truncate_for_log(&body, limit), "raw rpc request");
    }

    let handled = state.engine.handle_body(ctx, &body).await;
    let mut response = rpc_response(handled.status, handled.cached, &handled.reply);
    if state.served_by_header && !handled.served_by.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&handled.served_by) {
            response.headers_mut().insert(X_SERVED_BY.clone(), value);
        }
    }
    response
}

/// Cuts `body` to at most `limit` bytes on a character boundary and marks the cut with `...`.
fn truncate_for_log(body: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= limit {
        return text.into_owned();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Reads the body up to `limit` bytes.
async fn read_body(body: Body, limit: usize) -> Result<Vec<u8>, ProxyError> {
    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            warn!(error = %e, "failed to read request body");
            ProxyError::Internal
        })?;
        if buf.len() + chunk.len() > limit {
            return Err(ProxyError::RequestBodyTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn header_str(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers.get(name).and_then(|value| value.to_str().ok()).filter(|value| !value.is_empty()).map(str::to_string)
}

/// The client IP header if present, else the peer address.
fn client_address(parts: &Parts, ip_header: &HeaderName) -> Option<String> {
    header_str(&parts.headers, ip_header).or_else(|| {
        parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| addr.ip().to_string())
    })
}

fn rpc_response(status: u16, cached: bool, reply: &RpcReply) -> Response {
    let cache_status = if cached { "HIT" } else { "MISS" };
    let body = match reply {
        RpcReply::Single(response) => serde_json::to_vec(response),
        RpcReply::Batch(responses) => serde_json::to_vec(responses),
    };

    match body {
        Ok(body) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                [(header::CONTENT_TYPE, "application/json"), (X_PROXYD_CACHE_STATUS.clone(), cache_status)],
                body,
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to encode rpc response");
            (StatusCode::INTERNAL_SERVER_ERROR, [(X_PROXYD_CACHE_STATUS.clone(), cache_status)]).into_response()
        }
    }
}

#[allow(clippy::unused_async)]
pub async fn handle_health() -> &'static str {
    "OK"
}

#[allow(clippy::unused_async)]
pub async fn handle_metrics(State(metrics): State<MetricsCollector>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics.get_prometheus_metrics(),
    )
}
