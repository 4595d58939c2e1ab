//! HTTP request accounting.

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use proxyd_core::metrics::MetricsCollector;
use std::time::Instant;

/// Counts every HTTP request and records its latency under `proxyd_http_request_duration_seconds`.
pub async fn record_http_metrics(
    State(metrics): State<MetricsCollector>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let response = next.run(request).await;
    metrics.record_http_request(start.elapsed());
    response
}
