//! Request id middleware.
//!
//! Every HTTP request carries a 10-character hex request id in `X-Request-ID`. An id sent by
//! the client is kept; otherwise one is generated. The id is copied onto the response and
//! into the [`RequestContext`](proxyd_core::proxy::RequestContext) used for logging.

use axum::http::{header::HeaderValue, HeaderMap, HeaderName, Request};
use proxyd_core::proxy::generate_request_id;
use std::sync::Arc;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};

/// The header name for request ids.
pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Generates random hex request ids for tower-http's request id layers.
#[derive(Clone, Copy, Default)]
pub struct HexRequestIdGenerator;

impl MakeRequestId for HexRequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = generate_request_id();
        Some(RequestId::new(HeaderValue::from_str(&id).ok()?))
    }
}

/// Creates the request id layer pair.
///
/// The set layer must run before the propagate layer, so apply the propagate layer first:
///
/// ```ignore
/// let (set_layer, propagate_layer) = create_request_id_layers();
/// let app = Router::new()
///     .route("/", post(handler))
///     .layer(propagate_layer)
///     .layer(set_layer);
/// ```
#[must_use]
pub fn create_request_id_layers(
) -> (SetRequestIdLayer<HexRequestIdGenerator>, PropagateRequestIdLayer) {
    (
        SetRequestIdLayer::new(X_REQUEST_ID.clone(), HexRequestIdGenerator),
        PropagateRequestIdLayer::new(X_REQUEST_ID.clone()),
    )
}

/// Reads the request id set by [`create_request_id_layers`], generating one when the layers
/// are not installed.
#[must_use]
pub fn request_id(headers: &HeaderMap) -> Arc<str> {
    headers
        .get(&X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|id| !id.is_empty())
        .map_or_else(|| Arc::from(generate_request_id()), Arc::from)
}
