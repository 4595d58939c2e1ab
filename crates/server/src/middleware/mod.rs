//! HTTP middleware and request helpers for the RPC server.

pub mod auth;
pub mod correlation_id;
pub mod instrumentation;

pub use auth::{path_token, AuthTable};
pub use correlation_id::{create_request_id_layers, request_id, HexRequestIdGenerator, X_REQUEST_ID};
pub use instrumentation::record_http_metrics;
