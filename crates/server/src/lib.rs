//! HTTP and WebSocket front-end of proxyd.
//!
//! [`router`] serves JSON-RPC over HTTP, [`ws`] accepts WebSocket clients, and [`middleware`]
//! holds the pieces both share: path-token authentication, request ids and HTTP metrics.

pub mod middleware;
pub mod router;
pub mod ws;

pub use router::{create_metrics_router, create_router, AppState};
pub use ws::WsServer;
