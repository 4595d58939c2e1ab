//! Upstream Ethereum nodes.
//!
//! - [`Backend`]: one node, with retries, quarantine and response limits
//! - [`BackendGroup`]: ordered failover over several backends
//! - [`WsProxier`]: client to backend WebSocket relay

pub mod client;
pub mod errors;
pub mod group;
pub mod websocket;

pub use client::{calc_backoff, strip_xff, Backend, BackendSettings, BackendWsStream, MAX_BACKOFF};
pub use errors::BackendError;
pub use group::{BackendGroup, BackendWsConn, WsSlot};
pub use websocket::{reject_client, WsProxier, WsWhitelist};
