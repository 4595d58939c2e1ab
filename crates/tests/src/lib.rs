//! Integration tests for proxyd.
//!
//! - `scenario_tests`: end-to-end request scenarios through the HTTP router
//! - `failover_tests`: backend retries, quarantine, failover and capacity limits
//! - `websocket_tests`: the WebSocket listener relaying to a mock node
//! - `mock_infrastructure`: reusable mocks (HTTP node, WebSocket node, proxy harness)
//!
//! ```bash
//! cargo test --package tests
//! ```

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod scenario_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod failover_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod websocket_tests;

/// Mock infrastructure for testing
pub mod mock_infrastructure;
