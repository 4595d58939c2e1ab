//! Reusable mocks for driving proxyd without real Ethereum nodes.
//!
//! - `RpcMockBuilder`: mockito-backed HTTP node with per-method call counting
//! - `MockWebSocketServer`: WebSocket node answering JSON-RPC frames
//! - `TestProxy`: the full runtime behind the HTTP router, driven in-process
//!
//! ```ignore
//! use tests::mock_infrastructure::{proxy_config, RpcMockBuilder, TestProxy};
//!
//! let mut node = RpcMockBuilder::new().await;
//! node.mock_result("eth_chainId", json!("0x1"), 1).await;
//! let proxy = TestProxy::start(&proxy_config(&[("a", &node.url(), "ws://127.0.0.1:1")], &["eth_chainId"], "")).await;
//! ```

pub mod rpc_mock;
pub mod test_helpers;
pub mod websocket_mock;

pub use rpc_mock::{block, RpcMockBuilder};
pub use test_helpers::{proxy_config, ProxyResponse, TestProxy};
pub use websocket_mock::{MockWebSocketServer, SUBSCRIPTION_ID};
