//! Request pipeline.
//!
//! ```text
//! HTTP request
//!     │
//!     ▼
//! ┌──────────────┐
//! │  base limit  │ ─── limited ──► -32016 (429)
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │  rpc codec   │ ─── invalid ──► error envelope (id: null)
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ MethodRouter │ ─── unmapped ──► -32601
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ method limits│ ─── limited ──► -32016 / -32017
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │   RpcCache   │ ─── hit ──► cached response, client id
//! └──────┬───────┘
//!        │ miss
//!        ▼
//! ┌──────────────┐
//! │ BackendGroup │ ──► first backend that answers
//! └──────┬───────┘
//!        ▼
//!   cache fill, response
//! ```
//!
//! Cache misses bound for the same backend group are forwarded together as upstream JSON
//! batches of at most `server.max_upstream_batch_size` calls. Calls that share an id go into
//! separate upstream batches. Replies keep the client's input order.

pub mod context;
pub mod engine;
pub mod errors;
pub mod limits;
pub mod method_router;

pub use context::{generate_request_id, RequestContext, RequestSource};
pub use engine::{HandledRequest, ProxyEngine, RpcReply, DEFAULT_MAX_UPSTREAM_BATCH_SIZE};
pub use errors::ProxyError;
pub use limits::RequestLimits;
pub use method_router::MethodRouter;
