//! Deterministic response caching.
//!
//! ```text
//!              ┌──────────────┐
//!  request ──► │   RpcCache   │ ── hit ──► response (id rewritten)
//!              └──────┬───────┘
//!                     │ miss
//!                     ▼
//!              backend group ──► put_rpc ──► store (if confirmed)
//!
//!  LvcPoller ──(1s)──► eth_blockNumber / eth_gasPrice ──► LastValueCache
//! ```
//!
//! - [`handlers`]: per-method cacheability, keys and TTLs
//! - [`lvc`]: last-value cache holding the chain head and gas price
//! - [`rpc_cache`]: the lookup/store facade used by the proxy engine
//!
//! Entries are only written for blocks more than
//! [`NUM_BLOCK_CONFIRMATIONS`](handlers::NUM_BLOCK_CONFIRMATIONS) behind the head, so cached
//! results are not invalidated on reorgs.

pub mod handlers;
pub mod lvc;
pub mod rpc_cache;

pub use handlers::{HandlerRegistry, MethodHandler, DEFAULT_CACHE_TTL, NUM_BLOCK_CONFIRMATIONS};
pub use lvc::{LastValueCache, LvcPoller, BLOCK_NUMBER_KEY, GAS_PRICE_KEY};
pub use rpc_cache::RpcCache;
