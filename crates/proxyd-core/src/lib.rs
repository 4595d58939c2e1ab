//! # proxyd core
//!
//! JSON-RPC 2.0 reverse proxy for Ethereum execution nodes.
//!
//! - **[`rpc`]** and **[`types`]**: envelope parsing and validation
//! - **[`proxy`]**: method routing and the request pipeline
//! - **[`backend`]**: upstream nodes with retries, quarantine and failover, plus the WebSocket
//!   relay
//! - **[`cache`]**: deterministic response cache and the last-value cache
//! - **[`ratelimit`]**: per-backend request and connection limits plus client-facing limits,
//!   local or shared through Redis
//! - **[`store`]**: the key-value store the cache and limiter sit on
//! - **[`runtime`]**: assembles all of the above from an [`config::AppConfig`]
//!
//! ## Request Flow
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────┐
//! │ base limit  │ ─── Over limit ──► 429
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐
//! │  rpc codec  │ ─── Invalid ──► Error Response
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐
//! │ MethodRouter│ ─── Not whitelisted ──► -32601
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐
//! │method limits│ ─── Over limit ──► -32016 / -32017
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐
//! │  RpcCache   │ ─── Hit ──► Cached Response
//! └──────┬──────┘
//!        │ Miss
//!        ▼
//! ┌─────────────┐      ┌──────────────┐
//! │BackendGroup │ ───► │ RateLimiter  │
//! └──────┬──────┘      └──────────────┘
//!        ▼
//!   Backend HTTP ──► Cache Fill ──► Response
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod rpc;
pub mod runtime;
pub mod store;
pub mod types;
pub mod utils;
