//! Runtime initialization and lifecycle management.
//!
//! Assembles the store, rate limiter, backends, groups, cache and proxy engine from an
//! [`AppConfig`](crate::config::AppConfig), and owns the background tasks that keep them
//! running.
//!
//! ```no_run
//! use proxyd_core::{config::AppConfig, runtime::ProxydRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load(None)?;
//!
//!     let runtime = ProxydRuntime::builder().with_config(config).enable_lvc_poller().build().await?;
//!
//!     let engine = runtime.proxy_engine();
//!     // ... set up HTTP routes ...
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod components;
pub mod lifecycle;

pub use builder::{ProxydRuntimeBuilder, RuntimeError};
pub use components::{LimiterHandle, ProxydComponents, WsSettings};
pub use lifecycle::ProxydRuntime;
