//! In-process proxy harness.
//!
//! [`TestProxy`] builds a full runtime from a TOML configuration and drives the HTTP router with
//! `tower::ServiceExt::oneshot`, so scenarios run without binding the RPC port.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use proxyd_core::{cache::BLOCK_NUMBER_KEY, config::AppConfig, runtime::ProxydRuntime};
use serde_json::Value;
use server::{create_router, AppState};
use std::fmt::Write;
use tower::ServiceExt;

/// Response of one request through [`TestProxy`].
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    /// Value of `X-Proxyd-Cache-Status`.
    pub cache_status: String,
    /// Value of `X-Served-By`, when the header is enabled.
    pub served_by: Option<String>,
    pub body: Value,
}

/// Builds a configuration with one group named `main` containing `backends` in order, and every
/// method in `methods` mapped to it. `extra` is appended verbatim.
#[must_use]
pub fn proxy_config(backends: &[(&str, &str, &str)], methods: &[&str], extra: &str) -> String {
    let mut toml = String::from("[backend]\nbackend_retries = 0\nout_of_service_seconds = 600\n\n");
    for (name, rpc_url, ws_url) in backends {
        let _ = writeln!(toml, "[backends.{name}]\nrpc_url = \"{rpc_url}\"\nws_url = \"{ws_url}\"\n");
    }

    let names: Vec<String> = backends.iter().map(|(name, _, _)| format!("\"{name}\"")).collect();
    let _ = writeln!(toml, "[backend_groups.main]\nbackends = [{}]\n", names.join(", "));

    toml.push_str("[rpc_method_mappings]\n");
    for method in methods {
        let _ = writeln!(toml, "{method} = \"main\"");
    }
    toml.push('\n');
    toml.push_str(extra);
    toml
}

/// A proxy runtime plus its HTTP router.
pub struct TestProxy {
    runtime: ProxydRuntime,
    app: Router,
}

impl TestProxy {
    /// Builds the runtime from `config`. The LVC poller stays off so tests control the head.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    #[allow(clippy::expect_used)]
    pub async fn start(config: &str) -> Self {
        Self::start_with_config(AppConfig::from_toml(config).expect("valid test configuration")).await
    }

    /// Builds the runtime from an already parsed configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    #[allow(clippy::expect_used)]
    pub async fn start_with_config(config: AppConfig) -> Self {
        let runtime = ProxydRuntime::builder().with_config(config).build().await.expect("runtime builds");
        let app = create_router(AppState::from_runtime(&runtime), 64);
        Self { runtime, app }
    }

    #[must_use]
    pub fn runtime(&self) -> &ProxydRuntime {
        &self.runtime
    }

    /// Posts `body` to `path`.
    ///
    /// # Panics
    ///
    /// Panics if the router fails or returns a non-JSON body for a non-empty response.
    pub async fn post(&self, path: &str, body: &str) -> ProxyResponse {
        self.post_with_headers(path, body, &[]).await
    }

    /// Posts `body` to `path` with extra request headers.
    ///
    /// # Panics
    ///
    /// Panics if the router fails or returns a non-JSON body for a non-empty response.
    #[allow(clippy::unwrap_used)]
    pub async fn post_with_headers(&self, path: &str, body: &str, headers: &[(&str, &str)]) -> ProxyResponse {
        let mut request = Request::builder().method("POST").uri(path).header("content-type", "application/json");
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let request = request.body(Body::from(body.to_string())).unwrap();

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let cache_status = response
            .headers()
            .get("x-proxyd-cache-status")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let served_by =
            response.headers().get("x-served-by").and_then(|v| v.to_str().ok()).map(str::to_string);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };

        ProxyResponse { status, cache_status, served_by, body }
    }

    /// Sets the head block number in the last-value cache.
    ///
    /// # Panics
    ///
    /// Panics if the cache is disabled.
    #[allow(clippy::unwrap_used)]
    pub async fn set_head(&self, block_number: u64) {
        let cache = self.runtime.components().rpc_cache().unwrap();
        cache.lvc().put(BLOCK_NUMBER_KEY, &format!("0x{block_number:x}")).await.unwrap();
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await;
    }
}
