//! # Metrics
//!
//! Prometheus metrics for the proxy, recorded through the `metrics` facade and rendered by a
//! process-wide `metrics-exporter-prometheus` recorder.
//!
//! Every metric name carries the `proxyd_` prefix. Recording is lock-free: counters and
//! histograms are atomics behind the global recorder, so the collector itself holds no state
//! beyond the render handle.
//!
//! ## String Interning
//!
//! Backend names are interned to avoid per-request allocations. The set of backend names is
//! fixed by configuration, so the leak is bounded. Method names come from clients and are only
//! borrowed for the well-known Ethereum methods.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::{
    borrow::Cow,
    sync::OnceLock,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

static BACKEND_NAME_POOL: OnceLock<dashmap::DashMap<String, &'static str>> = OnceLock::new();

#[inline]
fn backend_to_static(backend: &str) -> Cow<'static, str> {
    let pool = BACKEND_NAME_POOL.get_or_init(dashmap::DashMap::new);

    if let Some(interned) = pool.get(backend) {
        return Cow::Borrowed(*interned);
    }

    let owned = backend.to_string();
    let leaked: &'static str = Box::leak(owned.clone().into_boxed_str());
    pool.insert(owned, leaked);
    Cow::Borrowed(leaked)
}

#[inline]
fn method_to_static(method: &str) -> Cow<'static, str> {
    match method {
        "net_version" => Cow::Borrowed("net_version"),
        "eth_chainId" => Cow::Borrowed("eth_chainId"),
        "eth_blockNumber" => Cow::Borrowed("eth_blockNumber"),
        "eth_gasPrice" => Cow::Borrowed("eth_gasPrice"),
        "eth_call" => Cow::Borrowed("eth_call"),
        "eth_getBalance" => Cow::Borrowed("eth_getBalance"),
        "eth_getBlockByNumber" => Cow::Borrowed("eth_getBlockByNumber"),
        "eth_getBlockByHash" => Cow::Borrowed("eth_getBlockByHash"),
        "eth_getBlockRange" => Cow::Borrowed("eth_getBlockRange"),
        "eth_getLogs" => Cow::Borrowed("eth_getLogs"),
        "eth_getTransactionReceipt" => Cow::Borrowed("eth_getTransactionReceipt"),
        "eth_sendRawTransaction" => Cow::Borrowed("eth_sendRawTransaction"),
        "eth_subscribe" => Cow::Borrowed("eth_subscribe"),
        _ => Cow::Owned(method.to_string()),
    }
}

fn try_init_prometheus_recorder(
) -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().install_recorder()
}

fn init_prometheus_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match try_init_prometheus_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "prometheus recorder already installed, using an unregistered fallback"
                );
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}

/// Records proxy metrics and renders them in the Prometheus text format.
#[derive(Clone)]
pub struct MetricsCollector {
    prometheus_handle: PrometheusHandle,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self { prometheus_handle: init_prometheus_recorder() }
    }

    pub fn record_http_request(&self, duration: Duration) {
        counter!("proxyd_http_requests_total").increment(1);
        histogram!("proxyd_http_request_duration_seconds").record(duration.as_secs_f64());
    }

    /// Counts one JSON-RPC request entering a backend group.
    pub fn record_rpc_request(&self) {
        counter!("proxyd_rpc_requests_total").increment(1);
    }

    pub fn record_backend_request(
        &self,
        backend: &str,
        method: &str,
        source: &'static str,
        duration: Duration,
    ) {
        let backend = backend_to_static(backend);
        let method = method_to_static(method);
        counter!(
            "proxyd_rpc_backend_requests_total",
            "backend_name" => backend.clone(),
            "method_name" => method.clone(),
            "source" => source
        )
        .increment(1);
        histogram!(
            "proxyd_rpc_backend_request_duration_seconds",
            "backend_name" => backend,
            "method_name" => method
        )
        .record(duration.as_secs_f64());
    }

    /// Counts a JSON-RPC error envelope, whether produced by the proxy or by a backend.
    pub fn record_rpc_error(&self, source: &str, code: i32) {
        counter!(
            "proxyd_rpc_errors_total",
            "source" => backend_to_static(source),
            "error_code" => code.to_string()
        )
        .increment(1);
    }

    pub fn record_blocked_request(&self, method: &str) {
        counter!("proxyd_blocked_rpc_requests_total", "method_name" => method_to_static(method))
            .increment(1);
    }

    pub fn record_unserviceable_request(&self, source: &'static str) {
        counter!("proxyd_unserviceable_requests_total", "source" => source).increment(1);
    }

    pub fn record_backend_permanent_error(&self, backend: &str) {
        counter!("proxyd_backend_permanent_errors_total", "backend_name" => backend_to_static(backend))
            .increment(1);
    }

    pub fn record_redis_error(&self, source: &'static str) {
        counter!("proxyd_redis_errors_total", "source" => source).increment(1);
    }

    pub fn record_cache_lookup(&self, method: &str, hit: bool) {
        let name = if hit { "proxyd_cache_hits_total" } else { "proxyd_cache_misses_total" };
        counter!(name, "method_name" => method_to_static(method)).increment(1);
    }

    /// Counts a WebSocket frame relayed by the proxier. `source` is `client` or `backend`.
    pub fn record_ws_message(&self, backend: &str, source: &'static str) {
        counter!(
            "proxyd_ws_messages_total",
            "backend_name" => backend_to_static(backend),
            "source" => source
        )
        .increment(1);
    }

    pub fn record_client_ws_connection(&self, connected: bool) {
        let gauge = gauge!("proxyd_active_client_ws_conns");
        if connected {
            gauge.increment(1.0);
        } else {
            gauge.decrement(1.0);
        }
    }

    pub fn record_backend_ws_connection(&self, backend: &str, connected: bool) {
        let gauge =
            gauge!("proxyd_active_backend_ws_conns", "backend_name" => backend_to_static(backend));
        if connected {
            gauge.increment(1.0);
        } else {
            gauge.decrement(1.0);
        }
    }

    /// Stamps the unix time of the last successful LVC poll for `key`.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_lvc_poll(&self, key: &'static str) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        gauge!("proxyd_lvc_poll_time_gauge", "key" => key).set(now as f64);
    }

    /// Renders all metrics in the Prometheus text exposition format.
    #[must_use]
    pub fn get_prometheus_metrics(&self) -> String {
        self.prometheus_handle.render()
    }
}
