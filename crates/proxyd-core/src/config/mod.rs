//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: `Default` implementations and `#[serde(default)]` functions
//! 2. **Config file**: TOML file named by the first CLI argument or the `PROXYD_CONFIG` env var
//! 3. **Environment variables**: `PROXYD__SECTION__KEY` overrides scalar settings
//!
//! Table keys such as method names and auth tokens are case-sensitive and can only be set in
//! the file.
//!
//! # Example
//!
//! ```toml
//! ws_method_whitelist = ["eth_subscribe", "eth_call"]
//! ws_backend_group = "main"
//!
//! [server]
//! rpc_port = 8080
//!
//! [backends.infura]
//! rpc_url = "https://mainnet.infura.io/v3/KEY"
//! ws_url = "wss://mainnet.infura.io/ws/v3/KEY"
//! max_rps = 10
//!
//! [backend_groups.main]
//! backends = ["infura"]
//!
//! [rpc_method_mappings]
//! eth_chainId = "main"
//! ```

use crate::backend::BackendSettings;
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};
use thiserror::Error;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/proxyd.toml";

/// Hard cap on `server.max_batch_size`.
pub const MAX_BATCH_SIZE_LIMIT: usize = 1000;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML or does not match the schema.
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),

    /// An environment override could not be applied.
    #[error("invalid environment override: {0}")]
    Env(#[from] config::ConfigError),

    /// The configuration violates a startup rule.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// HTTP and WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub rpc_host: String,
    pub rpc_port: u16,
    pub ws_host: String,
    /// Zero disables the WebSocket listener.
    pub ws_port: u16,
    pub max_body_size_bytes: usize,
    pub max_concurrent_requests: usize,
    pub max_batch_size: usize,
    pub rpc_timeout_seconds: u64,
    /// Largest JSON batch sent to a backend; bigger sets of cache misses are split.
    pub max_upstream_batch_size: usize,
    /// Adds `x-served-by: <group>/<backend>` to HTTP responses.
    pub enable_served_by_header: bool,
    /// Logs every request body, truncated to `max_request_body_log_len` bytes.
    pub enable_request_log: bool,
    pub max_request_body_log_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rpc_host: "0.0.0.0".to_string(),
            rpc_port: 8080,
            ws_host: "0.0.0.0".to_string(),
            ws_port: 0,
            max_body_size_bytes: 256 * 1024,
            max_concurrent_requests: 1000,
            max_batch_size: 100,
            rpc_timeout_seconds: 10,
            max_upstream_batch_size: crate::proxy::DEFAULT_MAX_UPSTREAM_BATCH_SIZE,
            enable_served_by_header: false,
            enable_request_log: false,
            max_request_body_log_len: 2000,
        }
    }
}

/// One `[rate_limit.method_overrides.<method>]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodOverrideConfig {
    pub limit: u64,
    pub interval_seconds: u64,
    /// Applies to exempt origins and user agents too.
    pub global: bool,
}

impl Default for MethodOverrideConfig {
    fn default() -> Self {
        Self { limit: 0, interval_seconds: 1, global: false }
    }
}

/// Per-client request limits, keyed by the client IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Share counters through Redis instead of keeping them in process.
    pub use_redis: bool,
    /// Requests per interval for each client. Zero disables the base limit.
    pub base_rate: u64,
    pub base_interval_seconds: u64,
    /// Regexes matched against the `Origin` header.
    pub exempt_origins: Vec<String>,
    /// Regexes matched against the `User-Agent` header.
    pub exempt_user_agents: Vec<String>,
    pub method_overrides: BTreeMap<String, MethodOverrideConfig>,
    /// Header carrying the client IP. Defaults to `X-Forwarded-For`.
    pub ip_header_override: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            use_redis: false,
            base_rate: 0,
            base_interval_seconds: 1,
            exempt_origins: Vec::new(),
            exempt_user_agents: Vec::new(),
            method_overrides: BTreeMap::new(),
            ip_header_override: String::new(),
        }
    }
}

impl RateLimitConfig {
    /// True when any limit keyed by client IP is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.base_rate > 0 || !self.method_overrides.is_empty()
    }
}

/// Limit on `eth_sendRawTransaction` per sender and nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderRateLimitConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub limit: u64,
    /// Chain ids a transaction may be signed for. Empty allows any.
    pub allowed_chain_ids: Vec<u64>,
}

impl Default for SenderRateLimitConfig {
    fn default() -> Self {
        Self { enabled: false, interval_seconds: 1, limit: 0, allowed_chain_ids: Vec::new() }
    }
}

/// Shared-state store. An empty or missing URL selects the in-process store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
}

/// Prometheus exposition listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: false, host: "0.0.0.0".to_string(), port: 9761 }
    }
}

/// Defaults shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOptions {
    pub response_timeout_seconds: u64,
    pub max_response_size_bytes: u64,
    pub backend_retries: u32,
    pub out_of_service_seconds: u64,
    /// Zero means unlimited.
    pub max_rps: u64,
    /// Zero means unlimited.
    pub max_ws_conns: u64,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            response_timeout_seconds: 5,
            max_response_size_bytes: 5 * 1024 * 1024,
            backend_retries: 3,
            out_of_service_seconds: 600,
            max_rps: 0,
            max_ws_conns: 0,
        }
    }
}

/// One `[backends.<name>]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub username: String,
    pub password: String,
    pub rpc_url: String,
    pub ws_url: String,
    pub max_rps: Option<u64>,
    pub max_ws_conns: Option<u64>,
    pub headers: BTreeMap<String, String>,
    pub strip_trailing_xff: bool,
}

/// One `[backend_groups.<name>]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendGroupConfig {
    pub backends: Vec<String>,
    pub ws_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (e.g. "info", "debug"). `RUST_LOG` takes precedence.
    pub level: String,
    /// Output format: `"json"` or `"pretty"`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ws_method_whitelist: Vec<String>,
    pub ws_backend_group: String,
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub metrics: MetricsConfig,
    pub backend: BackendOptions,
    pub backends: BTreeMap<String, BackendConfig>,
    /// Token to client key. Empty disables authentication.
    pub authentication: BTreeMap<String, String>,
    pub backend_groups: BTreeMap<String, BackendGroupConfig>,
    pub rpc_method_mappings: BTreeMap<String, String>,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub rate_limit: RateLimitConfig,
    pub sender_rate_limit: SenderRateLimitConfig,
}

/// Scalar settings that may be overridden from the environment.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvOverrides {
    server: ServerOverrides,
    redis: RedisOverrides,
    metrics: MetricsOverrides,
    backend: BackendOverrides,
    cache: CacheOverrides,
    logging: LoggingOverrides,
    rate_limit: RateLimitOverrides,
    sender_rate_limit: SenderRateLimitOverrides,
    ws_backend_group: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerOverrides {
    rpc_host: Option<String>,
    rpc_port: Option<u16>,
    ws_host: Option<String>,
    ws_port: Option<u16>,
    max_body_size_bytes: Option<usize>,
    max_concurrent_requests: Option<usize>,
    max_batch_size: Option<usize>,
    rpc_timeout_seconds: Option<u64>,
    max_upstream_batch_size: Option<usize>,
    enable_served_by_header: Option<bool>,
    enable_request_log: Option<bool>,
    max_request_body_log_len: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RateLimitOverrides {
    use_redis: Option<bool>,
    base_rate: Option<u64>,
    base_interval_seconds: Option<u64>,
    ip_header_override: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SenderRateLimitOverrides {
    enabled: Option<bool>,
    interval_seconds: Option<u64>,
    limit: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RedisOverrides {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetricsOverrides {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BackendOverrides {
    response_timeout_seconds: Option<u64>,
    max_response_size_bytes: Option<u64>,
    backend_retries: Option<u32>,
    out_of_service_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CacheOverrides {
    enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoggingOverrides {
    level: Option<String>,
    format: Option<String>,
}

fn apply<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl AppConfig {
    /// Loads the file at `config_path` and applies `PROXYD__*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or an override is invalid.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let path = config_path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Loads from `path`, falling back to `PROXYD_CONFIG` and then [`DEFAULT_CONFIG_PATH`].
    ///
    /// # Errors
    ///
    /// See [`AppConfig::from_file`].
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let config_path = path.map_or_else(
            || std::env::var("PROXYD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
            str::to_string,
        );
        Self::from_file(&config_path)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] for invalid TOML.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        let overrides: EnvOverrides = Config::builder()
            .add_source(Environment::with_prefix("PROXYD").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;

        let server = overrides.server;
        apply(&mut self.server.rpc_host, server.rpc_host);
        apply(&mut self.server.rpc_port, server.rpc_port);
        apply(&mut self.server.ws_host, server.ws_host);
        apply(&mut self.server.ws_port, server.ws_port);
        apply(&mut self.server.max_body_size_bytes, server.max_body_size_bytes);
        apply(&mut self.server.max_concurrent_requests, server.max_concurrent_requests);
        apply(&mut self.server.max_batch_size, server.max_batch_size);
        apply(&mut self.server.rpc_timeout_seconds, server.rpc_timeout_seconds);
        apply(&mut self.server.max_upstream_batch_size, server.max_upstream_batch_size);
        apply(&mut self.server.enable_served_by_header, server.enable_served_by_header);
        apply(&mut self.server.enable_request_log, server.enable_request_log);
        apply(&mut self.server.max_request_body_log_len, server.max_request_body_log_len);

        if overrides.redis.url.is_some() {
            self.redis.url = overrides.redis.url;
        }

        apply(&mut self.metrics.enabled, overrides.metrics.enabled);
        apply(&mut self.metrics.host, overrides.metrics.host);
        apply(&mut self.metrics.port, overrides.metrics.port);

        let backend = overrides.backend;
        apply(&mut self.backend.response_timeout_seconds, backend.response_timeout_seconds);
        apply(&mut self.backend.max_response_size_bytes, backend.max_response_size_bytes);
        apply(&mut self.backend.backend_retries, backend.backend_retries);
        apply(&mut self.backend.out_of_service_seconds, backend.out_of_service_seconds);

        let rate_limit = overrides.rate_limit;
        apply(&mut self.rate_limit.use_redis, rate_limit.use_redis);
        apply(&mut self.rate_limit.base_rate, rate_limit.base_rate);
        apply(&mut self.rate_limit.base_interval_seconds, rate_limit.base_interval_seconds);
        apply(&mut self.rate_limit.ip_header_override, rate_limit.ip_header_override);

        let sender = overrides.sender_rate_limit;
        apply(&mut self.sender_rate_limit.enabled, sender.enabled);
        apply(&mut self.sender_rate_limit.interval_seconds, sender.interval_seconds);
        apply(&mut self.sender_rate_limit.limit, sender.limit);

        apply(&mut self.cache.enabled, overrides.cache.enabled);
        apply(&mut self.logging.level, overrides.logging.level);
        apply(&mut self.logging.format, overrides.logging.format);
        apply(&mut self.ws_backend_group, overrides.ws_backend_group);
        Ok(())
    }

    /// Checks every startup rule.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.backends.is_empty() {
            return Err("must define at least one backend".to_string());
        }
        if self.backend_groups.is_empty() {
            return Err("must define at least one backend group".to_string());
        }
        if self.rpc_method_mappings.is_empty() {
            return Err("must define at least one RPC method mapping".to_string());
        }

        for (name, backend) in &self.backends {
            validate_url(name, "rpc_url", &backend.rpc_url, &["http", "https"])?;
            validate_url(name, "ws_url", &backend.ws_url, &["ws", "wss"])?;
        }

        for (group, config) in &self.backend_groups {
            if config.backends.is_empty() {
                return Err(format!("backend group {group} has no backends"));
            }
            if let Some(missing) = config.backends.iter().find(|b| !self.backends.contains_key(*b)) {
                return Err(format!("backend group {group} references undefined backend {missing}"));
            }
        }

        if let Some((method, group)) =
            self.rpc_method_mappings.iter().find(|(_, group)| !self.backend_groups.contains_key(*group))
        {
            return Err(format!("method {method} maps to undefined backend group {group}"));
        }

        if self.authentication.contains_key("none") {
            return Err("cannot use none as an auth key".to_string());
        }

        if self.backend_groups.values().filter(|g| g.ws_enabled).count() > 1 {
            return Err("only one backend group may be ws_enabled".to_string());
        }
        if !self.ws_backend_group.is_empty() && !self.backend_groups.contains_key(&self.ws_backend_group) {
            return Err(format!("ws_backend_group {} is not defined", self.ws_backend_group));
        }

        if self.server.rpc_port == 0 {
            return Err("server.rpc_port must be greater than 0".to_string());
        }
        if self.server.max_body_size_bytes == 0 {
            return Err("server.max_body_size_bytes must be greater than 0".to_string());
        }
        if self.server.rpc_timeout_seconds == 0 {
            return Err("server.rpc_timeout_seconds must be greater than 0".to_string());
        }
        if self.server.max_concurrent_requests == 0 {
            return Err("server.max_concurrent_requests must be greater than 0".to_string());
        }
        if self.server.max_batch_size == 0 || self.server.max_batch_size > MAX_BATCH_SIZE_LIMIT {
            return Err(format!("server.max_batch_size must be between 1 and {MAX_BATCH_SIZE_LIMIT}"));
        }
        if self.backend.response_timeout_seconds == 0 {
            return Err("backend.response_timeout_seconds must be greater than 0".to_string());
        }
        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("logging format must be 'json' or 'pretty'".to_string());
        }
        if self.server.max_upstream_batch_size == 0 {
            return Err("server.max_upstream_batch_size must be greater than 0".to_string());
        }

        self.validate_rate_limits()
    }

    fn validate_rate_limits(&self) -> Result<(), String> {
        let limits = &self.rate_limit;
        if limits.base_rate > 0 && limits.base_interval_seconds == 0 {
            return Err("rate_limit.base_interval_seconds must be greater than 0".to_string());
        }
        for pattern in limits.exempt_origins.iter().chain(&limits.exempt_user_agents) {
            regex::Regex::new(pattern).map_err(|e| format!("invalid rate limit exemption {pattern}: {e}"))?;
        }
        for (method, limit) in &limits.method_overrides {
            if limit.limit == 0 || limit.interval_seconds == 0 {
                return Err(format!("rate limit override for {method} needs a limit and interval above 0"));
            }
        }

        let sender = &self.sender_rate_limit;
        if sender.enabled && (sender.limit == 0 || sender.interval_seconds == 0) {
            return Err("sender_rate_limit needs a limit and interval above 0".to_string());
        }

        let uses_limiter = limits.is_enabled() || sender.enabled;
        if limits.use_redis && uses_limiter && self.redis_url().is_none() {
            return Err("rate_limit.use_redis requires redis.url".to_string());
        }
        Ok(())
    }

    /// The group serving WebSocket clients: `ws_backend_group`, else the `ws_enabled` group.
    #[must_use]
    pub fn ws_group(&self) -> Option<&str> {
        if !self.ws_backend_group.is_empty() {
            return Some(&self.ws_backend_group);
        }
        self.backend_groups.iter().find(|(_, g)| g.ws_enabled).map(|(name, _)| name.as_str())
    }

    #[must_use]
    pub fn auth_enabled(&self) -> bool {
        !self.authentication.is_empty()
    }

    #[must_use]
    pub fn redis_url(&self) -> Option<&str> {
        self.redis.url.as_deref().filter(|url| !url.is_empty())
    }

    #[must_use]
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.server.rpc_host, self.server.rpc_port)
    }

    /// `None` when the WebSocket listener is disabled.
    #[must_use]
    pub fn ws_addr(&self) -> Option<String> {
        (self.server.ws_port != 0).then(|| format!("{}:{}", self.server.ws_host, self.server.ws_port))
    }

    #[must_use]
    pub fn metrics_addr(&self) -> String {
        format!("{}:{}", self.metrics.host, self.metrics.port)
    }

    /// Header the client IP is read from for rate limiting.
    #[must_use]
    pub fn rate_limit_header(&self) -> &str {
        Some(self.rate_limit.ip_header_override.as_str()).filter(|h| !h.is_empty()).unwrap_or("X-Forwarded-For")
    }

    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.server.rpc_timeout_seconds)
    }

    /// Resolves every `[backends.<name>]` table against the `[backend]` defaults.
    #[must_use]
    pub fn backend_settings(&self) -> Vec<BackendSettings> {
        let defaults = &self.backend;
        self.backends
            .iter()
            .map(|(name, backend)| BackendSettings {
                name: Arc::from(name.as_str()),
                rpc_url: backend.rpc_url.clone(),
                ws_url: backend.ws_url.clone(),
                username: backend.username.clone(),
                password: backend.password.clone(),
                headers: backend.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                response_timeout: Duration::from_secs(defaults.response_timeout_seconds),
                max_response_size: defaults.max_response_size_bytes,
                max_retries: defaults.backend_retries,
                out_of_service: Duration::from_secs(defaults.out_of_service_seconds),
                max_rps: backend.max_rps.unwrap_or(defaults.max_rps),
                max_ws_conns: backend.max_ws_conns.unwrap_or(defaults.max_ws_conns),
                strip_trailing_xff: backend.strip_trailing_xff,
            })
            .collect()
    }
}

fn validate_url(backend: &str, field: &str, value: &str, schemes: &[&str]) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("backend {backend} must have a {field}"));
    }
    let parsed = url::Url::parse(value).map_err(|e| format!("invalid {field} for backend {backend}: {e}"))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(format!("invalid {field} scheme for backend {backend}: {}", parsed.scheme()));
    }
    Ok(())
}
