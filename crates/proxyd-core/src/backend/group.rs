use super::{
    client::{Backend, BackendWsStream, Payload},
    errors::BackendError,
};
use crate::{
    metrics::MetricsCollector,
    proxy::context::RequestContext,
    ratelimit::RateLimiter,
    types::{JsonRpcRequest, JsonRpcResponse},
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Ordered list of backends serving the same set of methods.
///
/// Requests fail over from one backend to the next in configuration order.
#[derive(Debug)]
pub struct BackendGroup {
    name: Arc<str>,
    backends: Vec<Arc<Backend>>,
    metrics: MetricsCollector,
}

impl BackendGroup {
    #[must_use]
    pub fn new(
        name: impl Into<Arc<str>>,
        backends: Vec<Arc<Backend>>,
        metrics: MetricsCollector,
    ) -> Self {
        Self { name: name.into(), backends, metrics }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Forwards `req` to the first backend that answers. Returns the response and the
    /// `group/backend` label of the backend that served it.
    ///
    /// A backend answering with a JSON-RPC error envelope counts as an answer.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NoBackends`] when every backend was skipped or failed.
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        req: &JsonRpcRequest,
    ) -> Result<(JsonRpcResponse, String), BackendError> {
        let (mut responses, served_by) = self.failover(ctx, Payload::Single(req)).await?;
        let response = responses.pop().ok_or(BackendError::BadResponse)?;
        Ok((response, served_by))
    }

    /// Forwards `reqs` as one upstream batch, failing over like [`BackendGroup::forward`].
    /// Responses are in request order.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NoBackends`] when every backend was skipped or failed.
    pub async fn forward_batch(
        &self,
        ctx: &RequestContext,
        reqs: &[JsonRpcRequest],
    ) -> Result<(Vec<JsonRpcResponse>, String), BackendError> {
        if reqs.is_empty() {
            return Ok((Vec::new(), String::new()));
        }
        self.failover(ctx, Payload::Batch(reqs)).await
    }

    async fn failover(
        &self,
        ctx: &RequestContext,
        payload: Payload<'_>,
    ) -> Result<(Vec<JsonRpcResponse>, String), BackendError> {
        self.metrics.record_rpc_request();

        for backend in &self.backends {
            let result = match payload {
                Payload::Single(req) => backend.forward(ctx, req).await.map(|response| vec![response]),
                Payload::Batch(reqs) => backend.forward_batch(ctx, reqs).await,
            };
            match result {
                Ok(responses) => return Ok((responses, format!("{}/{}", self.name, backend.name()))),
                Err(BackendError::Offline) => {
                    debug!(
                        group = %self.name,
                        backend = backend.name(),
                        req_id = %ctx.request_id,
                        "skipping offline backend"
                    );
                }
                Err(BackendError::OverCapacity) => {
                    warn!(
                        group = %self.name,
                        backend = backend.name(),
                        req_id = %ctx.request_id,
                        "skipping over-capacity backend"
                    );
                }
                Err(e) => {
                    error!(
                        group = %self.name,
                        backend = backend.name(),
                        req_id = %ctx.request_id,
                        method = payload.method_label(),
                        error = %e,
                        "error forwarding request to backend"
                    );
                }
            }
        }

        self.metrics.record_unserviceable_request(ctx.source.as_str());
        Err(BackendError::NoBackends)
    }

    /// Dials the first backend that is online, under its RPS limit and has a free WebSocket
    /// slot.
    ///
    /// A failed dial takes the backend out of service and releases its slot.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NoBackends`] when no backend could be dialed.
    pub async fn connect_ws(
        &self,
        ctx: &RequestContext,
    ) -> Result<BackendWsConn, BackendError> {
        for backend in &self.backends {
            if !backend.is_online().await {
                debug!(group = %self.name, backend = backend.name(), "skipping offline backend");
                continue;
            }
            if backend.is_over_capacity().await {
                warn!(group = %self.name, backend = backend.name(), "skipping over-capacity backend");
                continue;
            }

            let Some(slot) = WsSlot::acquire(backend).await else {
                warn!(
                    group = %self.name,
                    backend = backend.name(),
                    max_ws_conns = backend.settings().max_ws_conns,
                    "backend has no free websocket slots"
                );
                continue;
            };

            match backend.dial_ws().await {
                Ok(stream) => {
                    return Ok(BackendWsConn { backend: Arc::clone(backend), stream, slot });
                }
                Err(e) => {
                    error!(
                        group = %self.name,
                        backend = backend.name(),
                        req_id = %ctx.request_id,
                        error = %e,
                        "error dialing websocket backend"
                    );
                    drop(slot);
                    backend.quarantine().await;
                }
            }
        }

        self.metrics.record_unserviceable_request(ctx.source.as_str());
        Err(BackendError::NoBackends)
    }
}

/// An open WebSocket to a backend, holding the slot it was admitted under.
pub struct BackendWsConn {
    pub backend: Arc<Backend>,
    pub stream: BackendWsStream,
    pub slot: WsSlot,
}

/// RAII guard for a WebSocket slot reserved on a backend.
///
/// The slot is released in the background when the guard is dropped.
pub struct WsSlot {
    backend: Arc<str>,
    limiter: Arc<dyn RateLimiter>,
}

impl WsSlot {
    /// Reserves a slot on `backend`. Store failures deny the connection.
    async fn acquire(backend: &Backend) -> Option<Self> {
        let name = backend.name();
        match backend.limiter().inc_backend_ws_conns(name, backend.settings().max_ws_conns).await {
            Ok(true) => Some(Self {
                backend: Arc::clone(&backend.settings().name),
                limiter: Arc::clone(backend.limiter()),
            }),
            Ok(false) => None,
            Err(e) => {
                warn!(backend = name, error = %e, "failed to reserve websocket slot, denying");
                None
            }
        }
    }

    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }
}

impl Drop for WsSlot {
    fn drop(&mut self) {
        let backend = Arc::clone(&self.backend);
        let limiter = Arc::clone(&self.limiter);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(backend = %backend, "no runtime to release websocket slot");
            return;
        };
        handle.spawn(async move {
            if let Err(e) = limiter.dec_backend_ws_conns(&backend).await {
                warn!(backend = %backend, error = %e, "failed to release websocket slot");
            }
        });
    }
}
