//! WebSocket listener.
//!
//! Each accepted client is authenticated during the upgrade handshake with the same path-token
//! rules as HTTP, then paired with one backend connection from the WebSocket backend group.

use crate::middleware::{path_token, AuthTable};
use proxyd_core::{
    backend::{reject_client, WsProxier},
    metrics::MetricsCollector,
    proxy::{generate_request_id, ProxyError, RequestContext, RequestSource},
    runtime::{ProxydRuntime, WsSettings},
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};
use tracing::{debug, error, info, warn};

/// Clients that have not completed the upgrade within this long are dropped.
pub const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Admission state of a client that passed the handshake.
struct Admitted {
    auth: Option<Arc<str>>,
    forwarded_for: Option<String>,
}

/// Accepts WebSocket clients and relays them to the WebSocket backend group.
pub struct WsServer {
    settings: WsSettings,
    auth: Arc<AuthTable>,
    metrics: MetricsCollector,
    handshake_timeout: Duration,
}

impl WsServer {
    #[must_use]
    pub fn new(settings: WsSettings, auth: AuthTable, metrics: MetricsCollector) -> Self {
        Self { settings, auth: Arc::new(auth), metrics, handshake_timeout: WS_HANDSHAKE_TIMEOUT }
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// `None` when no backend group serves WebSocket clients.
    #[must_use]
    pub fn from_runtime(runtime: &ProxydRuntime) -> Option<Self> {
        let components = runtime.components();
        components.ws().map(|settings| {
            Self::new(
                settings.clone(),
                AuthTable::new(&runtime.config().authentication),
                components.metrics_collector().clone(),
            )
        })
    }

    /// Accepts connections until the shutdown signal fires. Connections already being
    /// proxied keep running until either side closes.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("websocket listener shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move { server.handle_connection(stream, peer).await });
                    }
                    Err(e) => warn!(error = %e, "failed to accept websocket connection"),
                },
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let mut admitted = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let token =
                path_token(request.uri().path()).ok_or_else(|| rejection(StatusCode::NOT_FOUND.as_u16()))?;
            let auth = self.auth.authorize(token).map_err(|status| rejection(status.as_u16()))?;
            let forwarded_for = request
                .headers()
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map_or_else(|| peer.ip().to_string(), str::to_string);
            admitted = Some(Admitted { auth, forwarded_for: Some(forwarded_for) });
            Ok(response)
        };

        let client = match tokio::time::timeout(self.handshake_timeout, accept_hdr_async(stream, callback)).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "websocket handshake failed");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "websocket handshake timed out");
                return;
            }
        };
        let Some(Admitted { auth, forwarded_for }) = admitted else {
            return;
        };

        let ctx = RequestContext::new(RequestSource::Ws)
            .with_request_id(generate_request_id())
            .with_auth(auth)
            .with_forwarded_for(forwarded_for);

        self.metrics.record_client_ws_connection(true);
        match self.settings.group.connect_ws(&ctx).await {
            Ok(backend) => {
                WsProxier::new(ctx, client, backend, Arc::clone(&self.settings.whitelist), self.metrics.clone())
                    .proxy()
                    .await;
            }
            Err(e) => {
                error!(req_id = %ctx.request_id, error = %e, "error dialing websocket backend");
                reject_client(client, &ProxyError::from(e)).await;
            }
        }
        self.metrics.record_client_ws_connection(false);
    }
}

/// Handshake rejection with an empty body.
fn rejection(status: u16) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::UNAUTHORIZED);
    response
}
