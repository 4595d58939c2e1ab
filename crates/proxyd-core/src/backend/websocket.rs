//! Bidirectional relay between a client WebSocket and a backend WebSocket.
//!
//! Client frames are validated before they reach the backend: unparseable frames and methods
//! outside the WebSocket whitelist are answered by the proxy and never forwarded. Backend frames
//! that are not JSON are replaced with an error envelope.

use super::group::BackendWsConn;
use crate::{
    metrics::MetricsCollector,
    proxy::{context::RequestContext, errors::ProxyError},
    rpc,
    types::JsonRpcResponse,
};
use ahash::AHashSet;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};

type ClientSink<S> = Mutex<SplitSink<WebSocketStream<S>, Message>>;

/// Methods a WebSocket client may call.
pub type WsWhitelist = Arc<AHashSet<String>>;

fn frame_payload(msg: &Message) -> Option<&[u8]> {
    match msg {
        Message::Text(text) => Some(text.as_str().as_bytes()),
        Message::Binary(data) => Some(data.as_ref()),
        _ => None,
    }
}

fn envelope_message(response: &JsonRpcResponse) -> Message {
    let body = serde_json::to_string(response).unwrap_or_default();
    Message::Text(body.into())
}

/// Sends `err` as a null-id envelope and closes the connection.
pub async fn reject_client<S>(mut client: WebSocketStream<S>, err: &ProxyError)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = client.send(envelope_message(&err.to_null_response())).await {
        debug!(error = %e, "failed to send websocket rejection");
    }
    if let Err(e) = client.close(None).await {
        debug!(error = %e, "failed to close rejected websocket");
    }
}

/// Relays one client connection to one backend connection until either side closes.
pub struct WsProxier<S> {
    ctx: RequestContext,
    client: WebSocketStream<S>,
    backend: BackendWsConn,
    whitelist: WsWhitelist,
    metrics: MetricsCollector,
}

impl<S> WsProxier<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[must_use]
    pub fn new(
        ctx: RequestContext,
        client: WebSocketStream<S>,
        backend: BackendWsConn,
        whitelist: WsWhitelist,
        metrics: MetricsCollector,
    ) -> Self {
        Self { ctx, client, backend, whitelist, metrics }
    }

    /// Runs both pumps until one of them stops, then closes both connections and releases
    /// the backend slot.
    pub async fn proxy(self) {
        let Self { ctx, client, backend, whitelist, metrics } = self;
        let BackendWsConn { backend, stream, slot } = backend;
        let backend_name = backend.name().to_string();

        let (client_tx, mut client_rx) = client.split();
        let (mut backend_tx, mut backend_rx) = stream.split();
        let client_tx: ClientSink<S> = Mutex::new(client_tx);

        metrics.record_backend_ws_connection(&backend_name, true);
        info!(req_id = %ctx.request_id, backend = %backend_name, "websocket proxy started");

        let pumps = Pumps { ctx: &ctx, backend: &backend_name, whitelist: &whitelist, metrics: &metrics };
        tokio::select! {
            () = pumps.client_pump(&mut client_rx, &mut backend_tx, &client_tx) => {
                debug!(req_id = %ctx.request_id, "client pump finished");
            }
            () = pumps.backend_pump(&mut backend_rx, &client_tx) => {
                debug!(req_id = %ctx.request_id, "backend pump finished");
            }
        }

        if let Err(e) = backend_tx.close().await {
            debug!(req_id = %ctx.request_id, backend = %backend_name, error = %e, "failed to close backend websocket");
        }
        if let Err(e) = client_tx.lock().await.close().await {
            debug!(req_id = %ctx.request_id, error = %e, "failed to close client websocket");
        }
        metrics.record_backend_ws_connection(&backend_name, false);
        drop(slot);
        info!(req_id = %ctx.request_id, backend = %backend_name, "websocket proxy closed");
    }
}

struct Pumps<'a> {
    ctx: &'a RequestContext,
    backend: &'a str,
    whitelist: &'a AHashSet<String>,
    metrics: &'a MetricsCollector,
}

impl Pumps<'_> {
    /// Returns the envelope to answer the client with, or `None` to forward the frame.
    fn screen_client_frame(&self, payload: &[u8]) -> Option<JsonRpcResponse> {
        match rpc::parse_single(payload) {
            Err(err) => Some(err.to_null_response()),
            Ok(req) if !self.whitelist.contains(&req.method) => {
                info!(
                    req_id = %self.ctx.request_id,
                    method = %req.method,
                    "blocked websocket request for non-whitelisted method"
                );
                self.metrics.record_blocked_request(&req.method);
                Some(ProxyError::MethodNotWhitelisted.to_response(req.id))
            }
            Ok(req) => {
                debug!(req_id = %self.ctx.request_id, method = %req.method, "forwarding websocket request");
                None
            }
        }
    }

    async fn client_pump<S, B>(
        &self,
        client_rx: &mut SplitStream<WebSocketStream<S>>,
        backend_tx: &mut B,
        client_tx: &ClientSink<S>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
        B: futures_util::Sink<Message> + Unpin,
        B::Error: std::fmt::Display,
    {
        while let Some(frame) = client_rx.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(req_id = %self.ctx.request_id, error = %e, "client websocket read failed");
                    return;
                }
            };
            self.metrics.record_ws_message(self.backend, "client");

            let is_close = matches!(msg, Message::Close(_));
            if let Some(rejection) = frame_payload(&msg).and_then(|p| self.screen_client_frame(p)) {
                if let Err(e) = client_tx.lock().await.send(envelope_message(&rejection)).await {
                    debug!(req_id = %self.ctx.request_id, error = %e, "client websocket write failed");
                    return;
                }
                continue;
            }

            if let Err(e) = backend_tx.send(msg).await {
                warn!(
                    req_id = %self.ctx.request_id,
                    backend = self.backend,
                    error = %e,
                    "backend websocket write failed"
                );
                return;
            }
            if is_close {
                return;
            }
        }
    }

    async fn backend_pump<S, B>(&self, backend_rx: &mut B, client_tx: &ClientSink<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
        B: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        while let Some(frame) = backend_rx.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(
                        req_id = %self.ctx.request_id,
                        backend = self.backend,
                        error = %e,
                        "backend websocket read failed"
                    );
                    return;
                }
            };
            self.metrics.record_ws_message(self.backend, "backend");

            let is_close = matches!(msg, Message::Close(_));
            let invalid =
                frame_payload(&msg).is_some_and(|p| serde_json::from_slice::<Value>(p).is_err());
            let msg = if invalid {
                warn!(req_id = %self.ctx.request_id, backend = self.backend, "backend sent invalid websocket frame");
                envelope_message(&ProxyError::BackendBadResponse.to_null_response())
            } else {
                msg
            };

            if let Err(e) = client_tx.lock().await.send(msg).await {
                debug!(req_id = %self.ctx.request_id, error = %e, "client websocket write failed");
                return;
            }
            if is_close {
                return;
            }
        }
    }
}
