//! Mock WebSocket backend.
//!
//! Answers every JSON-RPC request frame with a result carrying the request's id, records the
//! frames it received, and can push raw frames to connected clients.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Subscription id returned for `eth_subscribe`.
pub const SUBSCRIPTION_ID: &str = "0x9ce59a13059e417087c02d3236a0b9cc";

/// A mock node serving JSON-RPC over WebSocket.
pub struct MockWebSocketServer {
    addr: SocketAddr,
    push_queue: Arc<RwLock<VecDeque<Message>>>,
    received: Arc<RwLock<Vec<String>>>,
    server_handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MockWebSocketServer {
    /// Starts the server on a random local port.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to a local port or retrieve the bound address.
    pub async fn new() -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let push_queue = Arc::new(RwLock::new(VecDeque::new()));
        let received = Arc::new(RwLock::new(Vec::new()));
        let (shutdown_tx, _) = broadcast::channel(1);

        let server_handle =
            Self::spawn_server(listener, push_queue.clone(), received.clone(), shutdown_tx.subscribe());

        Ok(Self { addr, push_queue, received, server_handle, shutdown_tx })
    }

    fn spawn_server(
        listener: TcpListener,
        push_queue: Arc<RwLock<VecDeque<Message>>>,
        received: Arc<RwLock<Vec<String>>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        if let Ok((stream, _)) = result {
                            tokio::spawn(Self::handle_connection(stream, push_queue.clone(), received.clone()));
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    async fn handle_connection(
        stream: TcpStream,
        push_queue: Arc<RwLock<VecDeque<Message>>>,
        received: Arc<RwLock<Vec<String>>>,
    ) {
        let Ok(ws_stream) = accept_async(stream).await else { return };
        let (mut write, mut read) = ws_stream.split();

        loop {
            {
                let mut queue = push_queue.write().await;
                while let Some(msg) = queue.pop_front() {
                    if write.send(msg).await.is_err() {
                        return;
                    }
                }
            }

            tokio::select! {
                Some(result) = read.next() => match result {
                    Ok(Message::Text(text)) => {
                        received.write().await.push(text.to_string());
                        if let Some(reply) = reply_to(text.as_str()) {
                            if write.send(Message::Text(reply.into())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => (),
                },
                () = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    /// Returns the WebSocket URL of this server.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Queues a raw text frame for connected clients.
    pub async fn push_text(&self, text: impl Into<String>) {
        self.push_queue.write().await.push_back(Message::Text(text.into().into()));
    }

    /// Queues a `newHeads` notification for the subscription created by `eth_subscribe`.
    pub async fn push_new_head(&self, block_number: u64) {
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": SUBSCRIPTION_ID,
                "result": {
                    "number": format!("0x{block_number:x}"),
                    "hash": format!("0x{block_number:064x}")
                }
            }
        });
        self.push_text(msg.to_string()).await;
    }

    /// Returns the text frames received so far.
    pub async fn received_messages(&self) -> Vec<String> {
        self.received.read().await.clone()
    }

    /// Waits until a received frame contains `needle`.
    pub async fn wait_for_message(&self, needle: &str, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if self.received.read().await.iter().any(|msg| msg.contains(needle)) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

impl Drop for MockWebSocketServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.server_handle.abort();
    }
}

/// The node's answer to a request frame: a subscription id for `eth_subscribe`, otherwise the
/// method name echoed as the result.
fn reply_to(text: &str) -> Option<String> {
    let request: Value = serde_json::from_str(text).ok()?;
    let method = request.get("method")?.as_str()?;
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let result = if method == "eth_subscribe" { json!(SUBSCRIPTION_ID) } else { json!(method) };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn test_replies_with_request_id() {
        let server = MockWebSocketServer::new().await.unwrap();
        let (mut ws, _) = connect_async(server.url()).await.expect("connect");

        let request = r#"{"jsonrpc":"2.0","method":"eth_subscribe","params":["newHeads"],"id":42}"#;
        ws.send(Message::Text(request.to_string().into())).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(reply["id"], 42);
        assert_eq!(reply["result"], SUBSCRIPTION_ID);
        assert!(server.wait_for_message("eth_subscribe", Duration::from_secs(1)).await);
    }

    #[test]
    fn test_reply_to_ignores_notifications_without_method() {
        assert!(reply_to(r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#).is_none());
        assert!(reply_to("not json").is_none());
    }
}
