//! WebSocket relay through a real listener and a mock WebSocket node.

use crate::mock_infrastructure::{proxy_config, MockWebSocketServer, SUBSCRIPTION_ID};
use futures_util::{SinkExt, StreamExt};
use proxyd_core::{config::AppConfig, runtime::ProxydRuntime};
use serde_json::{json, Value};
use server::WsServer;
use std::{sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime plus the address of its WebSocket listener.
struct WsProxy {
    runtime: ProxydRuntime,
    url: String,
}

impl WsProxy {
    async fn start(node: &MockWebSocketServer, max_ws_conns: Option<u64>) -> Self {
        let mut config = AppConfig::from_toml(&proxy_config(
            &[("ws_node", "http://127.0.0.1:1", &node.url())],
            &["eth_chainId"],
            "",
        ))
        .unwrap();
        config.ws_backend_group = "main".to_string();
        config.ws_method_whitelist = vec!["eth_subscribe".to_string(), "eth_chainId".to_string()];
        if let Some(backend) = config.backends.get_mut("ws_node") {
            backend.max_ws_conns = max_ws_conns;
        }

        let runtime = ProxydRuntime::builder().with_config(config).build().await.unwrap();
        let server = Arc::new(WsServer::from_runtime(&runtime).expect("websocket group configured"));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        tokio::spawn(server.serve(listener, runtime.shutdown_receiver()));

        Self { runtime, url }
    }

    async fn connect(&self) -> Client {
        connect_async(self.url.as_str()).await.expect("websocket connect").0
    }

    async fn shutdown(self) {
        self.runtime.shutdown().await;
    }
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn recv(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("frame before timeout")
            .expect("connection open")
            .expect("valid frame");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_whitelisted_request_is_relayed() {
    let node = MockWebSocketServer::new().await.unwrap();
    let proxy = WsProxy::start(&node, None).await;
    let mut client = proxy.connect().await;

    send(&mut client, json!({"jsonrpc": "2.0", "method": "eth_subscribe", "params": ["newHeads"], "id": 7})).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply, json!({"jsonrpc": "2.0", "id": 7, "result": SUBSCRIPTION_ID}));
    assert!(node.wait_for_message("newHeads", Duration::from_secs(1)).await);

    node.push_new_head(0x10).await;
    let notification = recv(&mut client).await;
    assert_eq!(notification["method"], "eth_subscription");
    assert_eq!(notification["params"]["subscription"], SUBSCRIPTION_ID);
    assert_eq!(notification["params"]["result"]["number"], "0x10");

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_non_whitelisted_request_is_answered_locally() {
    let node = MockWebSocketServer::new().await.unwrap();
    let proxy = WsProxy::start(&node, None).await;
    let mut client = proxy.connect().await;

    send(&mut client, json!({"jsonrpc": "2.0", "method": "eth_sendRawTransaction", "params": [], "id": "tx"})).await;
    let reply = recv(&mut client).await;
    assert_eq!(
        reply,
        json!({"jsonrpc": "2.0", "id": "tx", "error": {"code": -32601, "message": "rpc method is not whitelisted"}})
    );

    // The connection stays usable afterwards.
    send(&mut client, json!({"jsonrpc": "2.0", "method": "eth_chainId", "params": [], "id": 2})).await;
    assert_eq!(recv(&mut client).await["result"], "eth_chainId");

    let received = node.received_messages().await;
    assert!(received.iter().all(|frame| !frame.contains("eth_sendRawTransaction")));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_malformed_client_frame_gets_parse_error() {
    let node = MockWebSocketServer::new().await.unwrap();
    let proxy = WsProxy::start(&node, None).await;
    let mut client = proxy.connect().await;

    client.send(Message::Text("{not json".to_string().into())).await.unwrap();
    let reply = recv(&mut client).await;
    assert_eq!(reply["id"], Value::Null);
    assert_eq!(reply["error"]["code"], -32700);

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_invalid_backend_frame_is_replaced() {
    let node = MockWebSocketServer::new().await.unwrap();
    let proxy = WsProxy::start(&node, None).await;
    let mut client = proxy.connect().await;

    // Round trip first so the backend connection exists before the push.
    send(&mut client, json!({"jsonrpc": "2.0", "method": "eth_chainId", "params": [], "id": 1})).await;
    recv(&mut client).await;

    node.push_text("definitely not json").await;
    let reply = recv(&mut client).await;
    assert_eq!(
        reply,
        json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32603, "message": "backend returned an invalid response"}
        })
    );

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_client_rejected_when_backend_slots_are_full() {
    let node = MockWebSocketServer::new().await.unwrap();
    let proxy = WsProxy::start(&node, Some(1)).await;

    let mut first = proxy.connect().await;
    send(&mut first, json!({"jsonrpc": "2.0", "method": "eth_chainId", "params": [], "id": 1})).await;
    assert_eq!(recv(&mut first).await["result"], "eth_chainId");

    let mut second = proxy.connect().await;
    let rejection = recv(&mut second).await;
    assert_eq!(rejection["id"], Value::Null);
    assert_eq!(rejection["error"]["code"], -32603);
    assert_eq!(rejection["error"]["message"], "no backends available for method");

    // The first client keeps its slot.
    send(&mut first, json!({"jsonrpc": "2.0", "method": "eth_chainId", "params": [], "id": 2})).await;
    assert_eq!(recv(&mut first).await["id"], 2);

    proxy.shutdown().await;
}
