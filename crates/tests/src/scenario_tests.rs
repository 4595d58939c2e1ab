//! End-to-end request scenarios through the HTTP router.

use crate::mock_infrastructure::{proxy_config, RpcMockBuilder, TestProxy};
use axum::http::StatusCode;
use serde_json::{json, Value};

const NO_WS: &str = "ws://127.0.0.1:1";

async fn proxy_for(node: &RpcMockBuilder, methods: &[&str]) -> TestProxy {
    TestProxy::start(&proxy_config(&[("node", &node.url(), NO_WS)], methods, "")).await
}

#[tokio::test]
async fn test_static_cache_hit() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_result("eth_chainId", json!("0x420"), 1).await;
    let proxy = proxy_for(&node, &["eth_chainId"]).await;
    let body = r#"{"jsonrpc":"2.0","method":"eth_chainId","id":1,"params":[]}"#;

    let first = proxy.post("/", body).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.cache_status, "MISS");
    assert_eq!(first.body, json!({"jsonrpc": "2.0", "id": 1, "result": "0x420"}));

    let second = proxy.post("/", body).await;
    assert_eq!(second.cache_status, "HIT");
    assert_eq!(second.body, json!({"jsonrpc": "2.0", "id": 1, "result": "0x420"}));

    node.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_cached_response_carries_current_id() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_result("net_version", json!("10"), 1).await;
    let proxy = proxy_for(&node, &["net_version"]).await;

    proxy.post("/", r#"{"jsonrpc":"2.0","method":"net_version","id":1}"#).await;
    let cached = proxy.post("/", r#"{"jsonrpc":"2.0","method":"net_version","id":"abc"}"#).await;
    assert_eq!(cached.cache_status, "HIT");
    assert_eq!(cached.body["id"], "abc");

    node.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_recent_block_not_cached() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_block_by_number(0x63, 2).await;
    let proxy = proxy_for(&node, &["eth_getBlockByNumber"]).await;
    proxy.set_head(0x64).await;
    let body = r#"{"jsonrpc":"2.0","method":"eth_getBlockByNumber","params":["0x63",false],"id":1}"#;

    for _ in 0..2 {
        let response = proxy.post("/", body).await;
        assert_eq!(response.cache_status, "MISS");
        assert_eq!(response.body["result"]["number"], "0x63");
    }

    node.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_old_block_cached() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_block_by_number(0x1, 1).await;
    let proxy = proxy_for(&node, &["eth_getBlockByNumber"]).await;
    proxy.set_head(0x1000).await;
    let body = r#"{"jsonrpc":"2.0","method":"eth_getBlockByNumber","params":["0x1",false],"id":1}"#;

    assert_eq!(proxy.post("/", body).await.cache_status, "MISS");
    let second = proxy.post("/", body).await;
    assert_eq!(second.cache_status, "HIT");
    assert_eq!(second.body["result"]["number"], "0x1");

    node.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_moving_block_tag_never_cached() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_result("eth_getBlockByNumber", json!({"number": "0x1001"}), 2).await;
    let proxy = proxy_for(&node, &["eth_getBlockByNumber"]).await;
    proxy.set_head(0x1000).await;
    let body = r#"{"jsonrpc":"2.0","method":"eth_getBlockByNumber","params":["latest",false],"id":1}"#;

    assert_eq!(proxy.post("/", body).await.cache_status, "MISS");
    assert_eq!(proxy.post("/", body).await.cache_status, "MISS");

    node.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_null_result_not_cached() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_result("eth_getBlockByNumber", Value::Null, 2).await;
    let proxy = proxy_for(&node, &["eth_getBlockByNumber"]).await;
    proxy.set_head(0x1000).await;
    let body = r#"{"jsonrpc":"2.0","method":"eth_getBlockByNumber","params":["0x2",false],"id":1}"#;

    for _ in 0..2 {
        let response = proxy.post("/", body).await;
        assert_eq!(response.cache_status, "MISS");
        assert_eq!(response.body["result"], Value::Null);
    }

    node.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_block_number_served_from_lvc() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_result("eth_blockNumber", json!("0x1"), 0).await;
    let proxy = proxy_for(&node, &["eth_blockNumber"]).await;
    proxy.set_head(0x64).await;

    let response = proxy.post("/", r#"{"jsonrpc":"2.0","method":"eth_blockNumber","id":5}"#).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.cache_status, "HIT");
    assert_eq!(response.body, json!({"jsonrpc": "2.0", "id": 5, "result": "0x64"}));

    node.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_method_not_whitelisted() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_result("subtract", json!(1), 0).await;
    let proxy = proxy_for(&node, &["eth_chainId"]).await;

    let response = proxy.post("/", r#"{"jsonrpc":"2.0","method":"subtract","params":[42,23],"id":999}"#).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(
        response.body,
        json!({"jsonrpc": "2.0", "id": 999, "error": {"code": -32601, "message": "rpc method is not whitelisted"}})
    );

    node.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_malformed_envelope() {
    let node = RpcMockBuilder::new().await;
    let proxy = proxy_for(&node, &["eth_chainId"]).await;

    let response = proxy.post("/", "this ain't an RPC call").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.cache_status, "MISS");
    assert_eq!(
        response.body,
        json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "parse error"}})
    );
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_batch_with_one_bad_element() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_result("eth_chainId", json!("0x420"), 1).await;
    let proxy = proxy_for(&node, &["eth_chainId"]).await;

    let body = r#"[
        {"jsonrpc":"2.0","method":"eth_chainId","params":[],"id":1},
        {"jsonrpc":"2.0","method":"eth_chainId","params":[],"id":[]}
    ]"#;
    let response = proxy.post("/", body).await;
    assert_eq!(response.status, StatusCode::OK);

    let items = response.body.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0], json!({"jsonrpc": "2.0", "id": 1, "result": "0x420"}));
    assert_eq!(items[1]["id"], Value::Null);
    assert_eq!(items[1]["error"]["code"], -32600);

    node.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_batch_preserves_order_and_ids() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_batch(&[("eth_chainId", json!("0x420")), ("eth_gasPrice", json!("0x3b9aca00"))], 1).await;
    let proxy = proxy_for(&node, &["eth_chainId", "eth_gasPrice", "eth_getBalance"]).await;

    let body = r#"[
        {"jsonrpc":"2.0","method":"eth_gasPrice","id":"a"},
        {"jsonrpc":"2.0","method":"eth_sign","id":"b"},
        {"jsonrpc":"2.0","method":"eth_chainId","id":"c"}
    ]"#;
    let response = proxy.post("/", body).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.cache_status, "MISS");

    let ids: Vec<&Value> = response.body.as_array().unwrap().iter().map(|item| &item["id"]).collect();
    assert_eq!(ids, [&json!("a"), &json!("b"), &json!("c")]);
    assert_eq!(response.body[0]["result"], "0x3b9aca00");
    assert_eq!(response.body[1]["error"]["code"], -32601);
    assert_eq!(response.body[2]["result"], "0x420");

    let repeat = proxy.post("/", r#"[{"jsonrpc":"2.0","method":"eth_chainId","id":1}]"#).await;
    assert_eq!(repeat.cache_status, "HIT");

    node.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_batch_too_large() {
    let node = RpcMockBuilder::new().await;
    let proxy = TestProxy::start(&proxy_config(
        &[("node", &node.url(), NO_WS)],
        &["eth_chainId"],
        "[server]\nmax_batch_size = 2\n",
    ))
    .await;

    let call = r#"{"jsonrpc":"2.0","method":"eth_chainId","id":1}"#;
    let response = proxy.post("/", &format!("[{call},{call},{call}]")).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["id"], Value::Null);
    assert_eq!(response.body["error"]["code"], -32005);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_eth_accounts_answered_locally() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_result("eth_accounts", json!(["0x01"]), 0).await;
    let proxy = proxy_for(&node, &["eth_accounts"]).await;

    let response = proxy.post("/", r#"{"jsonrpc":"2.0","method":"eth_accounts","id":3}"#).await;
    assert_eq!(response.body, json!({"jsonrpc": "2.0", "id": 3, "result": []}));

    node.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_authenticated_path() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_result("eth_chainId", json!("0x420"), 1).await;
    let proxy = TestProxy::start(&proxy_config(
        &[("node", &node.url(), NO_WS)],
        &["eth_chainId"],
        "[authentication]\ntoken-1 = \"client-1\"\n",
    ))
    .await;
    let body = r#"{"jsonrpc":"2.0","method":"eth_chainId","id":1}"#;

    let response = proxy.post("/", body).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.body, Value::Null);

    let response = proxy.post("/token-1", body).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["result"], "0x420");

    node.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_metrics_exposition() {
    use server::create_metrics_router;
    use tower::ServiceExt;

    let mut node = RpcMockBuilder::new().await;
    node.mock_result("eth_chainId", json!("0x420"), 1).await;
    let proxy = proxy_for(&node, &["eth_chainId"]).await;
    proxy.post("/", r#"{"jsonrpc":"2.0","method":"eth_chainId","id":1}"#).await;

    let metrics = create_metrics_router(proxy.runtime().components().metrics_collector().clone());
    let request = axum::http::Request::builder().uri("/").body(axum::body::Body::empty()).unwrap();
    let response = metrics.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("proxyd_http_requests_total"));
    assert!(text.contains("proxyd_rpc_backend_requests_total"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_upstream_batches_split_at_max_size() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_batch(&[("eth_gasPrice", json!("0x1")), ("net_peerCount", json!("0x2"))], 2).await;
    node.mock_result("eth_syncing", json!(false), 1).await;
    let proxy = TestProxy::start(&proxy_config(
        &[("node", &node.url(), NO_WS)],
        &["eth_gasPrice", "net_peerCount", "eth_syncing"],
        "[server]\nmax_upstream_batch_size = 2\nenable_served_by_header = true\n",
    ))
    .await;

    let body = r#"[
        {"jsonrpc":"2.0","method":"eth_gasPrice","id":1},
        {"jsonrpc":"2.0","method":"net_peerCount","id":2},
        {"jsonrpc":"2.0","method":"net_peerCount","id":3},
        {"jsonrpc":"2.0","method":"eth_gasPrice","id":4},
        {"jsonrpc":"2.0","method":"eth_syncing","id":5}
    ]"#;
    let response = proxy.post("/", body).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.served_by.as_deref(), Some("main/node"));

    let items = response.body.as_array().unwrap();
    let ids: Vec<&Value> = items.iter().map(|item| &item["id"]).collect();
    assert_eq!(ids, [&json!(1), &json!(2), &json!(3), &json!(4), &json!(5)]);
    let results: Vec<&Value> = items.iter().map(|item| &item["result"]).collect();
    assert_eq!(results, [&json!("0x1"), &json!("0x2"), &json!("0x2"), &json!("0x1"), &json!(false)]);

    node.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_client_rate_limits() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_result("eth_chainId", json!("0x420"), 1).await;
    node.mock_result("eth_estimateGas", json!("0x5208"), 1).await;
    let proxy = TestProxy::start(&proxy_config(
        &[("node", &node.url(), NO_WS)],
        &["eth_chainId", "eth_estimateGas"],
        r#"
[rate_limit]
base_rate = 3
base_interval_seconds = 3600
exempt_user_agents = ["^internal-monitor"]

[rate_limit.method_overrides.eth_estimateGas]
limit = 1
interval_seconds = 3600
"#,
    ))
    .await;
    let client = [("x-forwarded-for", "198.51.100.20")];
    let estimate = r#"{"jsonrpc":"2.0","method":"eth_estimateGas","params":[{}],"id":9}"#;

    let response = proxy.post_with_headers("/", estimate, &client).await;
    assert_eq!(response.body["result"], "0x5208");

    let response = proxy.post_with_headers("/", estimate, &client).await;
    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.body["id"], 9);
    assert_eq!(response.body["error"]["code"], -32016);

    let chain_id = r#"{"jsonrpc":"2.0","method":"eth_chainId","id":1}"#;
    let response = proxy.post_with_headers("/", chain_id, &client).await;
    assert_eq!(response.body["result"], "0x420");

    let response = proxy.post_with_headers("/", chain_id, &client).await;
    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.body["id"], Value::Null);

    let monitor = [("x-forwarded-for", "198.51.100.20"), ("user-agent", "internal-monitor/2")];
    let response = proxy.post_with_headers("/", chain_id, &monitor).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.cache_status, "HIT");

    let response = proxy.post("/", chain_id).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["error"]["message"], "request does not include a remote IP");

    node.assert_all().await;
    proxy.shutdown().await;
}
