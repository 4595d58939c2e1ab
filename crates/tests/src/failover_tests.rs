//! Backend retries, quarantine, failover and capacity limits.

use crate::mock_infrastructure::{proxy_config, RpcMockBuilder, TestProxy};
use axum::http::StatusCode;
use proxyd_core::config::AppConfig;
use serde_json::json;

const NO_WS: &str = "ws://127.0.0.1:1";
const SEND_TX: &str = r#"{"jsonrpc":"2.0","method":"eth_sendRawTransaction","params":["0xdeadbeef"],"id":1}"#;

async fn metrics_text(proxy: &TestProxy) -> String {
    proxy.runtime().components().metrics_collector().get_prometheus_metrics()
}

#[tokio::test]
async fn test_backend_failover_and_quarantine() {
    let mut primary = RpcMockBuilder::new().await;
    primary.mock_http_error("eth_sendRawTransaction", 500, 1).await;
    let mut secondary = RpcMockBuilder::new().await;
    secondary.mock_result("eth_sendRawTransaction", json!("0xabc"), 2).await;

    let proxy = TestProxy::start(&proxy_config(
        &[("failover_a", &primary.url(), NO_WS), ("failover_b", &secondary.url(), NO_WS)],
        &["eth_sendRawTransaction"],
        "",
    ))
    .await;

    let first = proxy.post("/", SEND_TX).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.body, json!({"jsonrpc": "2.0", "id": 1, "result": "0xabc"}));

    let second = proxy.post("/", SEND_TX).await;
    assert_eq!(second.body["result"], "0xabc");

    primary.assert_all().await;
    secondary.assert_all().await;
    assert!(metrics_text(&proxy).await.contains(r#"proxyd_backend_permanent_errors_total{backend_name="failover_a"}"#));
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_failover_stops_at_first_success() {
    let mut a = RpcMockBuilder::new().await;
    a.mock_http_error("eth_sendRawTransaction", 503, 1).await;
    let mut b = RpcMockBuilder::new().await;
    b.mock_result("eth_sendRawTransaction", json!("0xb"), 1).await;
    let mut c = RpcMockBuilder::new().await;
    c.mock_result("eth_sendRawTransaction", json!("0xc"), 0).await;

    let proxy = TestProxy::start(&proxy_config(
        &[("chain_a", &a.url(), NO_WS), ("chain_b", &b.url(), NO_WS), ("chain_c", &c.url(), NO_WS)],
        &["eth_sendRawTransaction"],
        "",
    ))
    .await;

    let response = proxy.post("/", SEND_TX).await;
    assert_eq!(response.body["result"], "0xb");

    a.assert_all().await;
    b.assert_all().await;
    c.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_retries_before_quarantine() {
    let mut flaky = RpcMockBuilder::new().await;
    flaky.mock_http_error("eth_sendRawTransaction", 502, 2).await;

    let mut config = AppConfig::from_toml(&proxy_config(
        &[("retry_a", &flaky.url(), NO_WS)],
        &["eth_sendRawTransaction"],
        "",
    ))
    .unwrap();
    config.backend.backend_retries = 1;
    let proxy = TestProxy::start_with_config(config).await;

    let first = proxy.post("/", SEND_TX).await;
    assert_eq!(first.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        first.body,
        json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32603, "message": "no backends available for method"}})
    );

    // Quarantined: answered without another backend call.
    let second = proxy.post("/", SEND_TX).await;
    assert_eq!(second.status, StatusCode::SERVICE_UNAVAILABLE);

    flaky.assert_all().await;
    let metrics = metrics_text(&proxy).await;
    assert!(metrics.contains("proxyd_unserviceable_requests_total"));
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_bad_response_fails_over_without_quarantine() {
    let mut broken = RpcMockBuilder::new().await;
    broken.mock_garbage("eth_sendRawTransaction", 2).await;
    let mut healthy = RpcMockBuilder::new().await;
    healthy.mock_result("eth_sendRawTransaction", json!("0x1"), 2).await;

    let proxy = TestProxy::start(&proxy_config(
        &[("garbage_a", &broken.url(), NO_WS), ("garbage_b", &healthy.url(), NO_WS)],
        &["eth_sendRawTransaction"],
        "",
    ))
    .await;

    for _ in 0..2 {
        assert_eq!(proxy.post("/", SEND_TX).await.body["result"], "0x1");
    }

    broken.assert_all().await;
    healthy.assert_all().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_backend_error_envelope_is_passed_through() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"nonce too low"}}"#)
        .expect(1)
        .create_async()
        .await;

    let proxy =
        TestProxy::start(&proxy_config(&[("rpc_error", &server.url(), NO_WS)], &["eth_sendRawTransaction"], ""))
            .await;

    let response = proxy.post("/", SEND_TX).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["error"]["code"], -32000);
    assert_eq!(response.body["error"]["message"], "nonce too low");

    mock.assert_async().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_over_capacity_backend_is_skipped() {
    let mut limited = mockito::Server::new_async().await;
    let limited_mock = limited
        .mock("POST", "/")
        .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0xa"}"#)
        .expect_at_least(1)
        .create_async()
        .await;
    let mut spare = mockito::Server::new_async().await;
    let spare_mock = spare
        .mock("POST", "/")
        .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0xb"}"#)
        .expect_at_least(1)
        .create_async()
        .await;

    let mut config = AppConfig::from_toml(&proxy_config(
        &[("capacity_a", &limited.url(), NO_WS), ("capacity_b", &spare.url(), NO_WS)],
        &["eth_sendRawTransaction"],
        "",
    ))
    .unwrap();
    if let Some(backend) = config.backends.get_mut("capacity_a") {
        backend.max_rps = Some(1);
    }
    let proxy = TestProxy::start_with_config(config).await;

    let mut results = Vec::new();
    for _ in 0..3 {
        results.push(proxy.post("/", SEND_TX).await.body["result"].clone());
    }
    assert_eq!(results[0], "0xa");
    assert!(results.contains(&json!("0xb")));

    limited_mock.assert_async().await;
    spare_mock.assert_async().await;
    proxy.shutdown().await;
}
