//! Mock JSON-RPC backends.
//!
//! Wraps mockito with matchers keyed on the JSON-RPC method so a test can count how many
//! requests for each method reached the backend. Method mocks only match single-object
//! bodies; upstream batches are answered by [`RpcMockBuilder::mock_batch`].

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Value};

/// Builder for a mock Ethereum node answering over HTTP.
pub struct RpcMockBuilder {
    server: ServerGuard,
    mocks: Vec<Mock>,
}

fn single_object() -> Matcher {
    Matcher::Regex(r"^\s*\{".to_string())
}

fn method_matcher(method: &str) -> Matcher {
    Matcher::AllOf(vec![single_object(), Matcher::Regex(format!(r#""method"\s*:\s*"{method}""#))])
}

/// Answers each element of a JSON batch body by method, echoing its id, in reverse order.
fn answer_batch(body: &[u8], results: &[(String, Value)]) -> Vec<u8> {
    let calls: Vec<Value> = serde_json::from_slice(body).unwrap_or_default();
    let answers: Vec<Value> = calls
        .iter()
        .rev()
        .map(|call| {
            let result = results
                .iter()
                .find(|(method, _)| call["method"] == method.as_str())
                .map_or(Value::Null, |(_, result)| result.clone());
            json!({"jsonrpc": "2.0", "id": call["id"], "result": result})
        })
        .collect();
    serde_json::to_vec(&answers).unwrap_or_default()
}

impl RpcMockBuilder {
    /// Creates a builder with a fresh mockito server.
    pub async fn new() -> Self {
        Self { server: Server::new_async().await, mocks: Vec::new() }
    }

    /// Returns the URL of the mock server.
    #[must_use]
    pub fn url(&self) -> String {
        self.server.url()
    }

    /// Answers `method` with `result`, expecting exactly `hits` requests.
    pub async fn mock_result(&mut self, method: &str, result: Value, hits: usize) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": result}).to_string())
            .expect(hits)
            .create_async()
            .await;

        self.mocks.push(mock);
        self
    }

    /// Answers JSON batch bodies, each element by its method from `results`, expecting exactly
    /// `hits` batches. Elements come back in reverse order so callers must match them by id.
    pub async fn mock_batch(&mut self, results: &[(&str, Value)], hits: usize) -> &mut Self {
        let results: Vec<(String, Value)> =
            results.iter().map(|(method, result)| ((*method).to_string(), result.clone())).collect();
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(Matcher::Regex(r"^\s*\[".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(move |request| {
                request.body().map(|body| answer_batch(body, &results)).unwrap_or_default()
            })
            .expect(hits)
            .create_async()
            .await;

        self.mocks.push(mock);
        self
    }

    /// Answers `eth_getBlockByNumber` for `block_number`, expecting exactly `hits` requests.
    pub async fn mock_block_by_number(&mut self, block_number: u64, hits: usize) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(Matcher::AllOf(vec![
                single_object(),
                Matcher::Regex(format!(
                    r#""method"\s*:\s*"eth_getBlockByNumber".*"params"\s*:\s*\["0x{block_number:x}""#
                )),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": block(block_number)}).to_string())
            .expect(hits)
            .create_async()
            .await;

        self.mocks.push(mock);
        self
    }

    /// Fails every request for `method` with HTTP `status`, expecting exactly `hits` requests.
    pub async fn mock_http_error(&mut self, method: &str, status: usize, hits: usize) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(status)
            .with_body("upstream unavailable")
            .expect(hits)
            .create_async()
            .await;

        self.mocks.push(mock);
        self
    }

    /// Replies to `method` with a body that is not JSON, expecting exactly `hits` requests.
    pub async fn mock_garbage(&mut self, method: &str, hits: usize) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(200)
            .with_body("<html>bad gateway</html>")
            .expect(hits)
            .create_async()
            .await;

        self.mocks.push(mock);
        self
    }

    /// Asserts every registered mock saw exactly its expected number of requests.
    pub async fn assert_all(&self) {
        for mock in &self.mocks {
            mock.assert_async().await;
        }
    }
}

/// A minimal block object as returned by `eth_getBlockByNumber`.
#[must_use]
pub fn block(block_number: u64) -> Value {
    json!({
        "number": format!("0x{block_number:x}"),
        "hash": format!("0x{block_number:064x}"),
        "parentHash": format!("0x{:064x}", block_number.saturating_sub(1)),
        "timestamp": format!("0x{:x}", 1_600_000_000 + block_number),
        "gasLimit": "0x1c9c380",
        "gasUsed": "0x0",
        "transactions": []
    })
}

