use crate::errors::{ExtractorError, ExtractorResult};
use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Read access to a node. Everything the core reads goes through `eth_call`.
#[async_trait]
pub trait NodeClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// `eth_call` at `block`, or at the latest block when `None`.
    async fn eth_call(&self, to: Address, data: Bytes, block: Option<u64>) -> ExtractorResult<Bytes>;

    async fn block_number(&self) -> ExtractorResult<u64>;
}

/// JSON-RPC node client over HTTP.
#[derive(Debug)]
pub struct HttpNodeClient {
    chain_id: u64,
    http_client: reqwest::Client,
    rpc_url: String,
    request_id: AtomicU64,
}

impl HttpNodeClient {
    pub fn new(chain_id: u64, rpc_url: String, timeout: Duration) -> eyre::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| eyre::eyre!("Failed to create HTTP client: {}", e))?;

        Ok(Self { chain_id, http_client, rpc_url, request_id: AtomicU64::new(1) })
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    async fn request(&self, method: &str, params: Value) -> ExtractorResult<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let request_body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id
        });
        trace!("{} request {}", method, id);

        let response = self.http_client.post(&self.rpc_url).header("Content-Type", "application/json").json(&request_body).send().await?;

        let response_json: Value = response.json().await?;
        parse_rpc_response(response_json)
    }
}

/// Splits a JSON-RPC envelope into its result or a read error.
fn parse_rpc_response(mut response_json: Value) -> ExtractorResult<Value> {
    if let Some(error) = response_json.get("error") {
        // Execution reverts come back as RPC errors carrying a `data` field.
        let message = error.get("message").and_then(|m| m.as_str()).unwrap_or_default();
        if message.contains("revert") {
            return Err(ExtractorError::Decode(format!("RPC error: {error}")));
        }
        return Err(ExtractorError::TransientRead(format!("RPC error: {error}")));
    }
    response_json
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| ExtractorError::TransientRead("Missing result in RPC response".to_string()))
}

fn block_param(block: Option<u64>) -> String {
    match block {
        Some(num) => format!("0x{num:x}"),
        None => "latest".to_string(),
    }
}

fn parse_hex_bytes(value: &Value) -> ExtractorResult<Bytes> {
    let result = value.as_str().ok_or_else(|| ExtractorError::Decode(format!("expected hex string, got {value}")))?;
    let bytes = hex::decode(result.trim_start_matches("0x")).map_err(|e| ExtractorError::Decode(e.to_string()))?;
    Ok(bytes.into())
}

fn parse_hex_u64(value: &Value) -> ExtractorResult<u64> {
    let result = value.as_str().ok_or_else(|| ExtractorError::Decode(format!("expected hex quantity, got {value}")))?;
    u64::from_str_radix(result.trim_start_matches("0x"), 16).map_err(|e| ExtractorError::Decode(e.to_string()))
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn eth_call(&self, to: Address, data: Bytes, block: Option<u64>) -> ExtractorResult<Bytes> {
        let params = serde_json::json!([
            {
                "to": format!("{:#x}", to),
                "data": format!("{:#x}", data)
            },
            block_param(block)
        ]);
        let result = self.request("eth_call", params).await?;
        parse_hex_bytes(&result)
    }

    async fn block_number(&self) -> ExtractorResult<u64> {
        let result = self.request("eth_blockNumber", serde_json::json!([])).await?;
        parse_hex_u64(&result)
    }
}
