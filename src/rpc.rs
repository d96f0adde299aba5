//! JSON-RPC client for Ethereum nodes
//!
//! [`RpcClient`] is the capability the watcher depends on. [`HttpRpcClient`]
//! implements it over HTTP; tests substitute their own implementation.

use crate::error::WatchError;
use crate::types::{Block, Transaction};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Chain data source used by the watcher.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Current chain head as a `0x` hex quantity.
    async fn get_current_block_number(&self) -> Result<String>;

    /// Block hash and transaction hashes for a `0x` hex block number.
    async fn get_block_by_number(&self, number: &str) -> Result<Block>;

    async fn get_transaction_by_hash(&self, hash: &str) -> Result<Transaction>;
}

/// JSON-RPC client for Ethereum nodes.
pub struct HttpRpcClient {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    /// Create a new RPC client.
    ///
    /// A zero `timeout` falls back to [`DEFAULT_RPC_TIMEOUT`].
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, WatchError> {
        let url = url.into();
        if url.is_empty() {
            return Err(WatchError::MissingField("rpc_endpoint"));
        }

        let timeout = if timeout.is_zero() {
            DEFAULT_RPC_TIMEOUT
        } else {
            timeout
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WatchError::rpc("client setup", e.into()))?;

        Ok(Self {
            client,
            url,
            next_id: AtomicU64::new(1),
        })
    }

    /// Make a JSON-RPC call.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", method))?;

        let json: Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", method))?;

        extract_result(json, id)
    }
}

/// Pull `result` out of a JSON-RPC response envelope.
fn extract_result(mut json: Value, id: u64) -> Result<Value> {
    // Check for RPC error
    if let Some(error) = json.get("error") {
        anyhow::bail!("RPC error: {}", error);
    }

    let got = json.get("id").and_then(Value::as_u64);
    if got != Some(id) {
        anyhow::bail!("id mismatch: got {:?}, want {}", got, id);
    }

    json.get_mut("result")
        .map(Value::take)
        .context("RPC response missing 'result' field")
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn get_current_block_number(&self) -> Result<String> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        result
            .as_str()
            .map(str::to_string)
            .context("Block number response is not a string")
    }

    async fn get_block_by_number(&self, number: &str) -> Result<Block> {
        let result = self
            .call("eth_getBlockByNumber", json!([number, false]))
            .await?;
        if result.is_null() {
            anyhow::bail!("Block {} not available", number);
        }
        serde_json::from_value(result).context("Failed to deserialize block")
    }

    async fn get_transaction_by_hash(&self, hash: &str) -> Result<Transaction> {
        let result = self
            .call("eth_getTransactionByHash", json!([hash]))
            .await?;
        if result.is_null() {
            anyhow::bail!("Transaction {} not available", hash);
        }
        serde_json::from_value(result).context("Failed to deserialize transaction")
    }
}
