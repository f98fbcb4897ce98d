//! EVM Client Module
//!
//! This module provides a client for communicating with EVM-compatible blockchain nodes
//! via their JSON-RPC API. It implements the `ChainConnector` contract: block height,
//! log queries, raw transaction submission, receipts, gas price, nonces and view calls.
//!
//! Errors are classified as they come back from the node so that the retry layer can
//! tell a flaky endpoint (transport failure, timeout, 5xx) from a definitive answer
//! (JSON-RPC error object).

use std::time::Duration;

use async_trait::async_trait;
use ethereum_types::{Address, H256};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connector::{ChainConnector, TxReceipt};
use crate::error::RpcError;
use crate::types::{hex_address, hex_h256, parse_h256};

// ============================================================================
// API RESPONSE STRUCTURES
// ============================================================================

/// EVM JSON-RPC request wrapper
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Vec<serde_json::Value>,
    id: u64,
}

/// EVM JSON-RPC response wrapper
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// EVM event log entry
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct EvmLog {
    /// Address of the contract that emitted the event
    pub address: String,
    /// Array of topics (indexed event parameters)
    pub topics: Vec<String>,
    /// Event data (non-indexed parameters)
    pub data: String,
    /// Block number (null for pending logs)
    #[serde(rename = "blockNumber", default)]
    pub block_number: Option<String>,
    #[serde(rename = "transactionHash", default)]
    pub transaction_hash: Option<String>,
    #[serde(rename = "logIndex", default)]
    pub log_index: Option<String>,
    /// True when the log was dropped by a reorg
    #[serde(default)]
    pub removed: bool,
}

/// Receipt fields the oracle relies on
#[derive(Debug, Deserialize)]
struct RawReceipt {
    #[serde(rename = "transactionHash")]
    transaction_hash: String,
    #[serde(rename = "blockNumber", default)]
    block_number: Option<String>,
    /// "0x1" = success, "0x0" = failure
    #[serde(default)]
    status: Option<String>,
}

/// Parses a 0x-prefixed hex quantity.
pub fn parse_quantity(value: &str) -> Result<u64, RpcError> {
    u64::from_str_radix(value.strip_prefix("0x").unwrap_or(value), 16)
        .map_err(|e| RpcError::InvalidResponse(format!("invalid quantity {}: {}", value, e)))
}

// ============================================================================
// EVM CLIENT IMPLEMENTATION
// ============================================================================

/// Client for communicating with EVM-compatible blockchain nodes via JSON-RPC
pub struct EvmClient {
    /// HTTP client for making requests
    client: Client,
    /// Base URL of the EVM node (e.g., "http://127.0.0.1:8545")
    base_url: String,
    chain_id: u64,
}

impl EvmClient {
    /// Creates a new EVM client for the given node URL
    ///
    /// # Arguments
    ///
    /// * `node_url` - Base URL of the EVM node (e.g., "http://127.0.0.1:8545")
    /// * `chain_id` - EIP-155 chain id served by the node
    /// * `timeout` - Per-request HTTP timeout
    pub fn new(node_url: &str, chain_id: u64, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: node_url.to_string(),
            chain_id,
        })
    }

    /// Returns the base URL of this client
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Generic JSON-RPC call helper.
    ///
    /// A JSON-RPC `error` object becomes `RpcError::Node`; anything that kept the
    /// request from being answered becomes `Transport` or `Timeout`.
    async fn json_rpc<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T, RpcError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let response = self
            .client
            .post(&self.base_url)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Transport(format!(
                "{} returned HTTP {} for {}",
                self.base_url, status, method
            )));
        }

        let response: JsonRpcResponse = response.json().await?;

        if let Some(error) = response.error {
            debug!(
                chain_id = self.chain_id,
                method,
                code = error.code,
                "JSON-RPC error: {}",
                error.message
            );
            return Err(RpcError::Node {
                code: error.code,
                message: error.message,
            });
        }

        let result = response.result.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(result).map_err(|e| {
            RpcError::InvalidResponse(format!("failed to deserialize {} result: {}", method, e))
        })
    }

    async fn quantity(&self, method: &str, params: Vec<serde_json::Value>) -> Result<u64, RpcError> {
        let value: String = self.json_rpc(method, params).await?;
        parse_quantity(&value)
    }
}

#[async_trait]
impl ChainConnector for EvmClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn latest_block(&self) -> Result<u64, RpcError> {
        self.quantity("eth_blockNumber", vec![]).await
    }

    async fn get_logs(
        &self,
        address: Address,
        topic0: H256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<EvmLog>, RpcError> {
        let filter = serde_json::json!({
            "address": hex_address(&address),
            "topics": [hex_h256(&topic0)],
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
        });
        let logs: Option<Vec<EvmLog>> = self.json_rpc("eth_getLogs", vec![filter]).await?;
        Ok(logs.unwrap_or_default())
    }

    async fn send_raw_transaction(&self, raw_tx: &[u8]) -> Result<H256, RpcError> {
        let raw_tx = format!("0x{}", hex::encode(raw_tx));
        let tx_hash: String = self
            .json_rpc("eth_sendRawTransaction", vec![serde_json::json!(raw_tx)])
            .await?;
        parse_h256(&tx_hash).map_err(RpcError::InvalidResponse)
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, RpcError> {
        let receipt: Option<RawReceipt> = self
            .json_rpc(
                "eth_getTransactionReceipt",
                vec![serde_json::json!(hex_h256(&tx_hash))],
            )
            .await?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        // Receipts without a block are still pending on some nodes
        let Some(block_number) = receipt.block_number.as_deref() else {
            return Ok(None);
        };

        Ok(Some(TxReceipt {
            transaction_hash: parse_h256(&receipt.transaction_hash)
                .map_err(RpcError::InvalidResponse)?,
            block_number: parse_quantity(block_number)?,
            success: receipt.status.as_deref() == Some("0x1"),
        }))
    }

    async fn gas_price(&self) -> Result<u64, RpcError> {
        self.quantity("eth_gasPrice", vec![]).await
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, RpcError> {
        self.quantity(
            "eth_getTransactionCount",
            vec![
                serde_json::json!(hex_address(&address)),
                serde_json::json!("pending"),
            ],
        )
        .await
    }

    async fn call(&self, to: Address, data: &[u8]) -> Result<Vec<u8>, RpcError> {
        let result: String = self
            .json_rpc(
                "eth_call",
                vec![
                    serde_json::json!({
                        "to": hex_address(&to),
                        "data": format!("0x{}", hex::encode(data)),
                    }),
                    serde_json::json!("latest"),
                ],
            )
            .await?;
        hex::decode(result.strip_prefix("0x").unwrap_or(&result))
            .map_err(|e| RpcError::InvalidResponse(format!("invalid eth_call result: {}", e)))
    }
}
