//! Chain Connector Module
//!
//! Narrow, typed interface to a chain family. The oracle only talks to chains
//! through `ChainConnector`; the EVM JSON-RPC implementation lives in
//! `evm_client`. Connectors are shared by chain id through `ConnectorPool`, and
//! every connector handed out by the pool is wrapped in the retry policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethereum_types::{Address, H256};

use crate::config::Config;
use crate::error::{OracleError, OracleResult, RpcError};
use crate::evm_client::{EvmClient, EvmLog};
use crate::types::ChainSide;

mod retry;

pub use retry::{RetryPolicy, RetryingConnector};

/// Outcome of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub transaction_hash: H256,
    pub block_number: u64,
    /// False when the transaction reverted
    pub success: bool,
}

/// Raw chain access for one chain id.
///
/// Implementations perform exactly one request per call and report failures
/// unretried; retry and backoff are applied by `RetryingConnector`.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Current block height.
    async fn latest_block(&self) -> Result<u64, RpcError>;

    /// Logs emitted by `address` with first topic `topic0` in `[from_block, to_block]`.
    async fn get_logs(
        &self,
        address: Address,
        topic0: H256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<EvmLog>, RpcError>;

    /// Broadcasts a signed transaction and returns its hash.
    async fn send_raw_transaction(&self, raw_tx: &[u8]) -> Result<H256, RpcError>;

    /// Receipt of a mined transaction, `None` while pending or unknown.
    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, RpcError>;

    /// Node's suggested gas price in wei.
    async fn gas_price(&self) -> Result<u64, RpcError>;

    /// Next nonce for `address`, counting pending transactions.
    async fn pending_nonce(&self, address: Address) -> Result<u64, RpcError>;

    /// Read-only contract call against the latest block.
    async fn call(&self, to: Address, data: &[u8]) -> Result<Vec<u8>, RpcError>;
}

/// Connectors indexed by chain id.
#[derive(Clone, Default)]
pub struct ConnectorPool {
    connectors: HashMap<u64, Arc<RetryingConnector>>,
}

impl ConnectorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one EVM connector per distinct chain id of the bridge table.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let policy = RetryPolicy::from_config(&config.retry);
        let timeout = Duration::from_millis(config.oracle.rpc_timeout_ms);
        let mut pool = Self::new();

        for bridge in &config.bridges {
            for side in ChainSide::BOTH {
                let chain = bridge.side(side);
                if pool.connectors.contains_key(&chain.chain_id) {
                    continue;
                }
                let client = EvmClient::new(&chain.rpc_url, chain.chain_id, timeout)?;
                tracing::info!(
                    chain_id = chain.chain_id,
                    rpc_url = client.base_url(),
                    "Registered EVM connector for {}",
                    chain.name
                );
                pool.insert(Arc::new(client), policy.clone());
            }
        }
        Ok(pool)
    }

    /// Registers a connector under its own chain id.
    pub fn insert(&mut self, connector: Arc<dyn ChainConnector>, policy: RetryPolicy) {
        let chain_id = connector.chain_id();
        self.connectors
            .insert(chain_id, Arc::new(RetryingConnector::new(connector, policy)));
    }

    /// Looks up the connector of a chain.
    pub fn get(&self, chain_id: u64) -> OracleResult<Arc<RetryingConnector>> {
        self.connectors
            .get(&chain_id)
            .cloned()
            .ok_or(OracleError::UnknownChain(chain_id))
    }
}
