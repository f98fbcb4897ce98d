//! Retry policy for chain connectors.
//!
//! Transient failures (transport, timeout) are retried with exponential backoff
//! and then reported as `ChainUnavailable`. Node errors are returned on first
//! sight since resending the same request cannot change the answer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ethereum_types::{Address, H256};
use tracing::{debug, warn};

use super::{ChainConnector, TxReceipt};
use crate::config::RetryConfig;
use crate::error::{OracleError, OracleResult, RpcError};
use crate::evm_client::EvmLog;

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Delay after the `attempt`-th failure (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

/// A `ChainConnector` with the retry policy applied to every call.
pub struct RetryingConnector {
    inner: Arc<dyn ChainConnector>,
    policy: RetryPolicy,
}

impl RetryingConnector {
    pub fn new(inner: Arc<dyn ChainConnector>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn chain_id(&self) -> u64 {
        self.inner.chain_id()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn with_retry<T, F, Fut>(&self, method: &'static str, mut op: F) -> OracleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let chain_id = self.chain_id();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if attempt >= self.policy.max_attempts {
                        warn!(chain_id, method, attempts = attempt, "Chain unavailable: {}", err);
                        return Err(OracleError::ChainUnavailable {
                            chain_id,
                            attempts: attempt,
                            last_error: err.to_string(),
                        });
                    }
                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        chain_id,
                        method,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient RPC failure, backing off: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(OracleError::Rpc { chain_id, source: err }),
            }
        }
    }

    pub async fn latest_block(&self) -> OracleResult<u64> {
        self.with_retry("eth_blockNumber", || self.inner.latest_block())
            .await
    }

    pub async fn get_logs(
        &self,
        address: Address,
        topic0: H256,
        from_block: u64,
        to_block: u64,
    ) -> OracleResult<Vec<EvmLog>> {
        self.with_retry("eth_getLogs", || {
            self.inner.get_logs(address, topic0, from_block, to_block)
        })
        .await
    }

    pub async fn send_transaction(&self, raw_tx: &[u8]) -> OracleResult<H256> {
        self.with_retry("eth_sendRawTransaction", || {
            self.inner.send_raw_transaction(raw_tx)
        })
        .await
    }

    pub async fn transaction_receipt(&self, tx_hash: H256) -> OracleResult<Option<TxReceipt>> {
        self.with_retry("eth_getTransactionReceipt", || {
            self.inner.transaction_receipt(tx_hash)
        })
        .await
    }

    pub async fn gas_price(&self) -> OracleResult<u64> {
        self.with_retry("eth_gasPrice", || self.inner.gas_price())
            .await
    }

    pub async fn pending_nonce(&self, address: Address) -> OracleResult<u64> {
        self.with_retry("eth_getTransactionCount", || {
            self.inner.pending_nonce(address)
        })
        .await
    }

    pub async fn call(&self, to: Address, data: &[u8]) -> OracleResult<Vec<u8>> {
        self.with_retry("eth_call", || self.inner.call(to, data))
            .await
    }

    /// Receipt of `tx_hash` if it is mined with `confirmations` blocks on top
    /// (the inclusion block counts as the first). Does not wait.
    pub async fn confirmed_receipt(
        &self,
        tx_hash: H256,
        confirmations: u64,
    ) -> OracleResult<Option<TxReceipt>> {
        let Some(receipt) = self.transaction_receipt(tx_hash).await? else {
            return Ok(None);
        };
        let latest = self.latest_block().await?;
        let depth = latest.saturating_sub(receipt.block_number) + 1;
        Ok((depth >= confirmations.max(1)).then_some(receipt))
    }

    /// Waits until `tx_hash` is mined and has `confirmations` blocks on top
    /// (the inclusion block counts as the first).
    ///
    /// # Returns
    ///
    /// * `Ok(TxReceipt)` - Receipt once deep enough (may be a revert)
    /// * `Err(OracleError::Timeout)` - Not confirmed within `timeout`
    pub async fn wait_for_confirmations(
        &self,
        tx_hash: H256,
        confirmations: u64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> OracleResult<TxReceipt> {
        let wait = async {
            loop {
                if let Some(receipt) = self.confirmed_receipt(tx_hash, confirmations).await? {
                    return Ok(receipt);
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout(format!(
                "transaction 0x{} not confirmed on chain {} within {}s",
                hex::encode(tx_hash.as_bytes()),
                self.chain_id(),
                timeout.as_secs()
            ))),
        }
    }
}
