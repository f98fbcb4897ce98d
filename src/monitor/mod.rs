//! Event Monitoring Module
//!
//! Watches one side of a bridge for `TokensBridgingInitiated` events and hands
//! them to the validation engine as `TransferIntent`s.
//!
//! Each side keeps a persisted cursor (last processed block). A tick scans
//! `[cursor + 1, min(tip - confirmation_depth, cursor + max_block_range)]`,
//! hands every valid event over in `(block, log_index)` order and only then
//! moves the cursor. If anything fails before the cursor write, the same range
//! is scanned again on the next tick; handing an intent over twice is harmless.

use std::sync::Arc;

use ethereum_types::{Address, H256, U256};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::connector::RetryingConnector;
use crate::crypto::keccak256;
use crate::error::OracleResult;
use crate::evm_client::{parse_quantity, EvmLog};
use crate::storage::OracleStore;
use crate::types::{parse_address, parse_h256, ChainSide, TransferIntent};
use crate::validator::ValidationEngine;

/// Signature of the bridging-initiated event.
///
/// `TokensBridgingInitiated(address indexed token, address indexed sender,
/// bytes32 indexed messageId, address recipient, uint256 value)`
pub const TRANSFER_EVENT_SIGNATURE: &str =
    "TokensBridgingInitiated(address,address,bytes32,address,uint256)";

/// topic0 of `TRANSFER_EVENT_SIGNATURE`.
pub fn transfer_event_topic() -> H256 {
    H256::from(keccak256(TRANSFER_EVENT_SIGNATURE.as_bytes()))
}

// ============================================================================
// LOG PARSING
// ============================================================================

/// Parses and validates a raw log into a transfer intent.
///
/// topics[0] = event signature, topics[1] = token, topics[2] = sender,
/// topics[3] = messageId; data = abi.encode(recipient, value).
///
/// # Returns
///
/// * `Ok(TransferIntent)` - Well-formed event from the expected contract
/// * `Err(String)` - Why the log was skipped
pub fn parse_transfer_log(
    log: &EvmLog,
    bridge_id: &str,
    side: ChainSide,
    chain_id: u64,
    contract: Address,
) -> Result<TransferIntent, String> {
    if log.removed {
        return Err("log removed by reorg".to_string());
    }
    if parse_address(&log.address)? != contract {
        return Err(format!("log emitted by unexpected contract {}", log.address));
    }
    if log.topics.len() != 4 || parse_h256(&log.topics[0])? != transfer_event_topic() {
        return Err("not a TokensBridgingInitiated event".to_string());
    }

    let token = topic_address(&log.topics[1])?;
    let sender = topic_address(&log.topics[2])?;
    let message_id = parse_h256(&log.topics[3])?;

    let data = hex::decode(log.data.strip_prefix("0x").unwrap_or(&log.data))
        .map_err(|e| format!("invalid log data: {}", e))?;
    if data.len() != 64 {
        return Err(format!("expected 64 bytes of data, got {}", data.len()));
    }
    let recipient = Address::from_slice(&data[12..32]);
    let amount = U256::from_big_endian(&data[32..64]);

    if amount.is_zero() {
        return Err("zero amount".to_string());
    }
    if recipient.is_zero() {
        return Err("zero recipient".to_string());
    }

    let field = |value: &Option<String>, name: &str| {
        value
            .as_deref()
            .ok_or_else(|| format!("pending log without {}", name))
            .map(str::to_string)
    };
    let tx_hash = parse_h256(&field(&log.transaction_hash, "transactionHash")?)?;
    let block_number =
        parse_quantity(&field(&log.block_number, "blockNumber")?).map_err(|e| e.to_string())?;
    let log_index =
        parse_quantity(&field(&log.log_index, "logIndex")?).map_err(|e| e.to_string())?;

    Ok(TransferIntent {
        bridge_id: bridge_id.to_string(),
        source_chain: side,
        source_chain_id: chain_id,
        tx_hash,
        log_index,
        block_number,
        token,
        sender,
        recipient,
        amount,
        message_id,
    })
}

/// Address stored in a 32-byte indexed topic.
fn topic_address(topic: &str) -> Result<Address, String> {
    let word = parse_h256(topic)?;
    if word.as_bytes()[..12].iter().any(|b| *b != 0) {
        return Err(format!("topic {} is not an address", topic));
    }
    Ok(Address::from_slice(&word.as_bytes()[12..]))
}

// ============================================================================
// EVENT WATCHER IMPLEMENTATION
// ============================================================================

/// Result of one watcher tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub latest_block: u64,
    pub safe_tip: u64,
    /// Cursor after the tick
    pub cursor: u64,
    /// Valid events handed over
    pub intents: usize,
    /// False when the safe tip had not moved past the cursor
    pub scanned: bool,
}

/// Watches one side of one bridge.
pub struct EventWatcher {
    bridge: Arc<BridgeConfig>,
    side: ChainSide,
    connector: Arc<RetryingConnector>,
    store: OracleStore,
    engine: Arc<ValidationEngine>,
    contract: Address,
    topic: H256,
}

impl EventWatcher {
    pub fn new(
        bridge: Arc<BridgeConfig>,
        side: ChainSide,
        connector: Arc<RetryingConnector>,
        store: OracleStore,
        engine: Arc<ValidationEngine>,
    ) -> OracleResult<Self> {
        let contract = bridge.side(side).contract_address()?;
        Ok(Self {
            bridge,
            side,
            connector,
            store,
            engine,
            contract,
            topic: transfer_event_topic(),
        })
    }

    pub fn side(&self) -> ChainSide {
        self.side
    }

    /// Current cursor, falling back to the configured start block.
    pub fn cursor(&self) -> OracleResult<u64> {
        Ok(self
            .store
            .cursor(&self.bridge.id, self.side)?
            .unwrap_or(self.bridge.side(self.side).start_block))
    }

    /// Runs one scan.
    pub async fn poll_once(&self) -> OracleResult<TickReport> {
        let chain = self.bridge.side(self.side);
        let cursor = self.cursor()?;
        let latest_block = self.connector.latest_block().await?;
        let safe_tip = latest_block.saturating_sub(chain.confirmation_depth);

        if safe_tip <= cursor {
            debug!(
                bridge = %self.bridge.id,
                side = %self.side,
                cursor,
                safe_tip,
                "Nothing confirmed past cursor"
            );
            return Ok(TickReport {
                latest_block,
                safe_tip,
                cursor,
                intents: 0,
                scanned: false,
            });
        }

        let from_block = cursor + 1;
        let to_block = safe_tip.min(cursor.saturating_add(chain.max_block_range));
        let logs = self
            .connector
            .get_logs(self.contract, self.topic, from_block, to_block)
            .await?;

        let mut intents = Vec::with_capacity(logs.len());
        for log in &logs {
            match parse_transfer_log(log, &self.bridge.id, self.side, chain.chain_id, self.contract)
            {
                Ok(intent) if intent.block_number < from_block || intent.block_number > to_block => {
                    warn!(
                        bridge = %self.bridge.id,
                        side = %self.side,
                        block = intent.block_number,
                        "Log outside requested range, skipping"
                    );
                }
                Ok(intent) => intents.push(intent),
                Err(reason) => warn!(
                    bridge = %self.bridge.id,
                    side = %self.side,
                    tx_hash = log.transaction_hash.as_deref().unwrap_or("?"),
                    "Skipping log: {}",
                    reason
                ),
            }
        }
        intents.sort_by_key(|intent| (intent.block_number, intent.log_index));

        let count = intents.len();
        for intent in intents {
            self.engine.handle_intent(intent).await?;
        }

        self.store.set_cursor(&self.bridge.id, self.side, to_block)?;
        if count > 0 {
            info!(
                bridge = %self.bridge.id,
                side = %self.side,
                from_block,
                to_block,
                intents = count,
                "Processed block range"
            );
        }

        Ok(TickReport {
            latest_block,
            safe_tip,
            cursor: to_block,
            intents: count,
            scanned: true,
        })
    }
}
