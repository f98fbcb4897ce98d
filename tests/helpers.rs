//! Shared test helpers
//!
//! This module provides helpers used by the integration tests.
//!
//! The module is organized into several categories:
//! - **Keys**: Deterministic validator and relayer keys
//! - **Configuration Builders**: Bridges and full configs wired to the mock chains
//! - **Mock Chain**: A scripted, in-memory `ChainConnector`
//! - **Event Creators**: Transfer intents and raw `TokensBridgingInitiated` logs

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bridge_oracle::config::{
    ApiConfig, BridgeConfig, ChainSideConfig, Config, HealthConfig, OracleConfig, OracleMode,
    RelayConfig, RetryConfig, SignatureScheme, StorageConfig, ValidatorConfig,
};
use bridge_oracle::connector::{ChainConnector, ConnectorPool, RetryPolicy, TxReceipt};
use bridge_oracle::crypto::CryptoService;
use bridge_oracle::error::RpcError;
use bridge_oracle::evm_client::{parse_quantity, EvmLog};
use bridge_oracle::monitor::transfer_event_topic;
use bridge_oracle::relay::tx::raw_transaction_hash;
use bridge_oracle::types::{
    hex_address, hex_h256, Attestation, ChainSide, JobStatus, RelayJob, TransferIntent,
};
use ethereum_types::{Address, H256, U256};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default bridge id used by single-bridge tests
pub const BRIDGE_ID: &str = "polis-bsc";

pub const HOME_CHAIN_ID: u64 = 333999;
pub const FOREIGN_CHAIN_ID: u64 = 56;

/// Bridge contract on the home side
pub const HOME_CONTRACT: &str = "0x1111111111111111111111111111111111111111";
/// Bridge contract on the foreign side
pub const FOREIGN_CONTRACT: &str = "0x2222222222222222222222222222222222222222";

/// Gas price floor of the foreign side (gwei)
pub const FOREIGN_GAS_FLOOR_GWEI: u64 = 5;

/// Seed of the key used by the relayer in dispatcher tests
pub const RELAYER_SEED: u8 = 0x77;

// ============================================================================
// KEYS
// ============================================================================

/// Deterministic key derived from a one-byte seed.
pub fn test_key(seed: u8) -> CryptoService {
    CryptoService::from_secret_bytes(&[seed; 32]).expect("Seed should be a valid secret")
}

/// secp256k1 validator entry for the key of `seed`.
pub fn secp_validator(id: &str, seed: u8) -> ValidatorConfig {
    ValidatorConfig {
        id: id.to_string(),
        scheme: SignatureScheme::Secp256k1,
        public_key: hex_address(&test_key(seed).ethereum_address()),
    }
}

/// ed25519 validator entry for the key of `seed`.
pub fn ed_validator(id: &str, seed: u8) -> ValidatorConfig {
    ValidatorConfig {
        id: id.to_string(),
        scheme: SignatureScheme::Ed25519,
        public_key: test_key(seed).get_public_key(),
    }
}

/// The standard validator set: A, B and C (secp256k1, seeds 1 to 3).
pub fn validators_abc() -> Vec<ValidatorConfig> {
    vec![
        secp_validator("A", 1),
        secp_validator("B", 2),
        secp_validator("C", 3),
    ]
}

/// Attestation by the key of `seed` over the intent's canonical payload.
pub fn sign_attestation(
    intent: &TransferIntent,
    signer_id: &str,
    seed: u8,
    scheme: SignatureScheme,
) -> Attestation {
    Attestation {
        message_id: intent.message_id,
        signer_id: signer_id.to_string(),
        signature: test_key(seed)
            .sign_payload(scheme, &intent.canonical_payload())
            .expect("Signing should succeed"),
    }
}

// ============================================================================
// CONFIGURATION BUILDERS
// ============================================================================

fn side_config(name: &str, chain_id: u64, contract: &str, port: u16) -> ChainSideConfig {
    ChainSideConfig {
        name: name.to_string(),
        chain_id,
        bridge_contract_addr: contract.to_string(),
        start_block: 0,
        rpc_url: format!("http://127.0.0.1:{}", port),
        gas_price_floor_gwei: None,
        confirmation_depth: 2,
        confirmations: 1,
        max_block_range: 100,
    }
}

/// Bridge between `home_chain_id` and `foreign_chain_id` using the standard contracts.
pub fn test_bridge_on(
    id: &str,
    home_chain_id: u64,
    foreign_chain_id: u64,
    validators: Vec<ValidatorConfig>,
    required_signatures: usize,
) -> BridgeConfig {
    let mut foreign = side_config(
        "foreign",
        foreign_chain_id,
        FOREIGN_CONTRACT,
        8000 + (foreign_chain_id % 1000) as u16,
    );
    foreign.gas_price_floor_gwei = Some(FOREIGN_GAS_FLOOR_GWEI);
    BridgeConfig {
        id: id.to_string(),
        required_signatures,
        validators,
        home: side_config(
            "home",
            home_chain_id,
            HOME_CONTRACT,
            9000 + (home_chain_id % 1000) as u16,
        ),
        foreign,
    }
}

/// The default bridge: A, B, C with the given quorum.
pub fn test_bridge(required_signatures: usize) -> BridgeConfig {
    test_bridge_on(
        BRIDGE_ID,
        HOME_CHAIN_ID,
        FOREIGN_CHAIN_ID,
        validators_abc(),
        required_signatures,
    )
}

/// Full configuration around `bridges`.
pub fn build_test_config(
    mode: OracleMode,
    validator_id: Option<&str>,
    bridges: Vec<BridgeConfig>,
) -> Config {
    Config {
        oracle: OracleConfig {
            mode,
            validator_id: validator_id.map(str::to_string),
            private_key_env: "TEST_ORACLE_PRIVATE_KEY".to_string(),
            polling_interval_ms: 10,
            rpc_timeout_ms: 1_000,
            peers: vec![],
            relay_enabled: false,
            quorum_timeout_secs: 600,
            inbox_capacity: 100,
            inbox_ttl_secs: 3_600,
            pause_after_failures: 3,
            pause_secs: 60,
        },
        retry: RetryConfig::default(),
        relay: RelayConfig::default(),
        health: HealthConfig::default(),
        storage: StorageConfig::default(),
        api: ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 3333,
            cors_origins: vec![],
        },
        bridges,
    }
}

/// Relay policy for dispatcher tests: small budgets.
pub fn test_relay_config(max_submission_attempts: usize, max_rounds: u32) -> RelayConfig {
    RelayConfig {
        gas_limit: 500_000,
        gas_bump_percent: 50,
        max_submission_attempts,
        max_rounds,
        stuck_timeout_secs: 600,
    }
}

/// Retry policy that gives up quickly.
pub fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        max_attempts: 2,
    }
}

/// Connector pool over mock chains.
pub fn mock_pool(chains: &[Arc<MockChain>]) -> ConnectorPool {
    let mut pool = ConnectorPool::new();
    for chain in chains {
        pool.insert(chain.clone(), fast_retry_policy());
    }
    pool
}

// ============================================================================
// MOCK CHAIN
// ============================================================================

/// Scripted state of a `MockChain`.
#[derive(Default)]
pub struct MockState {
    pub latest_block: u64,
    pub logs: Vec<EvmLog>,
    /// `(from, to)` of every `get_logs` call
    pub log_queries: Vec<(u64, u64)>,
    pub gas_price: u64,
    pub nonce: u64,
    /// Answer of `isMessageFinalized`
    pub finalized: bool,
    /// Answers of `send_raw_transaction`, consumed in order; empty = accept
    pub send_results: VecDeque<Result<H256, RpcError>>,
    pub sent: Vec<Vec<u8>>,
    pub receipts: HashMap<H256, TxReceipt>,
    /// Errors returned by the next `latest_block` calls
    pub block_failures: VecDeque<RpcError>,
    pub block_calls: usize,
    /// When set, every call fails with a transport error
    pub down: bool,
}

/// In-memory `ChainConnector` driven by `MockState`.
pub struct MockChain {
    chain_id: u64,
    pub state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            state: Mutex::new(MockState {
                gas_price: 1_000_000_000,
                ..MockState::default()
            }),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_latest_block(&self, block: u64) {
        self.with(|s| s.latest_block = block);
    }

    pub fn sent_count(&self) -> usize {
        self.with(|s| s.sent.len())
    }

    fn check_up(&self) -> Result<(), RpcError> {
        if self.with(|s| s.down) {
            return Err(RpcError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainConnector for MockChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn latest_block(&self) -> Result<u64, RpcError> {
        self.check_up()?;
        self.with(|s| {
            s.block_calls += 1;
            match s.block_failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(s.latest_block),
            }
        })
    }

    async fn get_logs(
        &self,
        address: Address,
        _topic0: H256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<EvmLog>, RpcError> {
        self.check_up()?;
        let address = hex_address(&address);
        self.with(|s| {
            s.log_queries.push((from_block, to_block));
            Ok(s.logs
                .iter()
                .filter(|log| log.address.eq_ignore_ascii_case(&address))
                .filter(|log| {
                    let block = log
                        .block_number
                        .as_deref()
                        .and_then(|b| parse_quantity(b).ok())
                        .unwrap_or_default();
                    block >= from_block && block <= to_block
                })
                .cloned()
                .collect())
        })
    }

    async fn send_raw_transaction(&self, raw_tx: &[u8]) -> Result<H256, RpcError> {
        self.check_up()?;
        self.with(|s| {
            s.sent.push(raw_tx.to_vec());
            s.send_results
                .pop_front()
                .unwrap_or_else(|| Ok(raw_transaction_hash(raw_tx)))
        })
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, RpcError> {
        self.check_up()?;
        Ok(self.with(|s| s.receipts.get(&tx_hash).cloned()))
    }

    async fn gas_price(&self) -> Result<u64, RpcError> {
        self.check_up()?;
        Ok(self.with(|s| s.gas_price))
    }

    async fn pending_nonce(&self, _address: Address) -> Result<u64, RpcError> {
        self.check_up()?;
        Ok(self.with(|s| s.nonce))
    }

    async fn call(&self, _to: Address, _data: &[u8]) -> Result<Vec<u8>, RpcError> {
        self.check_up()?;
        let mut word = vec![0u8; 32];
        if self.with(|s| s.finalized) {
            word[31] = 1;
        }
        Ok(word)
    }
}

// ============================================================================
// EVENT CREATORS
// ============================================================================

/// Intent observed on the home side of the default bridge.
pub fn create_test_intent(n: u8) -> TransferIntent {
    TransferIntent {
        bridge_id: BRIDGE_ID.to_string(),
        source_chain: ChainSide::Home,
        source_chain_id: HOME_CHAIN_ID,
        tx_hash: H256::repeat_byte(0xa0 + n),
        log_index: 0,
        block_number: 5,
        token: Address::repeat_byte(0x0d),
        sender: Address::repeat_byte(0x0e),
        recipient: Address::repeat_byte(0x0f),
        amount: U256::from(1_000_000u64) * U256::from(n as u64 + 1),
        message_id: H256::repeat_byte(n),
    }
}

/// Job of `intent` in `status`, signed by the validators of `signers` (id, seed).
pub fn create_test_job(
    intent: &TransferIntent,
    status: JobStatus,
    signers: &[(&str, u8)],
) -> RelayJob {
    let mut job = RelayJob::from_intent(intent.clone(), FOREIGN_CHAIN_ID);
    job.status = status;
    job.attestations = signers
        .iter()
        .map(|(id, seed)| sign_attestation(intent, id, *seed, SignatureScheme::Secp256k1))
        .collect();
    job
}

fn address_topic(address: &Address) -> String {
    format!("0x{}{}", "00".repeat(12), hex::encode(address.as_bytes()))
}

/// Raw `TokensBridgingInitiated` log as returned by `eth_getLogs`.
pub fn transfer_log(
    contract: &str,
    message_id: H256,
    recipient: Address,
    amount: u64,
    block: u64,
    log_index: u64,
) -> EvmLog {
    let mut data = vec![0u8; 64];
    data[12..32].copy_from_slice(recipient.as_bytes());
    U256::from(amount).to_big_endian(&mut data[32..64]);

    EvmLog {
        address: contract.to_string(),
        topics: vec![
            hex_h256(&transfer_event_topic()),
            address_topic(&Address::repeat_byte(0x0d)),
            address_topic(&Address::repeat_byte(0x0e)),
            hex_h256(&message_id),
        ],
        data: format!("0x{}", hex::encode(data)),
        block_number: Some(format!("0x{:x}", block)),
        transaction_hash: Some(hex_h256(&H256::from_low_u64_be(block * 1000 + log_index))),
        log_index: Some(format!("0x{:x}", log_index)),
        removed: false,
    }
}
