//! Configuration Management Module
//!
//! This module handles loading and managing configuration for the bridge oracle.
//! Configuration includes the bridge table (home/foreign chain pairs and their
//! validator sets), retry and relay policies, health thresholds, storage and
//! API settings.
//!
//! The configuration is read once at startup from a TOML file and layered with
//! `ORACLE__SECTION__KEY` environment overrides. It is immutable afterwards and
//! passed explicitly to every component.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use ethereum_types::Address;
use serde::{Deserialize, Serialize};

use crate::crypto::ValidatorKey;
use crate::error::OracleError;
use crate::types::{parse_address, ChainSide};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/oracle.toml";

/// Environment variable that overrides the configuration file location.
pub const CONFIG_PATH_ENV: &str = "ORACLE_CONFIG_PATH";

// ============================================================================
// CONFIGURATION STRUCTURES
// ============================================================================

/// Main configuration structure containing all service settings.
///
/// This structure holds configuration for:
/// - Oracle identity, mode and polling behaviour
/// - Chain RPC retry policy
/// - Relay (finalize transaction) policy
/// - Health thresholds
/// - Storage location
/// - API server configuration
/// - The bridge table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Oracle identity and scheduling
    pub oracle: OracleConfig,
    /// Backoff applied to transient chain failures
    #[serde(default)]
    pub retry: RetryConfig,
    /// Finalize transaction policy
    #[serde(default)]
    pub relay: RelayConfig,
    /// Health endpoint thresholds
    #[serde(default)]
    pub health: HealthConfig,
    /// Persistent store settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// API server configuration (host, port, CORS settings)
    pub api: ApiConfig,
    /// Bridges served by this oracle
    #[serde(default)]
    pub bridges: Vec<BridgeConfig>,
}

/// Whether this process signs attestations itself or only collects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleMode {
    /// Signs locally when `validator_id` belongs to a bridge's validator set
    Operator,
    /// Collects attestations submitted through the API
    Aggregator,
}

/// Oracle-specific configuration including identity and timing parameters.
///
/// Keys are loaded from environment variables at runtime. The config file
/// contains the environment variable name, not the actual key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_mode")]
    pub mode: OracleMode,
    /// Validator id of this process (operator mode)
    #[serde(default)]
    pub validator_id: Option<String>,
    /// Environment variable name containing the 32-byte secret (base64 encoded)
    /// Default: "ORACLE_PRIVATE_KEY"
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
    /// Polling interval of watchers and dispatchers in milliseconds
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// HTTP timeout of a single RPC call in milliseconds
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Base URLs of peer oracles that receive our attestations
    #[serde(default)]
    pub peers: Vec<String>,
    /// Whether this process submits finalize transactions
    #[serde(default = "default_true")]
    pub relay_enabled: bool,
    /// Seconds a job may stay PENDING before a quorum alert is raised
    #[serde(default = "default_quorum_timeout_secs")]
    pub quorum_timeout_secs: u64,
    /// Attestations per bridge kept while their intent is unseen
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    /// Seconds an unclaimed stashed attestation is kept
    #[serde(default = "default_inbox_ttl_secs")]
    pub inbox_ttl_secs: u64,
    /// Consecutive unavailable ticks before a bridge pauses itself
    #[serde(default = "default_pause_after_failures")]
    pub pause_after_failures: u32,
    /// Length of an automatic pause in seconds
    #[serde(default = "default_pause_secs")]
    pub pause_secs: u64,
}

fn default_mode() -> OracleMode {
    OracleMode::Operator
}

fn default_private_key_env() -> String {
    "ORACLE_PRIVATE_KEY".to_string()
}

fn default_polling_interval_ms() -> u64 {
    5_000
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_quorum_timeout_secs() -> u64 {
    600
}

fn default_inbox_capacity() -> usize {
    10_000
}

fn default_inbox_ttl_secs() -> u64 {
    3_600
}

fn default_pause_after_failures() -> u32 {
    5
}

fn default_pause_secs() -> u64 {
    60
}

impl OracleConfig {
    /// Loads the private key from the environment variable.
    ///
    /// # Returns
    ///
    /// * `Ok(String)` - The private key (base64 encoded)
    /// * `Err(anyhow::Error)` - Failed to load from environment
    pub fn get_private_key(&self) -> anyhow::Result<String> {
        std::env::var(&self.private_key_env).map_err(|_| {
            anyhow::anyhow!(
                "Environment variable '{}' not set. Please set it with the oracle's 32-byte secret (base64 encoded).",
                self.private_key_env
            )
        })
    }
}

/// Exponential backoff for transient RPC failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Finalize transaction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Gas limit of the finalize transaction
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// Percentage added to the gas price after each rejected attempt
    #[serde(default = "default_gas_bump_percent")]
    pub gas_bump_percent: u64,
    /// Attempts per round before the job is marked failed
    #[serde(default = "default_max_submission_attempts")]
    pub max_submission_attempts: usize,
    /// Rounds (initial + automatic re-drives) before operator action is needed
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Seconds after which a SUBMITTED job is reconciled
    #[serde(default = "default_stuck_timeout_secs")]
    pub stuck_timeout_secs: u64,
}

fn default_gas_limit() -> u64 {
    2_000_000
}

fn default_gas_bump_percent() -> u64 {
    50
}

fn default_max_submission_attempts() -> usize {
    5
}

fn default_max_rounds() -> u32 {
    3
}

fn default_stuck_timeout_secs() -> u64 {
    600
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            gas_limit: default_gas_limit(),
            gas_bump_percent: default_gas_bump_percent(),
            max_submission_attempts: default_max_submission_attempts(),
            max_rounds: default_max_rounds(),
            stuck_timeout_secs: default_stuck_timeout_secs(),
        }
    }
}

/// Thresholds used by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Maximum distance between the chain tip and the processed cursor
    #[serde(default = "default_max_lag_blocks")]
    pub max_lag_blocks: u64,
    /// Maximum age of the last successful watcher tick
    #[serde(default = "default_max_stale_secs")]
    pub max_stale_secs: u64,
}

fn default_max_lag_blocks() -> u64 {
    100
}

fn default_max_stale_secs() -> u64 {
    300
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_lag_blocks: default_max_lag_blocks(),
            max_stale_secs: default_max_stale_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory of the sled database
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/oracle.sled")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// API server configuration for external communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Host address to bind the API server to
    pub host: String,
    /// Port number to bind the API server to
    pub port: u16,
    /// Allowed CORS origins for cross-origin requests
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Signature scheme of a validator key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureScheme {
    Secp256k1,
    Ed25519,
}

/// One member of a bridge's validator set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub id: String,
    pub scheme: SignatureScheme,
    /// secp256k1: 0x-prefixed EVM address. ed25519: base64 public key.
    pub public_key: String,
}

/// One side of a bridge pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSideConfig {
    /// Human-readable name for the chain
    pub name: String,
    /// EIP-155 chain id
    pub chain_id: u64,
    /// Bridge contract emitting and finalizing transfers on this side
    pub bridge_contract_addr: String,
    /// Block the bridge was deployed at; scanning starts right after it
    pub start_block: u64,
    /// JSON-RPC endpoint
    pub rpc_url: String,
    /// Minimum gas price (gwei) used for finalize transactions on this side
    #[serde(default)]
    pub gas_price_floor_gwei: Option<u64>,
    /// Blocks behind the tip the watcher stays
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    /// Confirmations a finalize transaction needs on this side
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    /// Largest block range requested with one `eth_getLogs`
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
}

fn default_confirmation_depth() -> u64 {
    12
}

fn default_confirmations() -> u64 {
    1
}

fn default_max_block_range() -> u64 {
    1_000
}

impl ChainSideConfig {
    pub fn contract_address(&self) -> Result<Address, OracleError> {
        parse_address(&self.bridge_contract_addr).map_err(|e| {
            OracleError::InvalidConfig(format!("{} bridge_contract_addr: {}", self.name, e))
        })
    }

    /// Gas price floor in wei.
    pub fn gas_price_floor_wei(&self) -> u64 {
        self.gas_price_floor_gwei
            .map(|gwei| gwei.saturating_mul(1_000_000_000))
            .unwrap_or(0)
    }
}

/// A home/foreign bridge pair with its validator set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub id: String,
    pub required_signatures: usize,
    pub validators: Vec<ValidatorConfig>,
    pub home: ChainSideConfig,
    pub foreign: ChainSideConfig,
}

impl BridgeConfig {
    pub fn side(&self, side: ChainSide) -> &ChainSideConfig {
        match side {
            ChainSide::Home => &self.home,
            ChainSide::Foreign => &self.foreign,
        }
    }

    pub fn validator(&self, id: &str) -> Option<&ValidatorConfig> {
        self.validators.iter().find(|v| v.id == id)
    }

    /// Validates a single bridge entry.
    pub fn validate(&self) -> Result<(), OracleError> {
        if self.id.trim().is_empty() {
            return Err(OracleError::InvalidConfig("bridge id must not be empty".into()));
        }
        // ':' separates key segments in the store
        if self.id.contains(':') || self.id.contains('/') {
            return Err(OracleError::InvalidConfig(format!(
                "bridge id {} must not contain ':' or '/'",
                self.id
            )));
        }
        if self.required_signatures == 0 {
            return Err(OracleError::InvalidConfig(format!(
                "bridge {}: required_signatures must be at least 1",
                self.id
            )));
        }
        if self.required_signatures > self.validators.len() {
            return Err(OracleError::InvalidConfig(format!(
                "bridge {}: required_signatures {} exceeds validator count {}",
                self.id,
                self.required_signatures,
                self.validators.len()
            )));
        }

        let mut seen = HashSet::new();
        for validator in &self.validators {
            if !seen.insert(validator.id.as_str()) {
                return Err(OracleError::InvalidConfig(format!(
                    "bridge {}: duplicate validator id {}",
                    self.id, validator.id
                )));
            }
            ValidatorKey::from_config(validator).map_err(|e| {
                OracleError::InvalidConfig(format!("bridge {}: {}", self.id, e))
            })?;
        }

        if self.home.chain_id == self.foreign.chain_id {
            return Err(OracleError::InvalidConfig(format!(
                "bridge {}: home and foreign share chain id {}",
                self.id, self.home.chain_id
            )));
        }

        for side in ChainSide::BOTH {
            let chain = self.side(side);
            chain.contract_address()?;
            url::Url::parse(&chain.rpc_url).map_err(|e| {
                OracleError::InvalidConfig(format!(
                    "bridge {} {}: invalid rpc_url {}: {}",
                    self.id, side, chain.rpc_url, e
                ))
            })?;
            if chain.max_block_range == 0 {
                return Err(OracleError::InvalidConfig(format!(
                    "bridge {} {}: max_block_range must be at least 1",
                    self.id, side
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// CONFIGURATION LOADING AND MANAGEMENT
// ============================================================================

impl Config {
    /// Loads configuration from `ORACLE_CONFIG_PATH` or `config/oracle.toml`.
    pub fn load() -> anyhow::Result<Self> {
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Loads configuration from `path` layered with `ORACLE__SECTION__KEY`
    /// environment overrides, then validates it.
    ///
    /// # Returns
    ///
    /// - `Ok(Config)` - Successfully loaded and validated configuration
    /// - `Err(anyhow::Error)` - Missing file, parse failure or invalid values
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file '{}' not found. Please copy the template:\n\
                cp config/oracle.template.toml config/oracle.toml\n\
                Then edit config/oracle.toml with your actual values.",
                path.display()
            ));
        }

        let config: Config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("ORACLE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parses and validates configuration from a TOML string, without
    /// environment layering.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the whole configuration.
    ///
    /// This function ensures that:
    /// - Bridge ids are non-empty and unique
    /// - Every bridge entry is valid on its own
    /// - A chain id always maps to the same RPC endpoint
    /// - Operator mode names its validator id
    /// - Peer URLs parse
    pub fn validate(&self) -> Result<(), OracleError> {
        let mut ids = HashSet::new();
        let mut endpoints: HashMap<u64, &str> = HashMap::new();

        for bridge in &self.bridges {
            bridge.validate()?;
            if !ids.insert(bridge.id.as_str()) {
                return Err(OracleError::InvalidConfig(format!(
                    "duplicate bridge id {}",
                    bridge.id
                )));
            }
            for side in ChainSide::BOTH {
                let chain = bridge.side(side);
                match endpoints.get(&chain.chain_id) {
                    Some(existing) if *existing != chain.rpc_url => {
                        return Err(OracleError::InvalidConfig(format!(
                            "chain {} configured with conflicting rpc urls {} and {}",
                            chain.chain_id, existing, chain.rpc_url
                        )));
                    }
                    Some(_) => {}
                    None => {
                        endpoints.insert(chain.chain_id, chain.rpc_url.as_str());
                    }
                }
            }
        }

        if self.oracle.mode == OracleMode::Operator && self.oracle.validator_id.is_none() {
            return Err(OracleError::InvalidConfig(
                "operator mode requires oracle.validator_id".into(),
            ));
        }

        for peer in &self.oracle.peers {
            url::Url::parse(peer).map_err(|e| {
                OracleError::InvalidConfig(format!("invalid peer url {}: {}", peer, e))
            })?;
        }

        if self.retry.max_attempts == 0 {
            return Err(OracleError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.relay.max_submission_attempts == 0 || self.relay.max_rounds == 0 {
            return Err(OracleError::InvalidConfig(
                "relay.max_submission_attempts and relay.max_rounds must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
