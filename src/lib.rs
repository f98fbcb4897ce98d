//! Bridge Oracle Library
//!
//! Watches bridge contracts on pairs of EVM chains, collects validator
//! attestations for every transfer until the bridge's quorum is met, and
//! relays the finalize transaction to the destination chain.

pub mod api;
pub mod config;
pub mod connector;
pub mod crypto;
pub mod error;
pub mod evm_client;
pub mod monitor;
pub mod registry;
pub mod relay;
pub mod service;
pub mod storage;
pub mod types;
pub mod validator;

// Re-export commonly used types
pub use config::{BridgeConfig, ChainSideConfig, Config, OracleConfig, OracleMode};
pub use connector::{ChainConnector, ConnectorPool, RetryPolicy, RetryingConnector};
pub use crypto::CryptoService;
pub use error::{OracleError, OracleResult, RpcError};
pub use registry::BridgeRegistry;
pub use service::OracleService;
pub use storage::OracleStore;
pub use types::{Attestation, ChainSide, JobStatus, RelayJob, TransferIntent};
pub use validator::{AttestationOutcome, ValidationEngine};
