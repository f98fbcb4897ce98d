//! Error Taxonomy Module
//!
//! Errors raised by the oracle pipeline. Transient chain failures are kept
//! apart from permanent ones so that each stage can decide whether to skip a
//! unit of work, retry it on the next tick, or alert an operator.

use thiserror::Error;

use crate::types::JobStatus;

/// Errors returned by a raw chain connector before any retry policy is applied.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The endpoint could not be reached or answered with a server error.
    #[error("transport error: {0}")]
    Transport(String),
    /// The request did not complete within the client timeout.
    #[error("request timed out")]
    Timeout,
    /// The node processed the request and rejected it (revert, nonce, fee...).
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },
    /// The node answered with something that could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::Timeout)
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RpcError::Timeout
        } else if err.is_decode() {
            RpcError::InvalidResponse(err.to_string())
        } else {
            RpcError::Transport(err.to_string())
        }
    }
}

/// Oracle-level error taxonomy.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("chain {chain_id} unavailable after {attempts} attempts: {last_error}")]
    ChainUnavailable {
        chain_id: u64,
        attempts: u32,
        last_error: String,
    },

    #[error("unknown bridge: {0}")]
    UnknownBridge(String),

    #[error("no connector configured for chain {0}")]
    UnknownChain(u64),

    #[error("invalid signature from {signer_id} for message {message_id}: {reason}")]
    InvalidSignature {
        message_id: String,
        signer_id: String,
        reason: String,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("quorum unreachable for message {message_id}: {have}/{required} signatures")]
    QuorumUnreachable {
        message_id: String,
        have: usize,
        required: usize,
    },

    #[error("submission exhausted for message {message_id} after {attempts} attempts: {last_error}")]
    SubmissionExhausted {
        message_id: String,
        attempts: usize,
        last_error: String,
    },

    #[error("transaction rejected by chain {chain_id}: {reason}")]
    SubmissionRejected { chain_id: u64, reason: String },

    #[error("rpc error on chain {chain_id}: {source}")]
    Rpc {
        chain_id: u64,
        #[source]
        source: RpcError,
    },

    #[error("job {message_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        message_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {message_id} is {actual:?}, expected {expected:?}")]
    StatusMismatch {
        message_id: String,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("attestation inbox of bridge {0} is full")]
    InboxFull(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl OracleError {
    /// Whether the failure is transient and the unit of work should simply be
    /// retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OracleError::ChainUnavailable { .. } | OracleError::Timeout(_)
        )
    }
}

pub type OracleResult<T> = Result<T, OracleError>;
