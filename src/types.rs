//! Core Data Model
//!
//! Records shared by the watcher, the validation engine, the dispatcher and
//! the store: transfer intents, attestations and relay jobs.

use chrono::{DateTime, Utc};
use ethereum_types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

/// Side of a bridge pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainSide {
    Home,
    Foreign,
}

impl ChainSide {
    /// The side a transfer observed on `self` is delivered to.
    pub fn opposite(self) -> Self {
        match self {
            ChainSide::Home => ChainSide::Foreign,
            ChainSide::Foreign => ChainSide::Home,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChainSide::Home => "home",
            ChainSide::Foreign => "foreign",
        }
    }

    pub const BOTH: [ChainSide; 2] = [ChainSide::Home, ChainSide::Foreign];
}

impl std::fmt::Display for ChainSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bridging-initiated event observed on the source chain.
///
/// Uniquely identified by `(bridge_id, tx_hash, message_id)` and never
/// modified once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferIntent {
    pub bridge_id: String,
    pub source_chain: ChainSide,
    pub source_chain_id: u64,
    pub tx_hash: H256,
    pub log_index: u64,
    pub block_number: u64,
    pub token: Address,
    pub sender: Address,
    pub recipient: Address,
    pub amount: U256,
    pub message_id: H256,
}

impl TransferIntent {
    /// Storage key of the intent identity.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.bridge_id,
            hex_h256(&self.tx_hash),
            hex_h256(&self.message_id)
        )
    }

    /// Canonical message signed by validators:
    /// `token(20) || recipient(20) || amount(32) || message_id(32)`.
    pub fn canonical_payload(&self) -> Vec<u8> {
        let mut amount = [0u8; 32];
        self.amount.to_big_endian(&mut amount);

        let mut payload = Vec::with_capacity(104);
        payload.extend_from_slice(self.token.as_bytes());
        payload.extend_from_slice(self.recipient.as_bytes());
        payload.extend_from_slice(&amount);
        payload.extend_from_slice(self.message_id.as_bytes());
        payload
    }
}

/// A validator's signature over a message's canonical payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub message_id: H256,
    pub signer_id: String,
    /// Hex encoded signature bytes (0x prefixed)
    pub signature: String,
}

/// Lifecycle of a relay job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    QuorumMet,
    Submitted,
    Confirmed,
    Failed,
}

impl JobStatus {
    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, QuorumMet)
                | (QuorumMet, Submitted)
                | (QuorumMet, Confirmed)
                | (QuorumMet, Failed)
                | (Submitted, Confirmed)
                | (Submitted, Failed)
                | (Failed, QuorumMet)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == JobStatus::Confirmed
    }
}

/// One attempt at getting the finalize transaction accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionAttempt {
    pub round: u32,
    pub nonce: u64,
    pub gas_price: u64,
    pub tx_hash: Option<H256>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Sent transaction that never confirmed and may still be mined. The next
/// submission reuses its nonce so that it replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckTransaction {
    pub tx_hash: H256,
    pub nonce: u64,
    pub gas_price: u64,
}

/// Delivery state of one cross-chain message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayJob {
    pub bridge_id: String,
    pub message_id: H256,
    pub destination_chain: ChainSide,
    pub destination_chain_id: u64,
    pub source_tx_hash: H256,
    /// Hex encoded canonical payload. Never rewritten after creation.
    pub payload: String,
    pub intent: TransferIntent,
    pub attestations: Vec<Attestation>,
    pub status: JobStatus,
    #[serde(default)]
    pub attempts: Vec<SubmissionAttempt>,
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set once the quorum deadline alert has been raised
    #[serde(default)]
    pub quorum_alerted: bool,
    #[serde(default)]
    pub stuck_tx: Option<StuckTransaction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
}

impl RelayJob {
    /// Creates a PENDING job for a freshly observed intent.
    pub fn from_intent(intent: TransferIntent, destination_chain_id: u64) -> Self {
        let now = Utc::now();
        Self {
            bridge_id: intent.bridge_id.clone(),
            message_id: intent.message_id,
            destination_chain: intent.source_chain.opposite(),
            destination_chain_id,
            source_tx_hash: intent.tx_hash,
            payload: format!("0x{}", hex::encode(intent.canonical_payload())),
            intent,
            attestations: Vec::new(),
            status: JobStatus::Pending,
            attempts: Vec::new(),
            round: 0,
            last_error: None,
            quorum_alerted: false,
            stuck_tx: None,
            created_at: now,
            updated_at: now,
            status_changed_at: now,
        }
    }

    pub fn key(&self) -> String {
        job_key(&self.bridge_id, &self.message_id)
    }

    /// Number of distinct signers that have attested.
    pub fn distinct_signers(&self) -> usize {
        let mut signers: Vec<&str> = self
            .attestations
            .iter()
            .map(|a| a.signer_id.as_str())
            .collect();
        signers.sort_unstable();
        signers.dedup();
        signers.len()
    }

    pub fn has_signer(&self, signer_id: &str) -> bool {
        self.attestations.iter().any(|a| a.signer_id == signer_id)
    }

    /// Attempts made in the current round.
    pub fn attempts_in_round(&self) -> usize {
        self.attempts.iter().filter(|a| a.round == self.round).count()
    }

    /// Most recent attempt that produced a transaction hash in this round.
    pub fn latest_submission(&self) -> Option<&SubmissionAttempt> {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.round == self.round && a.tx_hash.is_some())
    }

    pub(crate) fn set_status(&mut self, status: JobStatus) {
        let now = Utc::now();
        self.status = status;
        self.status_changed_at = now;
        self.updated_at = now;
    }
}

/// Storage key of a relay job.
pub fn job_key(bridge_id: &str, message_id: &H256) -> String {
    format!("{}:{}", bridge_id, hex_h256(message_id))
}

/// Full 0x-prefixed lowercase hex of a 32-byte hash.
pub fn hex_h256(value: &H256) -> String {
    format!("0x{}", hex::encode(value.as_bytes()))
}

/// Full 0x-prefixed lowercase hex of an address.
pub fn hex_address(value: &Address) -> String {
    format!("0x{}", hex::encode(value.as_bytes()))
}

/// Parses a 0x-prefixed (or bare) 32-byte hex string.
pub fn parse_h256(value: &str) -> Result<H256, String> {
    let bytes = hex::decode(value.strip_prefix("0x").unwrap_or(value))
        .map_err(|e| format!("invalid hex {}: {}", value, e))?;
    if bytes.len() != 32 {
        return Err(format!("expected 32 bytes, got {} in {}", bytes.len(), value));
    }
    Ok(H256::from_slice(&bytes))
}

/// Parses a 0x-prefixed (or bare) 20-byte hex address.
pub fn parse_address(value: &str) -> Result<Address, String> {
    let bytes = hex::decode(value.strip_prefix("0x").unwrap_or(value))
        .map_err(|e| format!("invalid hex {}: {}", value, e))?;
    if bytes.len() != 20 {
        return Err(format!("expected 20 bytes, got {} in {}", bytes.len(), value));
    }
    Ok(Address::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent() -> TransferIntent {
        TransferIntent {
            bridge_id: "polis-bsc".to_string(),
            source_chain: ChainSide::Home,
            source_chain_id: 333999,
            tx_hash: H256::repeat_byte(0x11),
            log_index: 0,
            block_number: 10,
            token: Address::repeat_byte(0x22),
            sender: Address::repeat_byte(0x33),
            recipient: Address::repeat_byte(0x44),
            amount: U256::from(1_000u64),
            message_id: H256::repeat_byte(0x55),
        }
    }

    #[test]
    fn canonical_payload_layout() {
        let payload = intent().canonical_payload();
        assert_eq!(payload.len(), 104);
        assert_eq!(&payload[..20], &[0x22; 20]);
        assert_eq!(&payload[20..40], &[0x44; 20]);
        assert_eq!(&payload[70..72], &[0x03, 0xe8]);
        assert_eq!(&payload[72..], &[0x55; 32]);
    }

    #[test]
    fn submitted_cannot_be_submitted_again() {
        assert!(!JobStatus::Submitted.can_transition_to(JobStatus::Submitted));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Submitted));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::QuorumMet));
        assert!(!JobStatus::Confirmed.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn job_starts_pending_towards_opposite_side() {
        let job = RelayJob::from_intent(intent(), 56);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.destination_chain, ChainSide::Foreign);
        assert_eq!(job.destination_chain_id, 56);
        assert!(job.payload.starts_with("0x2222"));
    }
}
