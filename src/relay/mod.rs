//! Relay Dispatcher
//!
//! Delivers QUORUM_MET jobs to their destination chain and follows them until
//! they are confirmed.
//!
//! For every job the destination contract is asked first whether the message
//! is already finalized, so a restart or a competing relayer never leads to a
//! second finalization. A round is one sequence of submission attempts; each
//! rejected attempt raises the gas price, and a round that runs out of
//! attempts fails the job. Failed jobs are re-driven into a fresh round while
//! the round budget lasts, and by operators afterwards.
//!
//! A transaction that stays unmined past the stuck timeout is replaced, not
//! queued behind: the next round reuses its nonce and outbids its price.

pub mod tx;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ethereum_types::{Address, H256};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, ChainSideConfig, RelayConfig, SignatureScheme};
use crate::connector::{ConnectorPool, RetryingConnector};
use crate::crypto::CryptoService;
use crate::error::{OracleError, OracleResult, RpcError};
use crate::storage::OracleStore;
use crate::types::{hex_h256, ChainSide, JobStatus, RelayJob, StuckTransaction, SubmissionAttempt};
use tx::{
    decode_bool, encode_finalize_transfer, encode_is_message_finalized, raw_transaction_hash,
    LegacyTransaction,
};

// ============================================================================
// GAS POLICY
// ============================================================================

/// Starting price of a round: the node's suggestion, never below the floor.
pub fn effective_gas_price(suggested: u64, floor: u64) -> u64 {
    suggested.max(floor)
}

/// Price after `rejected` rejected attempts, each adding `bump_percent`.
pub fn bumped_gas_price(base: u64, rejected: usize, bump_percent: u64) -> u64 {
    let mut price = base as u128;
    for _ in 0..rejected {
        price = price * (100 + bump_percent as u128) / 100;
    }
    price.min(u64::MAX as u128) as u64
}

/// Node answers meaning the exact same transaction is already in the pool.
fn is_already_known(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("already known") || message.contains("known transaction")
}

/// Node answers meaning the nonce was already mined.
fn is_nonce_used(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("nonce too low") || message.contains("nonce has already been used")
}

/// Signatures sent with a finalize call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeSignatures {
    /// 65-byte secp256k1 signatures, concatenated in validator-set order
    pub bytes: Vec<u8>,
    /// Validators the signatures belong to
    pub signers: usize,
}

/// Collects the on-chain signatures of a job.
///
/// Only secp256k1 attestations can be checked by the destination contract;
/// ed25519 ones count towards the oracle quorum but are not sent.
/// Attestations whose signature does not decode to 65 bytes are left out.
pub fn finalize_signatures(bridge: &BridgeConfig, job: &RelayJob) -> FinalizeSignatures {
    let mut collected = FinalizeSignatures::default();
    for validator in &bridge.validators {
        if validator.scheme != SignatureScheme::Secp256k1 {
            continue;
        }
        let Some(attestation) = job.attestations.iter().find(|a| a.signer_id == validator.id)
        else {
            continue;
        };
        let signature = attestation.signature.as_str();
        match hex::decode(signature.strip_prefix("0x").unwrap_or(signature)) {
            Ok(bytes) if bytes.len() == 65 => {
                collected.bytes.extend_from_slice(&bytes);
                collected.signers += 1;
            }
            Ok(bytes) => warn!(
                bridge = %bridge.id,
                message_id = %hex_h256(&job.message_id),
                signer = %validator.id,
                len = bytes.len(),
                "Skipping attestation with a malformed signature"
            ),
            Err(e) => warn!(
                bridge = %bridge.id,
                message_id = %hex_h256(&job.message_id),
                signer = %validator.id,
                "Skipping attestation with undecodable signature: {}",
                e
            ),
        }
    }
    collected
}

/// Moves a FAILED job back to QUORUM_MET in a new round.
pub fn redrive_job(store: &OracleStore, bridge_id: &str, message_id: &H256) -> OracleResult<RelayJob> {
    store.update_job(bridge_id, message_id, JobStatus::Failed, |job| {
        job.round += 1;
        job.set_status(JobStatus::QuorumMet);
        Ok(())
    })
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// What a tick did to one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Submitted,
    Rejected,
    Confirmed,
    Failed,
    Redriven,
    Waiting,
}

/// Totals of one dispatcher tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub submitted: usize,
    pub rejected: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub redriven: usize,
}

impl DispatchReport {
    fn record(&mut self, step: Step) {
        match step {
            Step::Submitted => self.submitted += 1,
            Step::Rejected => self.rejected += 1,
            Step::Confirmed => self.confirmed += 1,
            Step::Failed => self.failed += 1,
            Step::Redriven => self.redriven += 1,
            Step::Waiting => {}
        }
    }
}

/// Submits and tracks finalize transactions of one bridge.
pub struct RelayDispatcher {
    bridge: Arc<BridgeConfig>,
    store: OracleStore,
    home: Arc<RetryingConnector>,
    foreign: Arc<RetryingConnector>,
    crypto: Arc<CryptoService>,
    sender: Address,
    relay: RelayConfig,
}

impl RelayDispatcher {
    pub fn new(
        bridge: Arc<BridgeConfig>,
        store: OracleStore,
        pool: &ConnectorPool,
        crypto: Arc<CryptoService>,
        relay: RelayConfig,
    ) -> OracleResult<Self> {
        let home = pool.get(bridge.home.chain_id)?;
        let foreign = pool.get(bridge.foreign.chain_id)?;
        let sender = crypto.ethereum_address();
        Ok(Self {
            bridge,
            store,
            home,
            foreign,
            crypto,
            sender,
            relay,
        })
    }

    fn destination(&self, side: ChainSide) -> (&ChainSideConfig, &Arc<RetryingConnector>) {
        match side {
            ChainSide::Home => (&self.bridge.home, &self.home),
            ChainSide::Foreign => (&self.bridge.foreign, &self.foreign),
        }
    }

    /// Processes every QUORUM_MET and SUBMITTED job of the bridge once.
    ///
    /// Per-job failures are logged and do not stop the tick. The first
    /// transient chain failure is returned after all jobs were visited.
    pub async fn tick(&self) -> OracleResult<DispatchReport> {
        let mut report = DispatchReport::default();
        let mut unavailable = None;

        let ready = self.store.jobs_in_status(&self.bridge.id, JobStatus::QuorumMet)?;
        let submitted = self.store.jobs_in_status(&self.bridge.id, JobStatus::Submitted)?;

        for job in &ready {
            match self.process_ready(job).await {
                Ok(step) => report.record(step),
                Err(e) => self.note_job_error(job, e, &mut unavailable),
            }
        }
        for job in &submitted {
            match self.track_submitted(job).await {
                Ok(step) => report.record(step),
                Err(e) => self.note_job_error(job, e, &mut unavailable),
            }
        }

        match unavailable {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn note_job_error(&self, job: &RelayJob, err: OracleError, unavailable: &mut Option<OracleError>) {
        match err {
            // Another writer moved the job first
            OracleError::StatusMismatch { .. } => {
                debug!(bridge = %self.bridge.id, message_id = %hex_h256(&job.message_id), "{}", err)
            }
            err if err.is_transient() => {
                warn!(bridge = %self.bridge.id, message_id = %hex_h256(&job.message_id), "{}", err);
                unavailable.get_or_insert(err);
            }
            err => error!(
                bridge = %self.bridge.id,
                message_id = %hex_h256(&job.message_id),
                "Relay error: {}",
                err
            ),
        }
    }

    /// Asks the destination contract whether the message is finalized.
    pub async fn is_finalized(&self, job: &RelayJob) -> OracleResult<bool> {
        let (chain, connector) = self.destination(job.destination_chain);
        let output = connector
            .call(chain.contract_address()?, &encode_is_message_finalized(&job.message_id))
            .await?;
        Ok(decode_bool(&output))
    }

    async fn process_ready(&self, job: &RelayJob) -> OracleResult<Step> {
        let message_id = hex_h256(&job.message_id);
        if self.is_finalized(job).await? {
            self.store.transition(
                &job.bridge_id,
                &job.message_id,
                JobStatus::QuorumMet,
                JobStatus::Confirmed,
                None,
            )?;
            info!(bridge = %job.bridge_id, message_id = %message_id, "Message already finalized on destination");
            return Ok(Step::Confirmed);
        }

        let attempts = job.attempts_in_round();
        if attempts >= self.relay.max_submission_attempts {
            return self.exhaust(job);
        }

        let (chain, connector) = self.destination(job.destination_chain);
        let suggested = connector.gas_price().await?;
        let mut base = effective_gas_price(suggested, chain.gas_price_floor_wei());
        let nonce = match &job.stuck_tx {
            Some(stuck) => {
                base = base.max(bumped_gas_price(stuck.gas_price, 1, self.relay.gas_bump_percent));
                stuck.nonce
            }
            None => connector.pending_nonce(self.sender).await?,
        };
        let gas_price = bumped_gas_price(base, attempts, self.relay.gas_bump_percent);

        let signatures = finalize_signatures(&self.bridge, job);
        if signatures.signers < self.bridge.required_signatures {
            warn!(
                bridge = %job.bridge_id,
                message_id = %message_id,
                onchain_signers = signatures.signers,
                required = self.bridge.required_signatures,
                "Fewer on-chain signatures than the quorum, finalize may revert"
            );
        }

        let tx = LegacyTransaction {
            nonce,
            gas_price,
            gas_limit: self.relay.gas_limit,
            to: chain.contract_address()?,
            data: encode_finalize_transfer(&job.intent, &signatures.bytes),
            chain_id: chain.chain_id,
        };
        let (r, s, recovery_id) = self.crypto.sign_transaction_hash(&tx.signing_hash())?;
        let raw_tx = tx.encode_signed(&r, &s, recovery_id);
        let local_hash = raw_transaction_hash(&raw_tx);

        debug!(
            bridge = %job.bridge_id,
            message_id = %message_id,
            nonce,
            gas_price,
            round = job.round,
            attempt = attempts + 1,
            replacing = job.stuck_tx.is_some(),
            "Submitting finalize transaction"
        );

        let sent = match connector.send_transaction(&raw_tx).await {
            Ok(tx_hash) => Ok(tx_hash),
            Err(OracleError::Rpc {
                source: RpcError::Node { message, .. },
                ..
            }) if is_already_known(&message) => Ok(local_hash),
            Err(OracleError::Rpc {
                chain_id,
                source: RpcError::Node { code, message },
            }) => Err(OracleError::SubmissionRejected {
                chain_id,
                reason: format!("{} (code {})", message, code),
            }),
            Err(e) => return Err(e),
        };

        let round = job.round;
        match sent {
            Ok(tx_hash) => {
                self.store.update_job(&job.bridge_id, &job.message_id, JobStatus::QuorumMet, |job| {
                    job.attempts.push(SubmissionAttempt {
                        round,
                        nonce,
                        gas_price,
                        tx_hash: Some(tx_hash),
                        error: None,
                        at: Utc::now(),
                    });
                    job.last_error = None;
                    job.set_status(JobStatus::Submitted);
                    Ok(())
                })?;
                info!(
                    bridge = %job.bridge_id,
                    message_id = %message_id,
                    tx_hash = %hex_h256(&tx_hash),
                    gas_price,
                    "Finalize transaction submitted"
                );
                Ok(Step::Submitted)
            }
            Err(rejection) => {
                warn!(
                    bridge = %job.bridge_id,
                    message_id = %message_id,
                    gas_price,
                    attempt = attempts + 1,
                    "{}",
                    rejection
                );
                let reason = rejection.to_string();
                let nonce_used = is_nonce_used(&reason);
                let updated =
                    self.store.update_job(&job.bridge_id, &job.message_id, JobStatus::QuorumMet, |job| {
                        job.attempts.push(SubmissionAttempt {
                            round,
                            nonce,
                            gas_price,
                            tx_hash: None,
                            error: Some(reason.clone()),
                            at: Utc::now(),
                        });
                        job.last_error = Some(reason.clone());
                        // The replaced transaction was mined; take a fresh nonce
                        if nonce_used {
                            job.stuck_tx = None;
                        }
                        Ok(())
                    })?;
                if updated.attempts_in_round() >= self.relay.max_submission_attempts {
                    self.exhaust(&updated)
                } else {
                    Ok(Step::Rejected)
                }
            }
        }
    }

    /// Fails a job whose round ran out of attempts and raises an alert.
    fn exhaust(&self, job: &RelayJob) -> OracleResult<Step> {
        let err = OracleError::SubmissionExhausted {
            message_id: hex_h256(&job.message_id),
            attempts: job.attempts_in_round(),
            last_error: job.last_error.clone().unwrap_or_default(),
        };
        error!(
            alert = "SubmissionExhausted",
            bridge = %job.bridge_id,
            round = job.round,
            "{}",
            err
        );
        self.fail(job, JobStatus::QuorumMet, err.to_string(), None)
    }

    /// Marks a job FAILED, then re-drives it if the round budget allows.
    ///
    /// A job leaving SUBMITTED keeps `stuck` as the transaction the next
    /// submission must replace; `None` there means its nonce was consumed.
    fn fail(
        &self,
        job: &RelayJob,
        from: JobStatus,
        reason: String,
        stuck: Option<StuckTransaction>,
    ) -> OracleResult<Step> {
        let failed = self.store.update_job(&job.bridge_id, &job.message_id, from, |job| {
            job.set_status(JobStatus::Failed);
            job.last_error = Some(reason.clone());
            if from == JobStatus::Submitted {
                job.stuck_tx = stuck.clone();
            }
            Ok(())
        })?;

        if failed.round + 1 < self.relay.max_rounds {
            let redriven = redrive_job(&self.store, &job.bridge_id, &job.message_id)?;
            info!(
                bridge = %job.bridge_id,
                message_id = %hex_h256(&job.message_id),
                round = redriven.round,
                "Re-driving failed job: {}",
                reason
            );
            Ok(Step::Redriven)
        } else {
            error!(
                alert = "RelayFailed",
                bridge = %job.bridge_id,
                message_id = %hex_h256(&job.message_id),
                rounds = failed.round + 1,
                "Job failed and needs operator re-drive: {}",
                reason
            );
            Ok(Step::Failed)
        }
    }

    /// Checks a SUBMITTED job once. Never waits for the chain.
    async fn track_submitted(&self, job: &RelayJob) -> OracleResult<Step> {
        let Some((tx_hash, nonce, gas_price)) = job
            .latest_submission()
            .and_then(|s| Some((s.tx_hash?, s.nonce, s.gas_price)))
        else {
            return self.fail(job, JobStatus::Submitted, "submitted job has no transaction".into(), None);
        };
        let (chain, connector) = self.destination(job.destination_chain);

        match connector.confirmed_receipt(tx_hash, chain.confirmations).await? {
            Some(receipt) if receipt.success => {
                self.confirm(job, tx_hash)?;
                Ok(Step::Confirmed)
            }
            Some(_) => {
                if self.is_finalized(job).await? {
                    self.confirm(job, tx_hash)?;
                    return Ok(Step::Confirmed);
                }
                warn!(
                    bridge = %job.bridge_id,
                    message_id = %hex_h256(&job.message_id),
                    tx_hash = %hex_h256(&tx_hash),
                    "Finalize transaction reverted"
                );
                self.fail(
                    job,
                    JobStatus::Submitted,
                    format!("transaction {} reverted", hex_h256(&tx_hash)),
                    None,
                )
            }
            None => {
                let age = Utc::now()
                    .signed_duration_since(job.status_changed_at)
                    .to_std()
                    .unwrap_or_default();
                if age < Duration::from_secs(self.relay.stuck_timeout_secs) {
                    return Ok(Step::Waiting);
                }
                if self.is_finalized(job).await? {
                    self.confirm(job, tx_hash)?;
                    return Ok(Step::Confirmed);
                }
                warn!(
                    bridge = %job.bridge_id,
                    message_id = %hex_h256(&job.message_id),
                    tx_hash = %hex_h256(&tx_hash),
                    nonce,
                    age_secs = age.as_secs(),
                    "Finalize transaction stuck"
                );
                self.fail(
                    job,
                    JobStatus::Submitted,
                    format!("transaction {} stuck for {}s", hex_h256(&tx_hash), age.as_secs()),
                    Some(StuckTransaction {
                        tx_hash,
                        nonce,
                        gas_price,
                    }),
                )
            }
        }
    }

    fn confirm(&self, job: &RelayJob, tx_hash: H256) -> OracleResult<()> {
        self.store.transition(
            &job.bridge_id,
            &job.message_id,
            JobStatus::Submitted,
            JobStatus::Confirmed,
            None,
        )?;
        info!(
            bridge = %job.bridge_id,
            message_id = %hex_h256(&job.message_id),
            tx_hash = %hex_h256(&tx_hash),
            "Transfer finalized"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_floor_wins_over_low_suggestion() {
        assert_eq!(effective_gas_price(1_000_000_000, 5_000_000_000), 5_000_000_000);
        assert_eq!(effective_gas_price(7_000_000_000, 5_000_000_000), 7_000_000_000);
    }

    #[test]
    fn each_rejection_adds_half() {
        assert_eq!(bumped_gas_price(10_000_000_000, 0, 50), 10_000_000_000);
        assert_eq!(bumped_gas_price(10_000_000_000, 1, 50), 15_000_000_000);
        assert_eq!(bumped_gas_price(10_000_000_000, 2, 50), 22_500_000_000);
        assert_eq!(bumped_gas_price(u64::MAX, 3, 50), u64::MAX);
    }

    #[test]
    fn recognises_used_nonce_errors() {
        assert!(is_nonce_used("nonce too low: next nonce 5, tx nonce 4"));
        assert!(is_nonce_used("Nonce has already been used"));
        assert!(!is_nonce_used("transaction underpriced"));
    }

    #[test]
    fn recognises_duplicate_submission_errors() {
        assert!(is_already_known("already known"));
        assert!(is_already_known("Known transaction: 0xabc"));
        assert!(!is_already_known("nonce too low"));
    }
}
