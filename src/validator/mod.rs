//! Signature / Validation Engine
//!
//! Turns observed transfer intents into relay jobs and collects validator
//! attestations for them until the bridge's quorum is met.
//!
//! In operator mode the engine signs every new intent with the oracle key
//! (when its validator id belongs to the bridge's set) and broadcasts the
//! attestation to its peers. In aggregator mode it only collects attestations
//! delivered through the API.
//!
//! Attestations are verified against the configured validator key before they
//! count. Duplicate signers never count twice. Attestations that arrive before
//! the watcher has seen the matching intent are stashed in the store and
//! replayed once the job exists. The stash cannot be verified before the
//! intent is known, so it is capped per bridge and expires after a TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{Config, OracleMode};
use crate::crypto::{CryptoService, ValidatorKey};
use crate::error::{OracleError, OracleResult};
use crate::registry::BridgeRegistry;
use crate::storage::OracleStore;
use crate::types::{hex_h256, Attestation, JobStatus, RelayJob, TransferIntent};

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// What happened to a submitted attestation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttestationOutcome {
    /// Counted; quorum not reached yet
    Accepted { signers: usize },
    /// Counted and the job moved to QUORUM_MET
    QuorumReached { signers: usize },
    /// The signer had already attested this message
    Duplicate,
    /// The intent is not known yet; kept for later
    Stashed,
    /// The job is past quorum collection
    Late,
}

/// Attestation as exchanged between peers and posted to `/attestations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationRequest {
    pub bridge_id: String,
    pub message_id: String,
    pub signer_id: String,
    pub signature: String,
}

// ============================================================================
// VALIDATION ENGINE IMPLEMENTATION
// ============================================================================

pub struct ValidationEngine {
    registry: Arc<BridgeRegistry>,
    store: OracleStore,
    mode: OracleMode,
    validator_id: Option<String>,
    crypto: Option<Arc<CryptoService>>,
    peers: Vec<String>,
    http: reqwest::Client,
    quorum_timeout: Duration,
    inbox_capacity: usize,
    inbox_ttl: Duration,
}

impl ValidationEngine {
    /// Creates the engine.
    ///
    /// # Arguments
    ///
    /// * `crypto` - Oracle keys; required to sign in operator mode
    pub fn new(
        config: &Config,
        registry: Arc<BridgeRegistry>,
        store: OracleStore,
        crypto: Option<Arc<CryptoService>>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.oracle.rpc_timeout_ms))
            .build()
            .unwrap_or_default();

        Self {
            registry,
            store,
            mode: config.oracle.mode,
            validator_id: config.oracle.validator_id.clone(),
            crypto,
            peers: config.oracle.peers.clone(),
            http,
            quorum_timeout: Duration::from_secs(config.oracle.quorum_timeout_secs),
            inbox_capacity: config.oracle.inbox_capacity,
            inbox_ttl: Duration::from_secs(config.oracle.inbox_ttl_secs),
        }
    }

    pub fn store(&self) -> &OracleStore {
        &self.store
    }

    /// Records an observed intent and makes sure its job exists.
    ///
    /// Safe to call again for the same intent: replays neither create a
    /// second job nor add a second local attestation.
    pub async fn handle_intent(&self, intent: TransferIntent) -> OracleResult<()> {
        let bridge = self.registry.get_bridge(&intent.bridge_id)?;
        let destination = bridge.side(intent.source_chain.opposite());

        if !self.store.record_intent(&intent)? {
            debug!(
                bridge = %intent.bridge_id,
                message_id = %hex_h256(&intent.message_id),
                "Intent replayed"
            );
        }

        let job = RelayJob::from_intent(intent.clone(), destination.chain_id);
        if self.store.create_job_if_absent(&job)? {
            info!(
                bridge = %bridge.id,
                side = %intent.source_chain,
                message_id = %hex_h256(&intent.message_id),
                tx_hash = %hex_h256(&intent.tx_hash),
                block = intent.block_number,
                amount = %intent.amount,
                "New transfer intent"
            );
        } else if let Some(existing) = self.store.job(&bridge.id, &intent.message_id)? {
            if existing.intent != intent {
                warn!(
                    bridge = %bridge.id,
                    message_id = %hex_h256(&intent.message_id),
                    tx_hash = %hex_h256(&intent.tx_hash),
                    existing_tx = %hex_h256(&existing.intent.tx_hash),
                    "Message id already bound to another transfer, ignoring"
                );
                return Ok(());
            }
        }

        self.replay_stashed(&bridge.id, &intent.message_id).await?;
        self.sign_locally(&intent).await
    }

    /// Submits the stashed attestations of an existing job. Each entry is
    /// removed only once its submission has completed.
    async fn replay_stashed(&self, bridge_id: &str, message_id: &H256) -> OracleResult<()> {
        for stashed in self.store.stashed(bridge_id, message_id)? {
            let signer_id = stashed.attestation.signer_id.clone();
            match self.submit_attestation(bridge_id, stashed.attestation).await {
                Ok(outcome) => debug!(
                    bridge = %bridge_id,
                    message_id = %hex_h256(message_id),
                    signer = %signer_id,
                    ?outcome,
                    "Replayed stashed attestation"
                ),
                Err(e @ OracleError::InvalidSignature { .. }) => {
                    warn!(bridge = %bridge_id, "Discarded stashed attestation: {}", e)
                }
                Err(e) => return Err(e),
            }
            self.store.remove_stashed(bridge_id, message_id, &signer_id)?;
        }
        Ok(())
    }

    /// Signs the intent with the oracle key when this process is one of the
    /// bridge's validators, then records and broadcasts the attestation.
    async fn sign_locally(&self, intent: &TransferIntent) -> OracleResult<()> {
        if self.mode != OracleMode::Operator {
            return Ok(());
        }
        let (Some(validator_id), Some(crypto)) = (&self.validator_id, &self.crypto) else {
            return Ok(());
        };
        let bridge = self.registry.get_bridge(&intent.bridge_id)?;
        let Some(validator) = bridge.validator(validator_id) else {
            return Ok(());
        };

        if let Some(job) = self.store.job(&bridge.id, &intent.message_id)? {
            if job.status != JobStatus::Pending || job.has_signer(validator_id) {
                return Ok(());
            }
        }

        let signature = crypto.sign_payload(validator.scheme, &intent.canonical_payload())?;
        let attestation = Attestation {
            message_id: intent.message_id,
            signer_id: validator_id.clone(),
            signature,
        };

        let outcome = match self.submit_attestation(&bridge.id, attestation.clone()).await {
            Ok(outcome) => outcome,
            Err(e @ OracleError::InvalidSignature { .. }) => {
                error!(
                    bridge = %bridge.id,
                    validator = %validator_id,
                    "Oracle key does not match the configured validator key: {}",
                    e
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        debug!(
            bridge = %bridge.id,
            message_id = %hex_h256(&intent.message_id),
            ?outcome,
            "Local attestation recorded"
        );
        self.broadcast(&bridge.id, &attestation);
        Ok(())
    }

    /// Sends our attestation to every peer without waiting for them.
    fn broadcast(&self, bridge_id: &str, attestation: &Attestation) {
        if self.peers.is_empty() {
            return;
        }
        let request = AttestationRequest {
            bridge_id: bridge_id.to_string(),
            message_id: hex_h256(&attestation.message_id),
            signer_id: attestation.signer_id.clone(),
            signature: attestation.signature.clone(),
        };
        for peer in &self.peers {
            let url = format!("{}/attestations", peer.trim_end_matches('/'));
            let http = self.http.clone();
            let request = request.clone();
            tokio::spawn(async move {
                match http.post(&url).json(&request).send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!(peer = %url, message_id = %request.message_id, "Attestation delivered");
                    }
                    Ok(response) => {
                        warn!(peer = %url, status = %response.status(), "Peer refused attestation");
                    }
                    Err(e) => warn!(peer = %url, "Failed to deliver attestation: {}", e),
                }
            });
        }
    }

    /// Verifies an attestation and counts it towards the job's quorum.
    ///
    /// # Returns
    ///
    /// * `Ok(AttestationOutcome)` - What happened to the attestation
    /// * `Err(OracleError::InvalidSignature)` - Unknown signer or bad signature; discarded
    /// * `Err(OracleError::UnknownBridge)` - No such bridge
    pub async fn submit_attestation(
        &self,
        bridge_id: &str,
        attestation: Attestation,
    ) -> OracleResult<AttestationOutcome> {
        let bridge = self.registry.get_bridge(bridge_id)?;
        let message_id = hex_h256(&attestation.message_id);

        let invalid = |reason: String| {
            let err = OracleError::InvalidSignature {
                message_id: message_id.clone(),
                signer_id: attestation.signer_id.clone(),
                reason,
            };
            warn!(bridge = %bridge.id, "{}", err);
            err
        };

        let validator = bridge
            .validator(&attestation.signer_id)
            .ok_or_else(|| invalid("signer is not in the validator set".to_string()))?;
        let key = ValidatorKey::from_config(validator).map_err(|e| invalid(e.to_string()))?;

        let Some(job) = self.store.job(&bridge.id, &attestation.message_id)? else {
            debug!(
                bridge = %bridge.id,
                message_id = %message_id,
                signer = %attestation.signer_id,
                "Intent not observed yet, stashing attestation"
            );
            if !self
                .store
                .stash_attestation(&bridge.id, &attestation, self.inbox_capacity)?
            {
                warn!(
                    bridge = %bridge.id,
                    message_id = %message_id,
                    signer = %attestation.signer_id,
                    capacity = self.inbox_capacity,
                    "Attestation inbox full, dropping early attestation"
                );
                return Err(OracleError::InboxFull(bridge.id.clone()));
            }
            return Ok(AttestationOutcome::Stashed);
        };

        key.verify(&job.intent.canonical_payload(), &attestation.signature)
            .map_err(invalid)?;

        if job.status != JobStatus::Pending {
            return Ok(if job.has_signer(&attestation.signer_id) {
                AttestationOutcome::Duplicate
            } else {
                AttestationOutcome::Late
            });
        }

        let required = bridge.required_signatures;
        let mut outcome = AttestationOutcome::Duplicate;
        let result = self.store.update_job(
            &bridge.id,
            &attestation.message_id,
            JobStatus::Pending,
            |job| {
                if job.has_signer(&attestation.signer_id) {
                    outcome = AttestationOutcome::Duplicate;
                    return Ok(());
                }
                job.attestations.push(attestation.clone());
                let signers = job.distinct_signers();
                if signers >= required {
                    job.set_status(JobStatus::QuorumMet);
                    outcome = AttestationOutcome::QuorumReached { signers };
                } else {
                    outcome = AttestationOutcome::Accepted { signers };
                }
                Ok(())
            },
        );

        match result {
            Ok(_) => {}
            // Another writer moved the job past PENDING first
            Err(OracleError::StatusMismatch { .. }) => return Ok(AttestationOutcome::Late),
            Err(e) => return Err(e),
        }

        match outcome {
            AttestationOutcome::QuorumReached { signers } => info!(
                bridge = %bridge.id,
                message_id = %message_id,
                signers,
                required,
                "Quorum reached"
            ),
            AttestationOutcome::Accepted { signers } => debug!(
                bridge = %bridge.id,
                message_id = %message_id,
                signer = %attestation.signer_id,
                signers,
                required,
                "Attestation accepted"
            ),
            _ => {}
        }
        Ok(outcome)
    }

    /// Parses and submits an attestation received over HTTP.
    pub async fn submit_request(&self, request: AttestationRequest) -> OracleResult<AttestationOutcome> {
        let message_id = crate::types::parse_h256(&request.message_id).map_err(|reason| {
            OracleError::InvalidSignature {
                message_id: request.message_id.clone(),
                signer_id: request.signer_id.clone(),
                reason,
            }
        })?;
        self.submit_attestation(
            &request.bridge_id,
            Attestation {
                message_id,
                signer_id: request.signer_id,
                signature: request.signature,
            },
        )
        .await
    }

    /// Drops stashed attestations of a bridge older than the inbox TTL.
    ///
    /// # Returns
    ///
    /// * `Ok(usize)` - Number of expired entries removed
    pub fn prune_inbox(&self, bridge_id: &str) -> OracleResult<usize> {
        // A TTL beyond chrono's range never expires anything
        let Some(cutoff) = chrono::Duration::from_std(self.inbox_ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return Ok(0);
        };
        let removed = self.store.prune_stashed(bridge_id, cutoff)?;
        if removed > 0 {
            info!(bridge = %bridge_id, removed, "Expired stashed attestations");
        }
        Ok(removed)
    }

    /// Raises a `QuorumUnreachable` alert, once per job, for jobs of a bridge
    /// that have been PENDING for longer than the quorum timeout.
    ///
    /// # Returns
    ///
    /// * `Ok(usize)` - Number of alerts raised by this call
    pub fn check_quorum_deadlines(&self, bridge_id: &str) -> OracleResult<usize> {
        let bridge = self.registry.get_bridge(bridge_id)?;
        let now = Utc::now();
        let mut alerted = 0;

        for job in self.store.jobs_in_status(&bridge.id, JobStatus::Pending)? {
            if job.quorum_alerted {
                continue;
            }
            let age = now
                .signed_duration_since(job.created_at)
                .to_std()
                .unwrap_or_default();
            if age < self.quorum_timeout {
                continue;
            }

            let err = OracleError::QuorumUnreachable {
                message_id: hex_h256(&job.message_id),
                have: job.distinct_signers(),
                required: bridge.required_signatures,
            };
            match self.store.update_job(&bridge.id, &job.message_id, JobStatus::Pending, |job| {
                job.quorum_alerted = true;
                Ok(())
            }) {
                Ok(_) => {
                    warn!(
                        alert = "QuorumUnreachable",
                        bridge = %bridge.id,
                        age_secs = age.as_secs(),
                        "{}",
                        err
                    );
                    alerted += 1;
                }
                Err(OracleError::StatusMismatch { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(alerted)
    }
}
