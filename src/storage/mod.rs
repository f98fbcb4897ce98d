//! Storage Module
//!
//! Durable state of the oracle, kept in a sled database:
//! - `cursors`: last processed block per bridge and side
//! - `intents`: observed transfer intents, keyed by `(bridge, tx_hash, message_id)`
//! - `jobs`: relay jobs, keyed by `(bridge, message_id)`
//! - `attestation_inbox`: attestations received before their intent was observed,
//!   bounded per bridge and expired after a TTL
//!
//! Values are JSON documents. Job updates are compare-and-swap guarded by the
//! job's current status, so a stage can only move jobs out of the statuses it
//! owns, and two writers never both succeed on the same transition.

use std::path::Path;

use chrono::{DateTime, Utc};
use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::debug;

use crate::error::{OracleError, OracleResult};
use crate::types::{hex_h256, job_key, Attestation, ChainSide, JobStatus, RelayJob, TransferIntent};

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// Per-status job counts of a bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub quorum_met: usize,
    pub submitted: usize,
    pub confirmed: usize,
    pub failed: usize,
}

/// Attestation waiting in the inbox for its intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashedAttestation {
    #[serde(flatten)]
    pub attestation: Attestation,
    #[serde(default = "Utc::now")]
    pub stashed_at: DateTime<Utc>,
}

// ============================================================================
// STORAGE IMPLEMENTATION
// ============================================================================

/// Handle to the oracle database. Cheap to clone.
#[derive(Clone)]
pub struct OracleStore {
    db: Db,
    cursors: Tree,
    intents: Tree,
    jobs: Tree,
    inbox: Tree,
}

impl OracleStore {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> OracleResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Opening oracle store");
        Self::from_db(sled::open(path)?)
    }

    /// Creates a throwaway database removed on drop (for testing)
    pub fn temporary() -> OracleResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> OracleResult<Self> {
        Ok(Self {
            cursors: db.open_tree("cursors")?,
            intents: db.open_tree("intents")?,
            jobs: db.open_tree("jobs")?,
            inbox: db.open_tree("attestation_inbox")?,
            db,
        })
    }

    /// Flushes pending writes to disk.
    pub async fn flush(&self) -> OracleResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------------

    /// Last processed block of a bridge side, if any was persisted.
    pub fn cursor(&self, bridge_id: &str, side: ChainSide) -> OracleResult<Option<u64>> {
        let key = format!("{}:{}", bridge_id, side);
        Ok(self.cursors.get(key)?.and_then(|value| {
            let bytes: [u8; 8] = value.as_ref().try_into().ok()?;
            Some(u64::from_be_bytes(bytes))
        }))
    }

    pub fn set_cursor(&self, bridge_id: &str, side: ChainSide, block: u64) -> OracleResult<()> {
        let key = format!("{}:{}", bridge_id, side);
        self.cursors.insert(key, block.to_be_bytes().to_vec())?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Intents
    // ------------------------------------------------------------------------

    /// Records an intent once.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The intent was not known before
    /// * `Ok(false)` - The intent was already recorded (replay)
    pub fn record_intent(&self, intent: &TransferIntent) -> OracleResult<bool> {
        let value = serde_json::to_vec(intent)?;
        let swapped = self
            .intents
            .compare_and_swap(intent.key(), None::<&[u8]>, Some(value))?;
        Ok(swapped.is_ok())
    }

    // ------------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------------

    /// Inserts a job unless one already exists for its message id.
    pub fn create_job_if_absent(&self, job: &RelayJob) -> OracleResult<bool> {
        let value = serde_json::to_vec(job)?;
        let swapped = self
            .jobs
            .compare_and_swap(job.key(), None::<&[u8]>, Some(value))?;
        Ok(swapped.is_ok())
    }

    pub fn job(&self, bridge_id: &str, message_id: &H256) -> OracleResult<Option<RelayJob>> {
        match self.jobs.get(job_key(bridge_id, message_id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// All jobs of a bridge, ordered by message id.
    pub fn jobs_for_bridge(&self, bridge_id: &str) -> OracleResult<Vec<RelayJob>> {
        let prefix = format!("{}:", bridge_id);
        self.jobs
            .scan_prefix(prefix)
            .map(|item| -> OracleResult<RelayJob> {
                let (_, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    pub fn jobs_in_status(&self, bridge_id: &str, status: JobStatus) -> OracleResult<Vec<RelayJob>> {
        Ok(self
            .jobs_for_bridge(bridge_id)?
            .into_iter()
            .filter(|job| job.status == status)
            .collect())
    }

    pub fn job_counts(&self, bridge_id: &str) -> OracleResult<JobCounts> {
        let mut counts = JobCounts::default();
        for job in self.jobs_for_bridge(bridge_id)? {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::QuorumMet => counts.quorum_met += 1,
                JobStatus::Submitted => counts.submitted += 1,
                JobStatus::Confirmed => counts.confirmed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Applies `update` to a job that must currently be in `expected` status.
    ///
    /// The write is a compare-and-swap against the value that was read; a
    /// concurrent change makes the update re-run against the fresh value. A
    /// status change made by `update` must be an allowed transition.
    ///
    /// # Returns
    ///
    /// * `Ok(RelayJob)` - The job as written
    /// * `Err(OracleError::StatusMismatch)` - The job is no longer in `expected`
    /// * `Err(OracleError::InvalidTransition)` - `update` made a forbidden move
    pub fn update_job<F>(
        &self,
        bridge_id: &str,
        message_id: &H256,
        expected: JobStatus,
        mut update: F,
    ) -> OracleResult<RelayJob>
    where
        F: FnMut(&mut RelayJob) -> OracleResult<()>,
    {
        let key = job_key(bridge_id, message_id);
        loop {
            let current = self
                .jobs
                .get(&key)?
                .ok_or_else(|| OracleError::JobNotFound(key.clone()))?;
            let job: RelayJob = serde_json::from_slice(&current)?;

            if job.status != expected {
                return Err(OracleError::StatusMismatch {
                    message_id: hex_h256(message_id),
                    expected,
                    actual: job.status,
                });
            }

            let mut updated = job.clone();
            update(&mut updated)?;
            if updated.status != job.status && !job.status.can_transition_to(updated.status) {
                return Err(OracleError::InvalidTransition {
                    message_id: hex_h256(message_id),
                    from: job.status,
                    to: updated.status,
                });
            }
            updated.updated_at = Utc::now();

            let value = serde_json::to_vec(&updated)?;
            match self
                .jobs
                .compare_and_swap(&key, Some(&current), Some(value))?
            {
                Ok(()) => return Ok(updated),
                Err(_) => {
                    debug!(job = %key, "Concurrent job update, retrying");
                    continue;
                }
            }
        }
    }

    /// Moves a job from `from` to `to`, recording `last_error` when given.
    pub fn transition(
        &self,
        bridge_id: &str,
        message_id: &H256,
        from: JobStatus,
        to: JobStatus,
        last_error: Option<String>,
    ) -> OracleResult<RelayJob> {
        self.update_job(bridge_id, message_id, from, |job| {
            job.set_status(to);
            if last_error.is_some() {
                job.last_error = last_error.clone();
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Attestation inbox
    // ------------------------------------------------------------------------

    fn inbox_key(bridge_id: &str, message_id: &H256, signer_id: &str) -> String {
        format!("{}:{}:{}", bridge_id, hex_h256(message_id), signer_id)
    }

    /// Keeps an attestation whose job does not exist yet.
    ///
    /// A signer's newer attestation for the same message replaces the older
    /// one. New entries are refused once the bridge holds `capacity` of them.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The attestation is stashed
    /// * `Ok(false)` - The bridge's inbox is full
    pub fn stash_attestation(
        &self,
        bridge_id: &str,
        attestation: &Attestation,
        capacity: usize,
    ) -> OracleResult<bool> {
        let key = Self::inbox_key(bridge_id, &attestation.message_id, &attestation.signer_id);
        if !self.inbox.contains_key(&key)? && self.stashed_count(bridge_id) >= capacity {
            return Ok(false);
        }
        let entry = StashedAttestation {
            attestation: attestation.clone(),
            stashed_at: Utc::now(),
        };
        self.inbox.insert(key, serde_json::to_vec(&entry)?)?;
        Ok(true)
    }

    /// Number of stashed attestations of a bridge.
    pub fn stashed_count(&self, bridge_id: &str) -> usize {
        self.inbox.scan_prefix(format!("{}:", bridge_id)).count()
    }

    /// Stashed attestations of a message. Entries stay until removed.
    pub fn stashed(&self, bridge_id: &str, message_id: &H256) -> OracleResult<Vec<StashedAttestation>> {
        let prefix = format!("{}:{}:", bridge_id, hex_h256(message_id));
        self.inbox
            .scan_prefix(prefix)
            .map(|item| -> OracleResult<StashedAttestation> {
                let (_, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    pub fn remove_stashed(&self, bridge_id: &str, message_id: &H256, signer_id: &str) -> OracleResult<()> {
        self.inbox
            .remove(Self::inbox_key(bridge_id, message_id, signer_id))?;
        Ok(())
    }

    /// Drops stashed attestations of a bridge older than `cutoff`.
    ///
    /// # Returns
    ///
    /// * `Ok(usize)` - Number of entries removed
    pub fn prune_stashed(&self, bridge_id: &str, cutoff: DateTime<Utc>) -> OracleResult<usize> {
        let mut removed = 0;
        for item in self.inbox.scan_prefix(format!("{}:", bridge_id)) {
            let (key, value) = item?;
            let expired = match serde_json::from_slice::<StashedAttestation>(&value) {
                Ok(entry) => entry.stashed_at < cutoff,
                Err(_) => true,
            };
            if expired {
                self.inbox.remove(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
