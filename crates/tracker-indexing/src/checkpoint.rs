//! Checkpoint tracking for full recovery.
//!
//! A full rebuild of a large repository can take hours. After every
//! drained iteration the driver records how far it got, so a restart can
//! resume from there instead of from the dawn of time.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracker_storage::Storage;
use tracker_types::{TimestampMs, TxnId};

use crate::error::IndexingError;

/// Storage key of the full recovery checkpoint.
pub const FULL_RECOVERY_JOB: &str = "full_recovery";

/// Progress of a full recovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryCheckpoint {
    /// Commit time the next iteration starts from
    pub from_time_inclusive: Option<TimestampMs>,

    /// Transactions at `from_time_inclusive` that were already processed
    #[serde(default)]
    pub previous_txn_ids: Vec<TxnId>,

    /// Transactions processed so far
    pub processed_count: u64,

    /// Set once the sweep reached the end of the transaction log
    #[serde(default)]
    pub completed: bool,

    /// Timestamp of last save (milliseconds since epoch for JSON compatibility)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_processed_time: DateTime<Utc>,

    /// When the run started (milliseconds since epoch)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Default for RecoveryCheckpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryCheckpoint {
    /// A checkpoint for a run starting at the first transaction.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            from_time_inclusive: None,
            previous_txn_ids: Vec::new(),
            processed_count: 0,
            completed: false,
            last_processed_time: now,
            created_at: now,
        }
    }

    /// Record the position reached after an iteration.
    pub fn update(
        &mut self,
        from_time_inclusive: Option<TimestampMs>,
        previous_txn_ids: Vec<TxnId>,
        items_processed: u64,
    ) {
        self.from_time_inclusive = from_time_inclusive;
        self.previous_txn_ids = previous_txn_ids;
        self.last_processed_time = Utc::now();
        self.processed_count += items_processed;
    }

    pub fn mark_completed(&mut self) {
        self.completed = true;
        self.last_processed_time = Utc::now();
    }

    /// Serialize to JSON bytes for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexingError> {
        serde_json::to_vec(self).map_err(IndexingError::from)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexingError> {
        serde_json::from_slice(bytes).map_err(IndexingError::from)
    }
}

/// Durable home for job checkpoints.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, job: &str) -> Result<Option<Vec<u8>>, IndexingError>;
    fn save(&self, job: &str, bytes: &[u8]) -> Result<(), IndexingError>;
    fn clear(&self, job: &str) -> Result<(), IndexingError>;
}

impl CheckpointStore for Storage {
    fn load(&self, job: &str) -> Result<Option<Vec<u8>>, IndexingError> {
        Ok(self.get_checkpoint(job)?)
    }

    fn save(&self, job: &str, bytes: &[u8]) -> Result<(), IndexingError> {
        self.put_checkpoint(job, bytes)?;
        Ok(())
    }

    fn clear(&self, job: &str) -> Result<(), IndexingError> {
        self.delete_checkpoint(job)?;
        Ok(())
    }
}

/// Checkpoints kept in memory. Lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&self, job: &str) -> Result<Option<Vec<u8>>, IndexingError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(job).cloned())
    }

    fn save(&self, job: &str, bytes: &[u8]) -> Result<(), IndexingError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(job.to_string(), bytes.to_vec());
        Ok(())
    }

    fn clear(&self, job: &str) -> Result<(), IndexingError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(job);
        Ok(())
    }
}

/// Load and decode a recovery checkpoint.
pub fn load_recovery_checkpoint(
    store: &dyn CheckpointStore,
) -> Result<Option<RecoveryCheckpoint>, IndexingError> {
    match store.load(FULL_RECOVERY_JOB)? {
        Some(bytes) => Ok(Some(RecoveryCheckpoint::from_bytes(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and save a recovery checkpoint.
pub fn save_recovery_checkpoint(
    store: &dyn CheckpointStore,
    checkpoint: &RecoveryCheckpoint,
) -> Result<(), IndexingError> {
    store.save(FULL_RECOVERY_JOB, &checkpoint.to_bytes()?)
}
