//! RocksDB wrapper for tracker state.
//!
//! Provides:
//! - Database open with column family setup
//! - Named checkpoints for resumable jobs

use rocksdb::{Options, DB};
use std::path::Path;
use tracing::{debug, info};

use crate::column_families::{build_cf_descriptors, ALL_CF_NAMES, CF_CHECKPOINTS};
use crate::error::StorageError;
use crate::keys::CheckpointKey;

/// Main storage interface for the tracker
pub struct Storage {
    db: DB,
}

impl Storage {
    /// Open storage at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(2);

        let cf_descriptors = build_cf_descriptors();
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        Ok(Self { db })
    }

    fn checkpoints_cf(&self) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(CF_CHECKPOINTS)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_CHECKPOINTS.to_string()))
    }

    /// Store a checkpoint, replacing any previous one for the job
    pub fn put_checkpoint(
        &self,
        job_name: &str,
        checkpoint_bytes: &[u8],
    ) -> Result<(), StorageError> {
        let cf = self.checkpoints_cf()?;
        let key = CheckpointKey::new(job_name);
        self.db.put_cf(cf, key.to_bytes(), checkpoint_bytes)?;
        debug!(job = %job_name, bytes = checkpoint_bytes.len(), "Stored checkpoint");
        Ok(())
    }

    /// Get the checkpoint for a job
    pub fn get_checkpoint(&self, job_name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.checkpoints_cf()?;
        let key = CheckpointKey::new(job_name);
        let result = self.db.get_cf(cf, key.to_bytes())?;
        Ok(result)
    }

    /// Remove the checkpoint for a job. Missing checkpoints are not an error.
    pub fn delete_checkpoint(&self, job_name: &str) -> Result<(), StorageError> {
        let cf = self.checkpoints_cf()?;
        let key = CheckpointKey::new(job_name);
        self.db.delete_cf(cf, key.to_bytes())?;
        debug!(job = %job_name, "Deleted checkpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_open_creates_column_families() {
        let (storage, _temp) = create_test_storage();
        for cf_name in ALL_CF_NAMES {
            assert!(
                storage.db.cf_handle(cf_name).is_some(),
                "CF {} should exist",
                cf_name
            );
        }
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let (storage, _temp) = create_test_storage();

        let job_name = "full_recovery";
        let checkpoint_data = b"checkpoint state";

        storage.put_checkpoint(job_name, checkpoint_data).unwrap();
        let retrieved = storage.get_checkpoint(job_name).unwrap();

        assert_eq!(retrieved, Some(checkpoint_data.to_vec()));
    }

    #[test]
    fn test_checkpoint_overwrite_and_delete() {
        let (storage, _temp) = create_test_storage();

        storage.put_checkpoint("job", b"first").unwrap();
        storage.put_checkpoint("job", b"second").unwrap();
        assert_eq!(storage.get_checkpoint("job").unwrap(), Some(b"second".to_vec()));

        storage.delete_checkpoint("job").unwrap();
        assert!(storage.get_checkpoint("job").unwrap().is_none());

        // Deleting again is fine
        storage.delete_checkpoint("job").unwrap();
    }

    #[test]
    fn test_checkpoint_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = Storage::open(temp_dir.path()).unwrap();
            storage.put_checkpoint("job", b"state").unwrap();
        }
        let storage = Storage::open(temp_dir.path()).unwrap();
        assert_eq!(storage.get_checkpoint("job").unwrap(), Some(b"state".to_vec()));
    }
}
