//! Error types for the reindexing engine.

use thiserror::Error;
use tracker_storage::StorageError;
use tracker_types::{TrackerError, TxnId};

/// Errors that can occur while tracking or rebuilding the index
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Transient concurrency failure; the transaction runner retries these
    #[error("Conflict error: {0}")]
    Conflict(String),

    /// Node store query failed
    #[error("Store error: {0}")]
    Store(String),

    /// Index writer or index query failed
    #[error("Index error: {0}")]
    Index(String),

    /// Checkpoint load/save issues
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Work stopped by shutdown or by the inactivity guard. Not a failure.
    #[error("Reindex terminated: {0}")]
    Terminated(String),

    /// A full rebuild running with stop-on-error hit a failing transaction
    #[error("Recovery aborted at transaction {txn_id}: {source}")]
    Aborted {
        txn_id: TxnId,
        #[source]
        source: Box<IndexingError>,
    },

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),
}

impl IndexingError {
    /// Whether retrying the same work may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexingError::Conflict(_))
    }

    /// Whether this is the shutdown/kill outcome rather than a failure.
    pub fn is_terminated(&self) -> bool {
        matches!(self, IndexingError::Terminated(_))
    }
}

impl From<serde_json::Error> for IndexingError {
    fn from(err: serde_json::Error) -> Self {
        IndexingError::Serialization(err.to_string())
    }
}

impl From<TrackerError> for IndexingError {
    fn from(err: TrackerError) -> Self {
        IndexingError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexingError::Checkpoint("failed to load".to_string());
        assert_eq!(err.to_string(), "Checkpoint error: failed to load");

        let err = IndexingError::Index("writer closed".to_string());
        assert_eq!(err.to_string(), "Index error: writer closed");

        let err = IndexingError::Aborted {
            txn_id: 42,
            source: Box::new(IndexingError::Index("bad node".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "Recovery aborted at transaction 42: Index error: bad node"
        );
    }

    #[test]
    fn test_classification() {
        assert!(IndexingError::Conflict("optimistic lock".to_string()).is_transient());
        assert!(!IndexingError::Store("down".to_string()).is_transient());
        assert!(IndexingError::Terminated("shutdown".to_string()).is_terminated());
        assert!(!IndexingError::Index("x".to_string()).is_terminated());
    }

    #[test]
    fn test_from_serde_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let indexing_err: IndexingError = json_err.into();
        assert!(matches!(indexing_err, IndexingError::Serialization(_)));
    }
}
