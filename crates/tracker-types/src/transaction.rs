//! Transaction records supplied by the authoritative node store.
//!
//! A transaction is identified by a numeric ID, but the ID order and the
//! commit-time order are not guaranteed to agree: a transaction with a
//! higher ID may commit (and become visible) before a lower one. Everything
//! downstream orders by commit time first and ID second.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Numeric transaction identifier, assigned when the transaction starts.
pub type TxnId = u64;

/// Milliseconds since the Unix epoch.
pub type TimestampMs = i64;

/// An immutable record of one committed (or committing) store transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction ID
    pub id: TxnId,

    /// Commit time; `None` while the transaction is not yet visible
    pub commit_time_ms: Option<TimestampMs>,

    /// Change identifier stamped on every index document the transaction wrote
    pub change_txn_id: String,

    /// Number of nodes created or updated
    pub update_count: u32,

    /// Number of nodes deleted
    pub delete_count: u32,

    /// Whether the transaction was committed by another server in the cluster
    #[serde(default)]
    pub remote: bool,
}

impl TransactionRecord {
    /// Create a record with no recorded changes.
    pub fn new(id: TxnId, commit_time_ms: Option<TimestampMs>, change_txn_id: impl Into<String>) -> Self {
        Self {
            id,
            commit_time_ms,
            change_txn_id: change_txn_id.into(),
            update_count: 0,
            delete_count: 0,
            remote: false,
        }
    }

    /// Set the update and delete counts.
    pub fn with_counts(mut self, update_count: u32, delete_count: u32) -> Self {
        self.update_count = update_count;
        self.delete_count = delete_count;
        self
    }

    /// Mark the transaction as committed by a remote server.
    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    /// Whether the transaction has a commit time.
    pub fn is_committed(&self) -> bool {
        self.commit_time_ms.is_some()
    }

    /// Whether the transaction changed nothing at all.
    pub fn is_empty(&self) -> bool {
        self.update_count == 0 && self.delete_count == 0
    }

    /// Ordering by commit time, then by ID. Uncommitted records sort last.
    pub fn commit_order(&self, other: &Self) -> Ordering {
        let lhs = self.commit_time_ms.unwrap_or(TimestampMs::MAX);
        let rhs = other.commit_time_ms.unwrap_or(TimestampMs::MAX);
        lhs.cmp(&rhs).then(self.id.cmp(&other.id))
    }
}

impl std::fmt::Display for TransactionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.commit_time_ms {
            Some(time) => write!(f, "Transaction[id={}, commit_time_ms={}]", self.id, time),
            None => write!(f, "Transaction[id={}, commit_time_ms=---]", self.id),
        }
    }
}
