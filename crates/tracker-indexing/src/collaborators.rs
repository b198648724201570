//! Interfaces to the systems the engine keeps in step.
//!
//! The node store is authoritative: it owns the transaction log and the
//! current state of every node. The index is a secondary copy that is
//! written asynchronously and can fall behind. The engine only ever reads
//! from the store and only ever writes to the index.

use tracker_types::{ChildAssocRef, NodeChange, NodeRef, StoreRef, TimestampMs, TransactionRecord, TxnId};

use crate::error::IndexingError;

/// Direction of a commit-time ordered transaction query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOrder {
    Ascending,
    Descending,
}

/// A window over the transaction log.
///
/// Results are ordered by commit time then ID, in the requested direction,
/// and only contain transactions that have a commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionQuery {
    pub from_time_inclusive: Option<TimestampMs>,
    pub to_time_exclusive: Option<TimestampMs>,
    pub limit: usize,
    pub exclude_ids: Vec<TxnId>,
    pub remote_only: bool,
    pub order: CommitOrder,
}

impl TransactionQuery {
    pub fn ascending(from_time_inclusive: Option<TimestampMs>, to_time_exclusive: Option<TimestampMs>) -> Self {
        Self {
            from_time_inclusive,
            to_time_exclusive,
            limit: usize::MAX,
            exclude_ids: Vec::new(),
            remote_only: false,
            order: CommitOrder::Ascending,
        }
    }

    pub fn descending(from_time_inclusive: Option<TimestampMs>, to_time_exclusive: Option<TimestampMs>) -> Self {
        Self {
            order: CommitOrder::Descending,
            ..Self::ascending(from_time_inclusive, to_time_exclusive)
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn excluding(mut self, ids: &[TxnId]) -> Self {
        self.exclude_ids = ids.to_vec();
        self
    }

    pub fn with_remote_only(mut self, remote_only: bool) -> Self {
        self.remote_only = remote_only;
        self
    }

    /// Whether a record falls inside this window. Ordering and limit are
    /// left to the caller.
    pub fn matches(&self, txn: &TransactionRecord) -> bool {
        let Some(commit_time) = txn.commit_time_ms else {
            return false;
        };
        if self.from_time_inclusive.is_some_and(|from| commit_time < from) {
            return false;
        }
        if self.to_time_exclusive.is_some_and(|to| commit_time >= to) {
            return false;
        }
        if self.remote_only && !txn.remote {
            return false;
        }
        !self.exclude_ids.contains(&txn.id)
    }
}

/// Read access to the authoritative node store.
pub trait TransactionSource: Send + Sync {
    /// All store partitions known to the node store.
    fn stores(&self) -> Result<Vec<StoreRef>, IndexingError>;

    /// Transactions in a commit-time window.
    fn list_transactions(&self, query: &TransactionQuery) -> Result<Vec<TransactionRecord>, IndexingError>;

    /// Look up a single transaction. Unknown IDs give `None`.
    fn transaction_by_id(&self, txn_id: TxnId) -> Result<Option<TransactionRecord>, IndexingError>;

    /// Look up several transactions, ordered by commit time then ID.
    /// Unknown IDs are left out. Records without a commit time may be
    /// returned and sort last.
    fn transactions_by_ids(&self, txn_ids: &[TxnId]) -> Result<Vec<TransactionRecord>, IndexingError>;

    /// Nodes touched by a transaction, each with its current status.
    /// Nodes that no longer exist at all are left out.
    fn changed_nodes(&self, txn_id: TxnId) -> Result<Vec<NodeChange>, IndexingError>;

    /// Number of committed transactions.
    fn transaction_count(&self) -> Result<u64, IndexingError>;

    fn update_count(&self, txn_id: TxnId) -> Result<u32, IndexingError> {
        Ok(self
            .transaction_by_id(txn_id)?
            .map(|txn| txn.update_count)
            .unwrap_or(0))
    }

    fn delete_count(&self, txn_id: TxnId) -> Result<u32, IndexingError> {
        Ok(self
            .transaction_by_id(txn_id)?
            .map(|txn| txn.delete_count)
            .unwrap_or(0))
    }
}

/// Point queries against the index.
pub trait IndexProbe: Send + Sync {
    /// Whether any document in the store partition carries the change ID.
    fn contains_transaction(&self, store: &StoreRef, change_txn_id: &str) -> Result<bool, IndexingError>;

    /// Whether the node has a document in the store partition.
    fn contains_node(&self, store: &StoreRef, node: &NodeRef) -> Result<bool, IndexingError>;
}

/// Opens index write sessions.
pub trait Indexer: Send + Sync {
    fn begin(&self) -> Result<Box<dyn IndexSession + '_>, IndexingError>;
}

/// A unit of index writes that becomes visible on commit.
pub trait IndexSession: Send {
    /// Reindex the node from its current state in the store.
    fn update_node(&mut self, node: &NodeRef) -> Result<(), IndexingError>;

    /// Remove the association's child from the index.
    fn delete_node(&mut self, assoc: &ChildAssocRef) -> Result<(), IndexingError>;

    fn commit(self: Box<Self>) -> Result<(), IndexingError>;

    fn rollback(self: Box<Self>);
}

/// The in-transaction indexing hook of the node store.
pub trait NodeIndexer: Send + Sync {
    fn set_enabled(&self, enabled: bool);
}

/// Switches the node store between read-write and read-only.
pub trait WriteLock: Send + Sync {
    fn is_read_only(&self) -> bool;
    fn set_read_only(&self, read_only: bool);
}

/// Observes tracker progress.
pub trait TrackerListener: Send + Sync {
    /// Called after each non-empty tick with the commit-time range covered.
    fn indexed_transactions(&self, from_time_inclusive: TimestampMs, to_time_exclusive: TimestampMs);
}

/// Counts from reindexing one or more transactions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReindexStats {
    /// Transactions reindexed
    pub transactions: usize,
    /// Nodes written to the index
    pub updated: usize,
    /// Nodes removed from the index
    pub deleted: usize,
}

impl ReindexStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge another result into this one.
    pub fn merge(&mut self, other: &ReindexStats) {
        self.transactions += other.transactions;
        self.updated += other.updated;
        self.deleted += other.deleted;
    }

    /// Nodes touched (updated + deleted).
    pub fn nodes(&self) -> usize {
        self.updated + self.deleted
    }
}
