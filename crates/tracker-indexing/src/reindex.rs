//! Reindexing of individual transactions.
//!
//! Each node touched by a transaction is written to the index from its
//! current state in the store: live nodes are updated, deleted nodes are
//! removed through their child association.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracker_types::{ChildAssocRef, TxnId};

use crate::collaborators::{IndexSession, Indexer, ReindexStats, TransactionSource};
use crate::error::IndexingError;
use crate::runner::{TransactionOptions, TransactionRunner};

/// Nodes written between shutdown checks.
pub const SHUTDOWN_CHECK_INTERVAL: usize = 100;

/// Called after every node. An error stops the work.
pub type ProgressFn<'a> = &'a (dyn Fn() -> Result<(), IndexingError> + Sync);

/// Holds an index commit back until it is this work item's turn.
pub trait CommitBarrier {
    fn wait_for_turn(&self) -> Result<(), IndexingError>;
}

/// Writes transactions to the index.
pub struct Reindexer {
    source: Arc<dyn TransactionSource>,
    indexer: Arc<dyn Indexer>,
    runner: Arc<dyn TransactionRunner>,
    shutdown: CancellationToken,
}

impl Reindexer {
    pub fn new(
        source: Arc<dyn TransactionSource>,
        indexer: Arc<dyn Indexer>,
        runner: Arc<dyn TransactionRunner>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            indexer,
            runner,
            shutdown,
        }
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Write one transaction's nodes into an open session.
    pub fn reindex_into(
        &self,
        session: &mut dyn IndexSession,
        txn_id: TxnId,
        progress: ProgressFn<'_>,
    ) -> Result<ReindexStats, IndexingError> {
        let mut stats = ReindexStats::new();
        let changes = self.source.changed_nodes(txn_id)?;
        debug!(txn_id, nodes = changes.len(), "Reindexing transaction");

        for (count, change) in changes.into_iter().enumerate() {
            if change.deleted {
                session.delete_node(&ChildAssocRef::for_deleted(change.node))?;
                stats.deleted += 1;
            } else {
                session.update_node(&change.node)?;
                stats.updated += 1;
            }
            progress()?;

            if (count + 1) % SHUTDOWN_CHECK_INTERVAL == 0 && self.shutdown.is_cancelled() {
                return Err(IndexingError::Terminated(format!(
                    "shutdown while reindexing transaction {}",
                    txn_id
                )));
            }
        }
        stats.transactions += 1;
        Ok(stats)
    }

    /// Reindex a group of transactions as one index commit, in a fresh
    /// retrying transaction. With a barrier the commit waits for its turn.
    pub fn reindex_batch(
        &self,
        txn_ids: &[TxnId],
        barrier: Option<&dyn CommitBarrier>,
        progress: ProgressFn<'_>,
    ) -> Result<ReindexStats, IndexingError> {
        let mut stats = ReindexStats::new();
        self.runner.run(TransactionOptions::read_only_new(), &mut || {
            stats = ReindexStats::new();
            let mut session = self.indexer.begin()?;
            for &txn_id in txn_ids {
                match self.reindex_into(session.as_mut(), txn_id, progress) {
                    Ok(txn_stats) => stats.merge(&txn_stats),
                    Err(e) => {
                        session.rollback();
                        return Err(e);
                    }
                }
            }
            if let Some(barrier) = barrier {
                if let Err(e) = barrier.wait_for_turn() {
                    session.rollback();
                    return Err(e);
                }
            }
            session.commit()
        })?;
        Ok(stats)
    }

    /// Reindex a single transaction on the calling thread.
    pub fn reindex_transaction(&self, txn_id: TxnId) -> Result<ReindexStats, IndexingError> {
        let mut stats = ReindexStats::new();
        self.runner.run(TransactionOptions::read_only(), &mut || {
            let mut session = self.indexer.begin()?;
            stats = match self.reindex_into(session.as_mut(), txn_id, &|| Ok(())) {
                Ok(txn_stats) => txn_stats,
                Err(e) => {
                    session.rollback();
                    return Err(e);
                }
            };
            session.commit()
        })?;
        Ok(stats)
    }
}
