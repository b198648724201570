//! Decides whether a transaction's effects are visible in the index.

use std::sync::Arc;

use tracing::debug;
use tracker_types::{Presence, StoreRef, TransactionRecord, TxnId};

use crate::collaborators::{IndexProbe, TransactionSource};
use crate::error::IndexingError;

/// Answers "is this transaction in the index" by probing each store
/// partition for the transaction's change ID, falling back to per-node
/// checks for delete-only transactions.
#[derive(Clone)]
pub struct PresenceOracle {
    source: Arc<dyn TransactionSource>,
    probe: Arc<dyn IndexProbe>,
}

impl PresenceOracle {
    pub fn new(source: Arc<dyn TransactionSource>, probe: Arc<dyn IndexProbe>) -> Self {
        Self { source, probe }
    }

    /// Indexed stores, most common first: the live spaces store, then the
    /// archive store, then the rest in store order. AVM stores are never
    /// indexed and are left out.
    pub fn ordered_stores(&self) -> Result<Vec<StoreRef>, IndexingError> {
        let mut stores: Vec<StoreRef> = self
            .source
            .stores()?
            .into_iter()
            .filter(|store| !store.is_avm())
            .collect();

        for preferred in [
            StoreRef::archive_spaces_store(),
            StoreRef::workspace_spaces_store(),
        ] {
            if let Some(pos) = stores.iter().position(|s| *s == preferred) {
                let store = stores.remove(pos);
                stores.insert(0, store);
            }
        }
        Ok(stores)
    }

    /// Presence of a transaction looked up by ID. Unknown IDs count as
    /// present since there is nothing to index.
    pub fn presence_by_id(&self, txn_id: TxnId) -> Result<Presence, IndexingError> {
        match self.source.transaction_by_id(txn_id)? {
            Some(txn) => self.presence(&txn),
            None => Ok(Presence::Yes),
        }
    }

    /// Presence of a single transaction.
    pub fn presence(&self, txn: &TransactionRecord) -> Result<Presence, IndexingError> {
        if txn.commit_time_ms.is_none() {
            return Ok(Presence::Yes);
        }
        let stores = self.ordered_stores()?;
        self.presence_in(txn, &stores)
    }

    /// Presence of a transaction against a store list already resolved
    /// with [`ordered_stores`](Self::ordered_stores). Callers probing many
    /// transactions resolve the stores once and pass them here.
    pub fn presence_in(&self, txn: &TransactionRecord, stores: &[StoreRef]) -> Result<Presence, IndexingError> {
        if txn.commit_time_ms.is_none() {
            return Ok(Presence::Yes);
        }
        debug!(txn_id = txn.id, "Checking for transaction in index");

        for store in stores {
            if self.probe.contains_transaction(store, &txn.change_txn_id)? {
                debug!(txn_id = txn.id, store = %store, "Index has results for transaction");
                return Ok(Presence::Yes);
            }
        }

        // Nothing in the index carries the change ID. That is expected when
        // the transaction wrote no documents.
        let result = if self.source.update_count(txn.id)? > 0 {
            Presence::No
        } else if self.source.delete_count(txn.id)? == 0 {
            Presence::Yes
        } else {
            self.deletions_presence(txn.id, stores)?
        };

        debug!(txn_id = txn.id, presence = %result, "Transaction presence in index");
        Ok(result)
    }

    /// A delete-only transaction is present once every node it touched is
    /// gone from the index.
    fn deletions_presence(&self, txn_id: TxnId, stores: &[StoreRef]) -> Result<Presence, IndexingError> {
        let changes = self.source.changed_nodes(txn_id)?;
        for store in stores {
            for change in changes.iter().filter(|c| c.node.store == *store) {
                if self.probe.contains_node(store, &change.node)? {
                    debug!(txn_id, node = %change.node, "Deleted node still in index");
                    return Ok(Presence::No);
                }
            }
        }
        Ok(Presence::Yes)
    }

    /// Verdict over the most recent transactions.
    ///
    /// Any missing transaction decides `No`. Otherwise at least two
    /// confirmed transactions are needed for `Yes`: a lone zero-change
    /// transaction, such as the one written at first startup, proves
    /// nothing about the index.
    pub fn end_sample(&self, txns: &[TransactionRecord]) -> Result<Presence, IndexingError> {
        let stores = self.ordered_stores()?;
        let mut yes_count = 0;
        for txn in txns {
            match self.presence_in(txn, &stores)? {
                Presence::No => return Ok(Presence::No),
                Presence::Yes => yes_count += 1,
                Presence::Indeterminate => {}
            }
        }
        if yes_count > 1 {
            Ok(Presence::Yes)
        } else {
            Ok(Presence::Indeterminate)
        }
    }

    /// Verdict over the oldest transactions: `No` if any is missing,
    /// otherwise the verdict for the last one sampled.
    pub fn start_sample(&self, txns: &[TransactionRecord]) -> Result<Presence, IndexingError> {
        let stores = self.ordered_stores()?;
        let mut current = Presence::Indeterminate;
        for txn in txns {
            current = self.presence_in(txn, &stores)?;
            if current.is_missing() {
                return Ok(Presence::No);
            }
        }
        Ok(current)
    }
}
