//! Void bookkeeping.
//!
//! A void is a transaction ID that lies between two IDs seen in an
//! ascending commit-time scan but was not itself returned. It usually
//! belongs to a transaction that started earlier but became visible later.
//! Each void is re-probed on every tick until it either turns up, proves to
//! be in the index already, or is too old to matter.

use std::collections::BTreeMap;

use tracing::debug;
use tracker_types::{TimestampMs, TxnId};

use crate::collaborators::TransactionSource;
use crate::error::IndexingError;
use crate::presence::PresenceOracle;

/// Voids are re-probed in batches of this size.
pub const VOID_BATCH_SIZE: usize = 100;

/// A transaction ID that was skipped by the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoidRecord {
    pub txn_id: TxnId,
    /// Commit time of the higher neighbour that exposed the void
    pub discovered_commit_time_ms: TimestampMs,
}

/// Live voids keyed by transaction ID. Only touched from the tracker tick.
#[derive(Debug, Default)]
pub struct VoidTracker {
    voids: BTreeMap<TxnId, VoidRecord>,
}

impl VoidTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.voids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voids.is_empty()
    }

    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.voids.contains_key(&txn_id)
    }

    /// Forget a void, typically because the scan has now returned it.
    pub fn remove(&mut self, txn_id: TxnId) -> bool {
        self.voids.remove(&txn_id).is_some()
    }

    /// Record every ID strictly between `low_exclusive` and `high_exclusive`,
    /// stamped with the commit time of the higher neighbour. Returns the
    /// number of IDs recorded.
    pub fn record_range(
        &mut self,
        low_exclusive: TxnId,
        high_exclusive: TxnId,
        commit_time_hint: TimestampMs,
    ) -> usize {
        let mut count = 0;
        for txn_id in low_exclusive.saturating_add(1)..high_exclusive {
            self.voids.insert(
                txn_id,
                VoidRecord {
                    txn_id,
                    discovered_commit_time_ms: commit_time_hint,
                },
            );
            count += 1;
        }
        if count > 0 {
            debug!(
                count,
                low = low_exclusive,
                high = high_exclusive,
                "Voids detected"
            );
        }
        count
    }

    /// Re-probe live voids and drop stale ones.
    ///
    /// A void that now resolves to a committed transaction already in the
    /// index is dropped. One that resolves to a committed transaction
    /// missing from the index yields its commit time; the earliest such
    /// time is returned so the caller can rewind. Independently, voids
    /// stamped before `expire_before` are dropped.
    pub fn check_and_expire(
        &mut self,
        source: &dyn TransactionSource,
        oracle: &PresenceOracle,
        expire_before: TimestampMs,
    ) -> Result<Option<TimestampMs>, IndexingError> {
        if self.voids.is_empty() {
            return Ok(None);
        }
        let stores = oracle.ordered_stores()?;
        let mut earliest: Option<TimestampMs> = None;
        let mut to_remove = Vec::new();
        let mut expired = Vec::new();

        let ids: Vec<TxnId> = self.voids.keys().copied().collect();
        for batch in ids.chunks(VOID_BATCH_SIZE) {
            for txn in source.transactions_by_ids(batch)? {
                let Some(commit_time) = txn.commit_time_ms else {
                    continue;
                };
                if !oracle.presence_in(&txn, &stores)?.is_missing() {
                    // Committed and indexed, e.g. through in-transaction indexing
                    to_remove.push(txn.id);
                } else {
                    // Results are in commit-time order so this is the batch minimum
                    earliest = Some(earliest.map_or(commit_time, |e| e.min(commit_time)));
                    break;
                }
            }
            for txn_id in batch {
                if let Some(void) = self.voids.get(txn_id) {
                    if void.discovered_commit_time_ms < expire_before {
                        expired.push(*void);
                    }
                }
            }
        }

        let before = self.voids.len();
        for txn_id in to_remove {
            self.voids.remove(&txn_id);
        }
        for void in expired {
            if self.voids.remove(&void.txn_id).is_some() {
                debug!(
                    txn_id = void.txn_id,
                    discovered_commit_time_ms = void.discovered_commit_time_ms,
                    "Void expired"
                );
            }
        }
        if before != self.voids.len() {
            debug!(before, after = self.voids.len(), "Void count changed");
        }
        if let Some(time) = earliest {
            debug!(commit_time_ms = time, "Void filled");
        }
        Ok(earliest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryIndex, MemoryNodeStore};
    use std::sync::Arc;
    use tracker_types::{NodeChange, NodeRef, StoreRef};

    fn node(id: &str) -> NodeRef {
        NodeRef::new(StoreRef::workspace_spaces_store(), id)
    }

    fn setup() -> (Arc<MemoryNodeStore>, Arc<MemoryIndex>, PresenceOracle) {
        let store = Arc::new(MemoryNodeStore::new());
        let index = Arc::new(MemoryIndex::new(store.clone()));
        let oracle = PresenceOracle::new(store.clone(), index.clone());
        (store, index, oracle)
    }

    #[test]
    fn test_record_range_is_exclusive() {
        let mut voids = VoidTracker::new();
        assert_eq!(voids.record_range(2, 5, 1_000), 2);
        assert!(voids.contains(3));
        assert!(voids.contains(4));
        assert!(!voids.contains(2));
        assert!(!voids.contains(5));
        assert_eq!(voids.record_range(5, 6, 1_000), 0);
    }

    #[test]
    fn test_expiry_uses_discovery_time() {
        let (store, _index, oracle) = setup();
        let mut voids = VoidTracker::new();
        voids.record_range(1, 3, 1_000);
        voids.record_range(5, 7, 2_000);

        voids.check_and_expire(&*store, &oracle, 1_000).unwrap();
        assert_eq!(voids.len(), 2);

        voids.check_and_expire(&*store, &oracle, 1_001).unwrap();
        assert!(!voids.contains(2));
        assert!(voids.contains(6));
    }

    #[test]
    fn test_unresolved_voids_stay_until_expiry() {
        let (store, _index, oracle) = setup();
        let mut voids = VoidTracker::new();
        voids.record_range(10, 13, 5_000);

        let earliest = voids.check_and_expire(&*store, &oracle, 4_000).unwrap();
        assert!(earliest.is_none());
        assert_eq!(voids.len(), 2);

        voids.check_and_expire(&*store, &oracle, 5_001).unwrap();
        assert!(voids.is_empty());
    }

    #[test]
    fn test_filled_void_reports_earliest_commit_time() {
        let (store, _index, oracle) = setup();
        let first = store.reserve_transaction();
        let second = store.reserve_transaction();
        let mut voids = VoidTracker::new();
        voids.record_range(first - 1, second + 1, 9_000);

        // Pending transactions are skipped
        assert!(voids.check_and_expire(&*store, &oracle, 0).unwrap().is_none());

        store
            .complete_transaction(second, 3_000, vec![NodeChange::updated(node("b"))])
            .unwrap();
        store
            .complete_transaction(first, 2_000, vec![NodeChange::updated(node("a"))])
            .unwrap();

        let earliest = voids.check_and_expire(&*store, &oracle, 0).unwrap();
        assert_eq!(earliest, Some(2_000));
        // Still live until the scan picks the transactions up
        assert_eq!(voids.len(), 2);
    }

    #[test]
    fn test_filled_void_already_indexed_is_dropped() {
        let (store, index, oracle) = setup();
        let id = store.reserve_transaction();
        let mut voids = VoidTracker::new();
        voids.record_range(id - 1, id + 1, 9_000);

        store
            .complete_transaction(id, 2_000, vec![NodeChange::updated(node("a"))])
            .unwrap();
        index.index_transaction_now(id).unwrap();

        assert!(voids.check_and_expire(&*store, &oracle, 0).unwrap().is_none());
        assert!(voids.is_empty());
    }
}
