//! In-memory node store and index.
//!
//! Small, fully synchronous implementations of the collaborator traits.
//! They are used by the unit tests and the end-to-end harness, and are
//! handy for trying the engine without a real store behind it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracker_types::{
    ChildAssocRef, NodeChange, NodeRef, StoreRef, TimestampMs, TransactionRecord, TxnId,
};

use crate::collaborators::{
    CommitOrder, IndexProbe, IndexSession, Indexer, NodeIndexer, TransactionQuery,
    TransactionSource, WriteLock,
};
use crate::error::IndexingError;

/// Called by index sessions before each node write.
pub type UpdateHook = Arc<dyn Fn(&NodeRef) -> Result<(), IndexingError> + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredTransaction {
    record: TransactionRecord,
    changes: Vec<NodeRef>,
}

#[derive(Debug, Clone, Copy)]
struct NodeEntry {
    txn_id: TxnId,
    deleted: bool,
}

#[derive(Debug, Default)]
struct NodeStoreState {
    next_id: TxnId,
    transactions: BTreeMap<TxnId, StoredTransaction>,
    nodes: HashMap<NodeRef, NodeEntry>,
    stores: BTreeSet<StoreRef>,
}

/// Change ID stamped on every document written for a transaction.
pub fn change_txn_id(txn_id: TxnId) -> String {
    format!("txn-{:08}", txn_id)
}

/// A node store holding its transaction log in memory.
#[derive(Debug)]
pub struct MemoryNodeStore {
    state: RwLock<NodeStoreState>,
    read_only: AtomicBool,
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        let mut stores = BTreeSet::new();
        stores.insert(StoreRef::workspace_spaces_store());
        Self {
            state: RwLock::new(NodeStoreState {
                next_id: 1,
                stores,
                ..Default::default()
            }),
            read_only: AtomicBool::new(false),
        }
    }

    pub fn add_store(&self, store: StoreRef) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.stores.insert(store);
    }

    /// Commit a local transaction that is visible immediately.
    pub fn commit_transaction(&self, commit_time_ms: TimestampMs, changes: Vec<NodeChange>) -> TxnId {
        self.commit_with(commit_time_ms, changes, false)
    }

    /// Commit a transaction that arrived from another cluster member.
    pub fn commit_remote_transaction(&self, commit_time_ms: TimestampMs, changes: Vec<NodeChange>) -> TxnId {
        self.commit_with(commit_time_ms, changes, true)
    }

    fn commit_with(&self, commit_time_ms: TimestampMs, changes: Vec<NodeChange>, remote: bool) -> TxnId {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let txn_id = state.next_id;
        state.next_id += 1;
        Self::apply(&mut state, txn_id, Some(commit_time_ms), changes, remote);
        txn_id
    }

    /// Allocate an ID for a transaction that is still running. It has no
    /// commit time and is invisible to commit-time queries until completed.
    pub fn reserve_transaction(&self) -> TxnId {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let txn_id = state.next_id;
        state.next_id += 1;
        Self::apply(&mut state, txn_id, None, Vec::new(), false);
        txn_id
    }

    /// Finish a reserved transaction.
    pub fn complete_transaction(
        &self,
        txn_id: TxnId,
        commit_time_ms: TimestampMs,
        changes: Vec<NodeChange>,
    ) -> Result<(), IndexingError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.transactions.get(&txn_id) {
            Some(stored) if stored.record.commit_time_ms.is_none() => {}
            Some(_) => {
                return Err(IndexingError::Store(format!(
                    "transaction {} is already committed",
                    txn_id
                )))
            }
            None => {
                return Err(IndexingError::Store(format!(
                    "transaction {} was never started",
                    txn_id
                )))
            }
        }
        Self::apply(&mut state, txn_id, Some(commit_time_ms), changes, false);
        Ok(())
    }

    fn apply(
        state: &mut NodeStoreState,
        txn_id: TxnId,
        commit_time_ms: Option<TimestampMs>,
        changes: Vec<NodeChange>,
        remote: bool,
    ) {
        let deletes = changes.iter().filter(|c| c.deleted).count() as u32;
        let updates = changes.len() as u32 - deletes;
        for change in &changes {
            state.stores.insert(change.node.store.clone());
            state.nodes.insert(
                change.node.clone(),
                NodeEntry {
                    txn_id,
                    deleted: change.deleted,
                },
            );
        }
        let record = TransactionRecord::new(txn_id, commit_time_ms, change_txn_id(txn_id))
            .with_counts(updates, deletes)
            .with_remote(remote);
        state.transactions.insert(
            txn_id,
            StoredTransaction {
                record,
                changes: changes.into_iter().map(|c| c.node).collect(),
            },
        );
    }

    /// The stored record for a transaction.
    pub fn transaction(&self, txn_id: TxnId) -> Option<TransactionRecord> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.transactions.get(&txn_id).map(|t| t.record.clone())
    }

    /// Change ID of the transaction that last touched the node, and whether
    /// that left it deleted.
    pub fn node_state(&self, node: &NodeRef) -> Option<(String, bool)> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .nodes
            .get(node)
            .map(|entry| (change_txn_id(entry.txn_id), entry.deleted))
    }

    /// IDs of every committed transaction, in ID order.
    pub fn committed_ids(&self) -> Vec<TxnId> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .transactions
            .values()
            .filter(|t| t.record.is_committed())
            .map(|t| t.record.id)
            .collect()
    }
}

impl TransactionSource for MemoryNodeStore {
    fn stores(&self) -> Result<Vec<StoreRef>, IndexingError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.stores.iter().cloned().collect())
    }

    fn list_transactions(&self, query: &TransactionQuery) -> Result<Vec<TransactionRecord>, IndexingError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut txns: Vec<TransactionRecord> = state
            .transactions
            .values()
            .filter(|t| query.matches(&t.record))
            .map(|t| t.record.clone())
            .collect();
        txns.sort_by(|a, b| a.commit_order(b));
        if query.order == CommitOrder::Descending {
            txns.reverse();
        }
        txns.truncate(query.limit);
        Ok(txns)
    }

    fn transaction_by_id(&self, txn_id: TxnId) -> Result<Option<TransactionRecord>, IndexingError> {
        Ok(self.transaction(txn_id))
    }

    fn transactions_by_ids(&self, txn_ids: &[TxnId]) -> Result<Vec<TransactionRecord>, IndexingError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut txns: Vec<TransactionRecord> = txn_ids
            .iter()
            .filter_map(|id| state.transactions.get(id))
            .map(|t| t.record.clone())
            .collect();
        txns.sort_by(|a, b| a.commit_order(b));
        Ok(txns)
    }

    fn changed_nodes(&self, txn_id: TxnId) -> Result<Vec<NodeChange>, IndexingError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let Some(stored) = state.transactions.get(&txn_id) else {
            return Ok(Vec::new());
        };
        // Report each node's current status, not the status the
        // transaction left it in
        Ok(stored
            .changes
            .iter()
            .filter_map(|node| {
                state.nodes.get(node).map(|entry| NodeChange {
                    node: node.clone(),
                    deleted: entry.deleted,
                })
            })
            .collect())
    }

    fn transaction_count(&self) -> Result<u64, IndexingError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .transactions
            .values()
            .filter(|t| t.record.is_committed())
            .count() as u64)
    }
}

impl WriteLock for MemoryNodeStore {
    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Update { node: NodeRef, change_txn_id: String },
    Delete { node: NodeRef },
}

impl PendingWrite {
    fn node(&self) -> &NodeRef {
        match self {
            PendingWrite::Update { node, .. } | PendingWrite::Delete { node } => node,
        }
    }
}

/// An index keeping one document per node, tagged with the change ID of
/// the transaction that last wrote the node.
pub struct MemoryIndex {
    store: Arc<MemoryNodeStore>,
    documents: RwLock<HashMap<NodeRef, String>>,
    commits: Mutex<Vec<Vec<NodeRef>>>,
    update_hook: RwLock<Option<UpdateHook>>,
    failing_nodes: Mutex<HashSet<NodeRef>>,
    in_transaction_enabled: AtomicBool,
}

impl MemoryIndex {
    pub fn new(store: Arc<MemoryNodeStore>) -> Self {
        Self {
            store,
            documents: RwLock::new(HashMap::new()),
            commits: Mutex::new(Vec::new()),
            update_hook: RwLock::new(None),
            failing_nodes: Mutex::new(HashSet::new()),
            in_transaction_enabled: AtomicBool::new(true),
        }
    }

    /// Install a hook run before every node update, e.g. to slow a worker
    /// down or to fail it.
    pub fn set_update_hook(&self, hook: Option<UpdateHook>) {
        *self.update_hook.write().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    /// Make every write of this node fail with an index error.
    pub fn fail_on(&self, node: NodeRef) {
        self.failing_nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node);
    }

    pub fn is_indexed(&self, node: &NodeRef) -> bool {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(node)
    }

    pub fn document_count(&self) -> usize {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Nodes written by each committed session, in commit order.
    pub fn commit_log(&self) -> Vec<Vec<NodeRef>> {
        self.commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop every document, as after losing the index.
    pub fn clear(&self) {
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn in_transaction_indexing_enabled(&self) -> bool {
        self.in_transaction_enabled.load(Ordering::SeqCst)
    }

    /// Index a transaction the way the store does when it indexes inside
    /// the writing transaction. Does nothing while that is disabled.
    pub fn index_transaction_now(&self, txn_id: TxnId) -> Result<bool, IndexingError> {
        if !self.in_transaction_indexing_enabled() {
            return Ok(false);
        }
        let mut session = self.begin()?;
        for change in self.store.changed_nodes(txn_id)? {
            if change.deleted {
                session.delete_node(&ChildAssocRef::for_deleted(change.node))?;
            } else {
                session.update_node(&change.node)?;
            }
        }
        session.commit()?;
        Ok(true)
    }
}

impl IndexProbe for MemoryIndex {
    fn contains_transaction(&self, store: &StoreRef, change_txn_id: &str) -> Result<bool, IndexingError> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        Ok(documents
            .iter()
            .any(|(node, tag)| node.store == *store && tag == change_txn_id))
    }

    fn contains_node(&self, store: &StoreRef, node: &NodeRef) -> Result<bool, IndexingError> {
        if node.store != *store {
            return Ok(false);
        }
        Ok(self.is_indexed(node))
    }
}

impl Indexer for MemoryIndex {
    fn begin(&self) -> Result<Box<dyn IndexSession + '_>, IndexingError> {
        Ok(Box::new(MemoryIndexSession {
            index: self,
            pending: Vec::new(),
        }))
    }
}

impl NodeIndexer for MemoryIndex {
    fn set_enabled(&self, enabled: bool) {
        self.in_transaction_enabled.store(enabled, Ordering::SeqCst);
    }
}

struct MemoryIndexSession<'a> {
    index: &'a MemoryIndex,
    pending: Vec<PendingWrite>,
}

impl MemoryIndexSession<'_> {
    fn check_node(&self, node: &NodeRef) -> Result<(), IndexingError> {
        let hook = self
            .index
            .update_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(node)?;
        }
        let failing = self
            .index
            .failing_nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if failing.contains(node) {
            return Err(IndexingError::Index(format!("cannot index node {}", node)));
        }
        Ok(())
    }
}

impl IndexSession for MemoryIndexSession<'_> {
    fn update_node(&mut self, node: &NodeRef) -> Result<(), IndexingError> {
        self.check_node(node)?;
        match self.index.store.node_state(node) {
            Some((change_txn_id, false)) => self.pending.push(PendingWrite::Update {
                node: node.clone(),
                change_txn_id,
            }),
            // Gone since the change list was read
            Some((_, true)) | None => self.pending.push(PendingWrite::Delete { node: node.clone() }),
        }
        Ok(())
    }

    fn delete_node(&mut self, assoc: &ChildAssocRef) -> Result<(), IndexingError> {
        self.check_node(&assoc.child)?;
        self.pending.push(PendingWrite::Delete {
            node: assoc.child.clone(),
        });
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), IndexingError> {
        let mut documents = self
            .index
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut commits = self
            .index
            .commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut touched = Vec::with_capacity(self.pending.len());
        for write in &self.pending {
            touched.push(write.node().clone());
            match write {
                PendingWrite::Update { node, change_txn_id } => {
                    documents.insert(node.clone(), change_txn_id.clone());
                }
                PendingWrite::Delete { node } => {
                    documents.remove(node);
                }
            }
        }
        commits.push(touched);
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeRef {
        NodeRef::new(StoreRef::workspace_spaces_store(), id)
    }

    #[test]
    fn test_list_transactions_orders_by_commit_time() {
        let store = MemoryNodeStore::new();
        let late = store.commit_transaction(3_000, vec![NodeChange::updated(node("a"))]);
        let early = store.commit_transaction(1_000, vec![NodeChange::updated(node("b"))]);
        let pending = store.reserve_transaction();

        let asc = store
            .list_transactions(&TransactionQuery::ascending(None, None))
            .unwrap();
        assert_eq!(asc.iter().map(|t| t.id).collect::<Vec<_>>(), vec![early, late]);

        let desc = store
            .list_transactions(&TransactionQuery::descending(None, None).with_limit(1))
            .unwrap();
        assert_eq!(desc[0].id, late);

        assert!(!store.committed_ids().contains(&pending));
        assert_eq!(store.transaction_count().unwrap(), 2);
    }

    #[test]
    fn test_changed_nodes_report_current_status() {
        let store = MemoryNodeStore::new();
        let created = store.commit_transaction(1_000, vec![NodeChange::updated(node("a"))]);
        store.commit_transaction(2_000, vec![NodeChange::deleted(node("a"))]);

        let changes = store.changed_nodes(created).unwrap();
        assert_eq!(changes, vec![NodeChange::deleted(node("a"))]);
        assert_eq!(store.update_count(created).unwrap(), 1);
        assert_eq!(store.delete_count(created).unwrap(), 0);
    }

    #[test]
    fn test_session_writes_are_invisible_until_commit() {
        let store = Arc::new(MemoryNodeStore::new());
        store.commit_transaction(1_000, vec![NodeChange::updated(node("a"))]);
        let index = MemoryIndex::new(store.clone());

        let mut session = index.begin().unwrap();
        session.update_node(&node("a")).unwrap();
        assert!(!index.is_indexed(&node("a")));
        session.commit().unwrap();
        assert!(index.is_indexed(&node("a")));
        assert_eq!(index.commit_log(), vec![vec![node("a")]]);

        let mut session = index.begin().unwrap();
        session
            .delete_node(&ChildAssocRef::for_deleted(node("a")))
            .unwrap();
        session.rollback();
        assert!(index.is_indexed(&node("a")));
    }

    #[test]
    fn test_in_transaction_indexing_switch() {
        let store = Arc::new(MemoryNodeStore::new());
        let id = store.commit_transaction(1_000, vec![NodeChange::updated(node("a"))]);
        let index = MemoryIndex::new(store.clone());

        index.set_enabled(false);
        assert!(!index.index_transaction_now(id).unwrap());
        assert_eq!(index.document_count(), 0);

        index.set_enabled(true);
        assert!(index.index_transaction_now(id).unwrap());
        assert!(index
            .contains_transaction(&StoreRef::workspace_spaces_store(), &change_txn_id(id))
            .unwrap());
    }

    #[test]
    fn test_failing_node() {
        let store = Arc::new(MemoryNodeStore::new());
        store.commit_transaction(1_000, vec![NodeChange::updated(node("bad"))]);
        let index = MemoryIndex::new(store);
        index.fail_on(node("bad"));

        let mut session = index.begin().unwrap();
        assert!(matches!(
            session.update_node(&node("bad")),
            Err(IndexingError::Index(_))
        ));
    }

    #[test]
    fn test_read_only_switch() {
        let store = MemoryNodeStore::new();
        assert!(!store.is_read_only());
        store.set_read_only(true);
        assert!(store.is_read_only());
    }
}
