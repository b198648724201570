//! End-to-end test infrastructure for the index transaction tracker.
//!
//! Provides a shared TestHarness wiring an in-memory node store and index
//! to the tracker, with a manual clock and RocksDB-backed checkpoints.

use std::sync::{Arc, Once};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tracker_indexing::{
    FullRecoveryDriver, ManualClock, MemoryIndex, MemoryNodeStore, PresenceOracle, RecoveryConfig,
    ReindexContext, ReindexEngine, RetryingTransactionRunner, TrackerConfig,
};
use tracker_storage::Storage;
use tracker_types::{NodeChange, NodeRef, Presence, StoreRef, TimestampMs, TxnId};

/// Fixed wall clock the harness starts at (2024-01-29).
pub const NOW: TimestampMs = 1_706_540_400_000;

static LOGGING: Once = Once::new();

/// Install a test subscriber once per process. `RUST_LOG` overrides the
/// default `warn` filter.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A node in the workspace store.
pub fn node(id: &str) -> NodeRef {
    NodeRef::new(StoreRef::workspace_spaces_store(), id)
}

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    /// Checkpoint storage
    pub storage: Arc<Storage>,
    pub store: Arc<MemoryNodeStore>,
    pub index: Arc<MemoryIndex>,
    pub clock: Arc<ManualClock>,
    pub shutdown: CancellationToken,
}

impl TestHarness {
    pub fn new() -> Self {
        init_test_logging();
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let storage = Arc::new(Storage::open(temp_dir.path()).expect("Failed to open test storage"));
        let store = Arc::new(MemoryNodeStore::new());
        let index = Arc::new(MemoryIndex::new(store.clone()));

        Self {
            _temp_dir: temp_dir,
            storage,
            store,
            index,
            clock: Arc::new(ManualClock::new(NOW)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Collaborators wired to the harness, with a fast retry schedule.
    pub fn context(&self) -> ReindexContext {
        let runner = RetryingTransactionRunner::new()
            .with_initial_interval(Duration::from_millis(1))
            .with_max_interval(Duration::from_millis(5));
        ReindexContext::new(self.store.clone(), self.index.clone(), self.index.clone())
            .with_runner(Arc::new(runner))
            .with_clock(self.clock.clone())
            .with_shutdown(self.shutdown.clone())
            .with_node_indexer(self.index.clone())
            .with_write_lock(self.store.clone())
    }

    pub fn tracker(&self, config: &TrackerConfig) -> ReindexEngine {
        ReindexEngine::tracking(self.context(), config)
    }

    /// Recovery driver checkpointing into the harness storage.
    pub fn recovery(&self, config: RecoveryConfig) -> FullRecoveryDriver {
        FullRecoveryDriver::new(self.context(), config).with_checkpoint_store(self.storage.clone())
    }

    pub fn oracle(&self) -> PresenceOracle {
        self.context().oracle()
    }

    pub fn presence(&self, txn_id: TxnId) -> Presence {
        self.oracle()
            .presence_by_id(txn_id)
            .expect("Failed to probe presence")
    }

    /// Commit a transaction updating the given nodes, `age_ms` before now.
    pub fn commit(&self, age_ms: i64, node_ids: &[&str]) -> TxnId {
        let changes = node_ids.iter().map(|id| NodeChange::updated(node(id))).collect();
        self.store.commit_transaction(self.clock_now() - age_ms, changes)
    }

    /// Commit `count` transactions, each touching its own node `{prefix}-{i}`,
    /// spaced `spacing_ms` apart starting at `first_time`.
    pub fn commit_distinct(&self, prefix: &str, count: usize, first_time: TimestampMs, spacing_ms: i64) -> Vec<TxnId> {
        (0..count)
            .map(|i| {
                let change = NodeChange::updated(node(&format!("{}-{}", prefix, i)));
                self.store
                    .commit_transaction(first_time + i as i64 * spacing_ms, vec![change])
            })
            .collect()
    }

    /// Index a transaction directly, as in-transaction indexing would.
    pub fn index_now(&self, txn_id: TxnId) {
        self.index
            .index_transaction_now(txn_id)
            .expect("Failed to index transaction");
    }

    pub fn clock_now(&self) -> TimestampMs {
        use tracker_indexing::Clock;
        self.clock.now_ms()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
