//! The reindex engine.
//!
//! One engine type serves both live tracking and full recovery; a
//! [`ReindexPolicy`] selects the behaviour. The engine owns the sweep state
//! behind a single async lock. A trigger that finds the lock taken returns
//! [`TriggerOutcome::Busy`] immediately instead of queueing behind the
//! running sweep.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracker_types::{TimestampMs, TxnId};

use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    IndexProbe, Indexer, NodeIndexer, ReindexStats, TrackerListener, TransactionSource, WriteLock,
};
use crate::config::{RecoveryConfig, TrackerConfig};
use crate::error::IndexingError;
use crate::presence::PresenceOracle;
use crate::reindex::Reindexer;
use crate::runner::{RetryingTransactionRunner, TransactionRunner};
use crate::scheduler::ReindexScheduler;
use crate::tracker::{
    NoopObserver, SweepLimits, SweepObserver, SweepState, TickOutcome, TransactionTracker, Watermark,
};

/// Selects between live tracking and a full sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReindexPolicy {
    /// Reindex every transaction, skip presence checks and void handling
    pub full_sweep: bool,
    /// Leave the most recent transactions for a later tick
    pub use_lag_window: bool,
    /// Reindex one transaction at a time and abort on the first failure
    pub stop_on_error: bool,
}

impl ReindexPolicy {
    pub fn tracking() -> Self {
        Self {
            full_sweep: false,
            use_lag_window: true,
            stop_on_error: false,
        }
    }

    pub fn full_recovery(stop_on_error: bool) -> Self {
        Self {
            full_sweep: true,
            use_lag_window: false,
            stop_on_error,
        }
    }
}

/// Collaborators shared by every engine.
#[derive(Clone)]
pub struct ReindexContext {
    pub source: Arc<dyn TransactionSource>,
    pub probe: Arc<dyn IndexProbe>,
    pub indexer: Arc<dyn Indexer>,
    pub runner: Arc<dyn TransactionRunner>,
    pub clock: Arc<dyn Clock>,
    /// Cancelled when the process shuts down
    pub shutdown: CancellationToken,
    pub node_indexer: Option<Arc<dyn NodeIndexer>>,
    pub write_lock: Option<Arc<dyn WriteLock>>,
}

impl ReindexContext {
    pub fn new(
        source: Arc<dyn TransactionSource>,
        probe: Arc<dyn IndexProbe>,
        indexer: Arc<dyn Indexer>,
    ) -> Self {
        Self {
            source,
            probe,
            indexer,
            runner: Arc::new(RetryingTransactionRunner::new()),
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
            node_indexer: None,
            write_lock: None,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn TransactionRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_node_indexer(mut self, node_indexer: Arc<dyn NodeIndexer>) -> Self {
        self.node_indexer = Some(node_indexer);
        self
    }

    pub fn with_write_lock(mut self, write_lock: Arc<dyn WriteLock>) -> Self {
        self.write_lock = Some(write_lock);
        self
    }

    pub fn oracle(&self) -> PresenceOracle {
        PresenceOracle::new(self.source.clone(), self.probe.clone())
    }

    pub fn reindexer(&self) -> Reindexer {
        Reindexer::new(
            self.source.clone(),
            self.indexer.clone(),
            self.runner.clone(),
            self.shutdown.clone(),
        )
    }
}

/// Lifecycle of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    NotStarted,
    Running,
    ShuttingDown,
    Stopped,
}

/// Totals over the ticks of one trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub ticks: usize,
    pub examined: usize,
    pub reindexed: usize,
    /// Watermark commit time when the sweep stopped
    pub watermark: Option<TimestampMs>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A sweep was already running; nothing was done
    Busy,
    CaughtUp(SweepReport),
    /// Stopped by shutdown
    Terminated(SweepReport),
}

/// Ticks the tracker until it has caught up.
pub struct ReindexEngine {
    context: ReindexContext,
    reindexer: Arc<Reindexer>,
    tracker: TransactionTracker,
    sweep: tokio::sync::Mutex<Option<SweepState>>,
    state: Mutex<TrackerState>,
    listener: RwLock<Option<Arc<dyn TrackerListener>>>,
    disable_in_transaction_indexing: bool,
}

impl ReindexEngine {
    /// Engine for live tracking.
    pub fn tracking(context: ReindexContext, config: &TrackerConfig) -> Self {
        Self::build(
            context,
            ReindexPolicy::tracking(),
            SweepLimits::from(config),
            config.worker_threads,
            config.inactivity_timeout,
            config.disable_in_transaction_indexing,
        )
    }

    /// Engine for a full sweep from the start of history.
    pub fn full_recovery(context: ReindexContext, config: &RecoveryConfig) -> Self {
        Self::build(
            context,
            ReindexPolicy::full_recovery(config.stop_on_error),
            SweepLimits::from(config),
            config.worker_threads,
            config.inactivity_timeout,
            false,
        )
    }

    fn build(
        context: ReindexContext,
        policy: ReindexPolicy,
        limits: SweepLimits,
        worker_threads: usize,
        inactivity_timeout: std::time::Duration,
        disable_in_transaction_indexing: bool,
    ) -> Self {
        let reindexer = Arc::new(context.reindexer());
        let scheduler = Arc::new(ReindexScheduler::new(
            reindexer.clone(),
            worker_threads,
            inactivity_timeout,
        ));
        let tracker = TransactionTracker::new(
            context.source.clone(),
            context.oracle(),
            reindexer.clone(),
            scheduler,
            context.clock.clone(),
            context.shutdown.clone(),
            policy,
            limits,
        );
        Self {
            context,
            reindexer,
            tracker,
            sweep: tokio::sync::Mutex::new(None),
            state: Mutex::new(TrackerState::NotStarted),
            listener: RwLock::new(None),
            disable_in_transaction_indexing,
        }
    }

    pub fn policy(&self) -> ReindexPolicy {
        self.tracker.policy()
    }

    pub fn context(&self) -> &ReindexContext {
        &self.context
    }

    pub fn tracker_state(&self) -> TrackerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: TrackerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        // Stopped is final
        if *state != TrackerState::Stopped {
            *state = next;
        }
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn TrackerListener>>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = listener;
    }

    fn listener(&self) -> Option<Arc<dyn TrackerListener>> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Continue a sweep from a saved position instead of the usual start.
    pub async fn resume_from(&self, watermark: Watermark) {
        *self.sweep.lock().await = Some(SweepState::new(watermark));
    }

    /// Current watermark, or `None` when not started or busy.
    pub fn watermark(&self) -> Option<Watermark> {
        let guard = self.sweep.try_lock().ok()?;
        guard.as_ref().map(|sweep| sweep.watermark.clone())
    }

    /// Live voids, or `None` when not started or busy.
    pub fn void_count(&self) -> Option<usize> {
        let guard = self.sweep.try_lock().ok()?;
        guard.as_ref().map(|sweep| sweep.voids.len())
    }

    /// Run until caught up. Returns [`TriggerOutcome::Busy`] right away if
    /// another trigger is still running.
    pub async fn trigger(&self) -> Result<TriggerOutcome, IndexingError> {
        self.trigger_observed(&mut NoopObserver).await
    }

    pub async fn trigger_observed(&self, observer: &mut dyn SweepObserver) -> Result<TriggerOutcome, IndexingError> {
        let Ok(mut guard) = self.sweep.try_lock() else {
            debug!("Reindex already running, trigger skipped");
            return Ok(TriggerOutcome::Busy);
        };
        if self.context.shutdown.is_cancelled() {
            self.set_state(TrackerState::Stopped);
            return Ok(TriggerOutcome::Terminated(SweepReport::default()));
        }

        if guard.is_none() {
            let watermark = self.activate()?;
            *guard = Some(SweepState::new(watermark));
        }
        let Some(sweep) = guard.as_mut() else {
            return Err(IndexingError::Config("sweep state missing".to_string()));
        };

        self.set_state(TrackerState::Running);
        let result = self.run(sweep, observer).await;
        if self.context.shutdown.is_cancelled() {
            self.set_state(TrackerState::Stopped);
        }
        result
    }

    /// First activation: work out where to start.
    fn activate(&self) -> Result<Watermark, IndexingError> {
        if self.policy().full_sweep {
            return Ok(Watermark::starting_at(None));
        }
        if self.disable_in_transaction_indexing {
            if let Some(node_indexer) = &self.context.node_indexer {
                warn!("In-transaction indexing is being disabled");
                node_indexer.set_enabled(false);
            }
        }
        self.tracker.starting_watermark()
    }

    async fn run(
        &self,
        sweep: &mut SweepState,
        observer: &mut dyn SweepObserver,
    ) -> Result<TriggerOutcome, IndexingError> {
        let mut report = SweepReport::default();
        let scheduler = self.tracker.scheduler();

        loop {
            let tick = match self.tracker.tick(sweep, observer, self.listener()).await {
                Ok(tick) => tick,
                Err(e) => {
                    scheduler.drain().await;
                    return Err(e);
                }
            };
            report.ticks += 1;
            report.examined += tick.examined;
            report.reindexed += tick.reindexed;

            match tick.outcome {
                TickOutcome::CaughtUp => break,
                TickOutcome::Terminated => {
                    scheduler.drain().await;
                    report.watermark = sweep.watermark.from_time_inclusive;
                    return Ok(TriggerOutcome::Terminated(report));
                }
                TickOutcome::MoreWork => {
                    if self.policy().full_sweep {
                        scheduler.drain().await;
                        // Work terminated during the drain must not be recorded as done
                        if self.context.shutdown.is_cancelled() {
                            report.watermark = sweep.watermark.from_time_inclusive;
                            return Ok(TriggerOutcome::Terminated(report));
                        }
                        observer.iteration_complete(&sweep.watermark, tick.examined)?;
                    }
                }
            }
        }

        scheduler.drain().await;
        report.watermark = sweep.watermark.from_time_inclusive;
        Ok(TriggerOutcome::CaughtUp(report))
    }

    /// Wait for queued reindex work to commit.
    pub async fn drain(&self) {
        self.tracker.scheduler().drain().await;
    }

    /// Signal shutdown. A running sweep stops at its next check.
    pub fn shutdown(&self) {
        info!("Reindex engine shutting down");
        self.context.shutdown.cancel();
        match self.sweep.try_lock() {
            Ok(_) => self.set_state(TrackerState::Stopped),
            Err(_) => self.set_state(TrackerState::ShuttingDown),
        }
    }

    /// Reindex one transaction right now, whatever the index says.
    pub async fn reindex_transaction(&self, txn_id: TxnId) -> Result<ReindexStats, IndexingError> {
        let reindexer = self.reindexer.clone();
        tokio::task::spawn_blocking(move || reindexer.reindex_transaction(txn_id))
            .await
            .map_err(|e| IndexingError::Index(format!("reindex worker panicked: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::{MemoryIndex, MemoryNodeStore};
    use std::time::Duration;
    use tracker_types::{NodeChange, NodeRef, StoreRef};

    const NOW: TimestampMs = 50_000_000;

    fn node(id: &str) -> NodeRef {
        NodeRef::new(StoreRef::workspace_spaces_store(), id)
    }

    fn context() -> (Arc<MemoryNodeStore>, Arc<MemoryIndex>, ReindexContext) {
        let store = Arc::new(MemoryNodeStore::new());
        let index = Arc::new(MemoryIndex::new(store.clone()));
        let context = ReindexContext::new(store.clone(), index.clone(), index.clone())
            .with_clock(Arc::new(ManualClock::new(NOW)))
            .with_node_indexer(index.clone());
        (store, index, context)
    }

    fn tracker_config() -> TrackerConfig {
        TrackerConfig::default()
            .with_max_txn_duration_ms(60_000)
            .with_worker_threads(2)
            .with_inactivity_timeout(Duration::from_secs(5))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trigger_catches_up() {
        let (store, index, context) = context();
        for i in 0..5 {
            store.commit_transaction(NOW - 30_000 + i, vec![NodeChange::updated(node(&format!("n{}", i)))]);
        }
        let engine = ReindexEngine::tracking(context, &tracker_config());
        assert_eq!(engine.tracker_state(), TrackerState::NotStarted);

        let TriggerOutcome::CaughtUp(report) = engine.trigger().await.unwrap() else {
            panic!("expected caught up");
        };
        assert_eq!(report.reindexed, 5);
        assert_eq!(index.document_count(), 5);
        assert_eq!(engine.tracker_state(), TrackerState::Running);
        assert_eq!(engine.void_count(), Some(0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_first_activation_disables_in_transaction_indexing() {
        let (_store, index, context) = context();
        let engine = ReindexEngine::tracking(
            context,
            &tracker_config().with_disable_in_transaction_indexing(true),
        );
        assert!(index.in_transaction_indexing_enabled());
        engine.trigger().await.unwrap();
        assert!(!index.in_transaction_indexing_enabled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trigger_while_busy_is_skipped() {
        let (store, index, context) = context();
        store.commit_transaction(NOW - 30_000, vec![NodeChange::updated(node("slow"))]);
        index.set_update_hook(Some(Arc::new(|_: &NodeRef| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })));
        let engine = Arc::new(ReindexEngine::tracking(context, &tracker_config()));

        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.trigger().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.trigger().await.unwrap(), TriggerOutcome::Busy);
        assert!(matches!(running.await.unwrap().unwrap(), TriggerOutcome::CaughtUp(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_stops_engine() {
        let (store, _index, context) = context();
        store.commit_transaction(NOW - 30_000, vec![NodeChange::updated(node("a"))]);
        let engine = ReindexEngine::tracking(context, &tracker_config());

        engine.shutdown();
        assert_eq!(engine.tracker_state(), TrackerState::Stopped);
        assert!(matches!(engine.trigger().await.unwrap(), TriggerOutcome::Terminated(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reindex_transaction_by_id() {
        let (store, index, context) = context();
        let id = store.commit_transaction(NOW - 30_000, vec![NodeChange::updated(node("a"))]);
        let engine = ReindexEngine::tracking(context, &tracker_config());

        let stats = engine.reindex_transaction(id).await.unwrap();
        assert_eq!(stats.updated, 1);
        assert!(index.is_indexed(&node("a")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_recovery_from_start_of_history() {
        let (store, index, context) = context();
        for i in 0..25 {
            store.commit_transaction(1_000 + i, vec![NodeChange::updated(node(&format!("n{}", i)))]);
        }
        let config = RecoveryConfig::default()
            .with_stop_on_error(false)
            .with_max_transactions_per_iteration(10)
            .with_max_transactions_per_commit(4);
        let engine = ReindexEngine::full_recovery(context, &config);

        let TriggerOutcome::CaughtUp(report) = engine.trigger().await.unwrap() else {
            panic!("expected caught up");
        };
        assert_eq!(report.examined, 25);
        assert_eq!(report.ticks, 4);
        assert_eq!(index.document_count(), 25);
        assert_eq!(report.watermark, Some(1_024));
    }
}
