//! Startup index recovery.
//!
//! Samples the oldest and newest transactions to judge whether the index
//! is behind the store, then, depending on the recovery mode, warns,
//! tops the index up through the tracker or rebuilds it from the start of
//! history. A full rebuild saves a checkpoint after every iteration so an
//! interrupted run resumes where it stopped.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};
use tracker_types::{Presence, RecoveryMode, TimestampMs, TransactionRecord};

use crate::checkpoint::{load_recovery_checkpoint, save_recovery_checkpoint, CheckpointStore, RecoveryCheckpoint};
use crate::clock::Clock;
use crate::collaborators::{TrackerListener, TransactionQuery, WriteLock};
use crate::config::{RecoveryConfig, TrackerConfig};
use crate::engine::{ReindexContext, ReindexEngine, SweepReport, TriggerOutcome};
use crate::error::IndexingError;
use crate::presence::PresenceOracle;
use crate::tracker::{SweepObserver, Watermark};

/// Transactions added to a sample each time it is inconclusive.
pub const SAMPLE_STEP: usize = 10;

/// Largest sample before an inconclusive verdict counts as missing.
pub const MAX_SAMPLE_SIZE: usize = 1000;

/// Minimum time between tracking progress messages during a top-up.
pub const PROGRESS_LOG_INTERVAL_MS: i64 = 10_000;

/// What recovery ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Mode `NONE`
    Skipped,
    /// Samples taken, nothing repaired
    Validated { up_to_date: bool },
    /// The tracker topped up the end of history
    PartialRecovery(SweepReport),
    /// Every transaction was reindexed
    FullRecovery(SweepReport),
    /// Shutdown stopped the repair part way
    Terminated(SweepReport),
}

/// Outcome of a recovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub mode: RecoveryMode,
    /// Verdict over the oldest transactions, when sampled
    pub start: Option<Presence>,
    /// Verdict over the newest transactions, when sampled
    pub end: Option<Presence>,
    pub action: RecoveryAction,
    /// Whether a full rebuild continued from a saved checkpoint
    pub resumed: bool,
}

/// Holds the store read-only and restores the previous state on drop.
pub struct ServerLockGuard {
    lock: Arc<dyn WriteLock>,
    was_read_only: bool,
}

impl ServerLockGuard {
    pub fn acquire(lock: Arc<dyn WriteLock>) -> Self {
        let was_read_only = lock.is_read_only();
        lock.set_read_only(true);
        info!(was_read_only, "Server locked for index recovery");
        Self { lock, was_read_only }
    }
}

impl Drop for ServerLockGuard {
    fn drop(&mut self) {
        self.lock.set_read_only(self.was_read_only);
        info!(read_only = self.was_read_only, "Server lock released");
    }
}

/// Logs every 10% of a full rebuild and saves a checkpoint after each
/// drained iteration.
struct RecoveryProgress {
    total: u64,
    processed: u64,
    checkpoint: RecoveryCheckpoint,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl RecoveryProgress {
    fn new(total: u64, checkpoint: RecoveryCheckpoint, store: Option<Arc<dyn CheckpointStore>>) -> Self {
        Self {
            total,
            processed: checkpoint.processed_count,
            checkpoint,
            store,
        }
    }

    fn save(&self) -> Result<(), IndexingError> {
        match &self.store {
            Some(store) => save_recovery_checkpoint(store.as_ref(), &self.checkpoint),
            None => Ok(()),
        }
    }

    /// Count one transaction. Returns the percentage reached when this
    /// transaction crosses a 10% milestone.
    fn advance(&mut self) -> Option<u64> {
        if self.total == 0 {
            return None;
        }
        let before = self.processed * 10 / self.total;
        self.processed += 1;
        let after = self.processed * 10 / self.total;
        (after > before).then_some(after * 10)
    }
}

impl SweepObserver for RecoveryProgress {
    fn transaction_processed(&mut self, _txn: &TransactionRecord) {
        if let Some(percent) = self.advance() {
            info!(percent, processed = self.processed, "Index recovery progress");
        }
    }

    fn iteration_complete(&mut self, watermark: &Watermark, examined: usize) -> Result<(), IndexingError> {
        self.checkpoint.update(
            watermark.from_time_inclusive,
            watermark.previous_txn_ids.clone(),
            examined as u64,
        );
        self.save()?;
        debug!(
            from_time_ms = ?watermark.from_time_inclusive,
            processed = self.checkpoint.processed_count,
            "Index recovery checkpoint saved"
        );
        Ok(())
    }
}

/// Logs tracking progress at most once per interval.
pub struct ThrottledProgressListener {
    clock: Arc<dyn Clock>,
    interval_ms: i64,
    last_logged: Mutex<Option<TimestampMs>>,
}

impl ThrottledProgressListener {
    pub fn new(clock: Arc<dyn Clock>, interval_ms: i64) -> Self {
        Self {
            clock,
            interval_ms,
            last_logged: Mutex::new(None),
        }
    }
}

impl TrackerListener for ThrottledProgressListener {
    fn indexed_transactions(&self, _from_time_inclusive: TimestampMs, to_time_exclusive: TimestampMs) {
        let now = self.clock.now_ms();
        let mut last_logged = self.last_logged.lock().unwrap_or_else(PoisonError::into_inner);
        if last_logged.is_some_and(|last| now - last < self.interval_ms) {
            return;
        }
        *last_logged = Some(now);
        let up_to = chrono::DateTime::from_timestamp_millis(to_time_exclusive)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| to_time_exclusive.to_string());
        info!(up_to = %up_to, "Index tracking progress");
    }
}

/// Runs startup recovery in the configured mode.
pub struct FullRecoveryDriver {
    context: ReindexContext,
    config: RecoveryConfig,
    tracker: Option<Arc<ReindexEngine>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl FullRecoveryDriver {
    pub fn new(context: ReindexContext, config: RecoveryConfig) -> Self {
        Self {
            context,
            config,
            tracker: None,
            checkpoints: None,
        }
    }

    /// Tracker used to top up the index in `AUTO` mode. Without one a
    /// tracker with default settings is built on demand.
    pub fn with_tracker(mut self, tracker: Arc<ReindexEngine>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    fn oracle(&self) -> PresenceOracle {
        self.context.oracle()
    }

    /// Verdict over the oldest transactions, widening the sample while it
    /// is inconclusive.
    pub fn sample_start(&self) -> Result<Presence, IndexingError> {
        let oracle = self.oracle();
        self.widening_sample(TransactionQuery::ascending(None, None), |txns| oracle.start_sample(txns))
    }

    /// Verdict over the newest transactions, widening the sample while it
    /// is inconclusive.
    pub fn sample_end(&self) -> Result<Presence, IndexingError> {
        let oracle = self.oracle();
        self.widening_sample(TransactionQuery::descending(None, None), |txns| oracle.end_sample(txns))
    }

    fn widening_sample(
        &self,
        query: TransactionQuery,
        verdict: impl Fn(&[TransactionRecord]) -> Result<Presence, IndexingError>,
    ) -> Result<Presence, IndexingError> {
        let mut size = SAMPLE_STEP;
        loop {
            let txns = self
                .context
                .source
                .list_transactions(&query.clone().with_limit(size))?;
            let presence = verdict(&txns)?;
            if presence != Presence::Indeterminate {
                return Ok(presence);
            }
            if txns.len() < size {
                // History exhausted, a bigger sample would see the same
                debug!(size, found = txns.len(), "Sample inconclusive");
                return Ok(Presence::Indeterminate);
            }
            size += SAMPLE_STEP;
            if size > MAX_SAMPLE_SIZE {
                return Ok(Presence::No);
            }
        }
    }

    /// Run recovery in the configured mode.
    pub async fn run(&self) -> Result<RecoveryReport, IndexingError> {
        let mode = self.config.mode;
        debug!(mode = %mode, "Performing index recovery");
        let mut report = RecoveryReport {
            mode,
            start: None,
            end: None,
            action: RecoveryAction::Skipped,
            resumed: false,
        };
        if mode == RecoveryMode::None {
            return Ok(report);
        }

        let _lock = match (&self.context.write_lock, self.config.lock_server) {
            (Some(lock), true) => Some(ServerLockGuard::acquire(lock.clone())),
            (None, true) => {
                warn!("Server lock requested but no write lock is available");
                None
            }
            _ => None,
        };

        if mode == RecoveryMode::Full {
            let (action, resumed) = self.perform_full_recovery().await?;
            report.action = action;
            report.resumed = resumed;
            return Ok(report);
        }

        let start = self.sample_start()?;
        let end = self.sample_end()?;
        report.start = Some(start);
        report.end = Some(end);
        let up_to_date = !start.is_missing() && !end.is_missing();

        match mode {
            RecoveryMode::Auto if start.is_missing() => {
                info!("Oldest transactions are missing from the index, rebuilding");
                let (action, resumed) = self.perform_full_recovery().await?;
                report.action = action;
                report.resumed = resumed;
            }
            RecoveryMode::Auto if end.is_missing() => {
                report.action = self.perform_partial_recovery().await?;
            }
            _ => {
                if !up_to_date {
                    warn!(start = %start, end = %end, "Index is out of date");
                }
                report.action = RecoveryAction::Validated { up_to_date };
            }
        }
        Ok(report)
    }

    /// Reindex every transaction, resuming from an incomplete checkpoint.
    pub async fn perform_full_recovery(&self) -> Result<(RecoveryAction, bool), IndexingError> {
        let total = self.context.source.transaction_count()?;
        let engine = ReindexEngine::full_recovery(self.context.clone(), &self.config);

        let mut checkpoint = RecoveryCheckpoint::new();
        let mut resumed = false;
        if let Some(store) = &self.checkpoints {
            if let Some(saved) = load_recovery_checkpoint(store.as_ref())? {
                if !saved.completed {
                    info!(
                        from_time_ms = ?saved.from_time_inclusive,
                        processed = saved.processed_count,
                        "Resuming index recovery"
                    );
                    engine
                        .resume_from(
                            Watermark::starting_at(saved.from_time_inclusive)
                                .with_previous_txn_ids(saved.previous_txn_ids.clone()),
                        )
                        .await;
                    checkpoint = saved;
                    resumed = true;
                }
            }
        }

        info!(txn_count = total, "Index recovery starting");
        let mut progress = RecoveryProgress::new(total, checkpoint, self.checkpoints.clone());
        match engine.trigger_observed(&mut progress).await? {
            TriggerOutcome::CaughtUp(sweep) => {
                progress.checkpoint.mark_completed();
                progress.save()?;
                info!(
                    processed = progress.checkpoint.processed_count,
                    reindexed = sweep.reindexed,
                    "Index recovery complete"
                );
                Ok((RecoveryAction::FullRecovery(sweep), resumed))
            }
            TriggerOutcome::Terminated(sweep) => {
                warn!(processed = progress.processed, "Index recovery terminated");
                Ok((RecoveryAction::Terminated(sweep), resumed))
            }
            TriggerOutcome::Busy => Err(IndexingError::Config(
                "index recovery is already running".to_string(),
            )),
        }
    }

    /// Let the tracker top up the index, logging its progress.
    pub async fn perform_partial_recovery(&self) -> Result<RecoveryAction, IndexingError> {
        let tracker = match &self.tracker {
            Some(tracker) => tracker.clone(),
            None => Arc::new(ReindexEngine::tracking(
                self.context.clone(),
                &TrackerConfig::default()
                    .with_worker_threads(self.config.worker_threads)
                    .with_inactivity_timeout(self.config.inactivity_timeout),
            )),
        };

        let listener = Arc::new(ThrottledProgressListener::new(
            self.context.clock.clone(),
            PROGRESS_LOG_INTERVAL_MS,
        ));
        tracker.set_listener(Some(listener));
        info!("Index tracking starting");
        let outcome = tracker.trigger().await;
        tracker.set_listener(None);

        match outcome? {
            TriggerOutcome::CaughtUp(sweep) => {
                info!(reindexed = sweep.reindexed, "Index tracking complete");
                Ok(RecoveryAction::PartialRecovery(sweep))
            }
            TriggerOutcome::Terminated(sweep) => {
                warn!("Index tracking terminated");
                Ok(RecoveryAction::Terminated(sweep))
            }
            TriggerOutcome::Busy => {
                info!("Index tracker already running");
                Ok(RecoveryAction::PartialRecovery(SweepReport::default()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::clock::ManualClock;
    use crate::memory::{MemoryIndex, MemoryNodeStore};
    use tracker_types::{NodeChange, NodeRef, StoreRef};

    fn node(id: &str) -> NodeRef {
        NodeRef::new(StoreRef::workspace_spaces_store(), id)
    }

    fn setup() -> (Arc<MemoryNodeStore>, Arc<MemoryIndex>, ReindexContext) {
        let store = Arc::new(MemoryNodeStore::new());
        let index = Arc::new(MemoryIndex::new(store.clone()));
        let context = ReindexContext::new(store.clone(), index.clone(), index.clone())
            .with_clock(Arc::new(ManualClock::new(100_000_000)))
            .with_write_lock(store.clone());
        (store, index, context)
    }

    fn commit_many(store: &MemoryNodeStore, count: i64) {
        for i in 0..count {
            store.commit_transaction(1_000 + i, vec![NodeChange::updated(node(&format!("n{}", i)))]);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_none_does_nothing() {
        let (store, index, context) = setup();
        commit_many(&store, 3);
        let driver = FullRecoveryDriver::new(context, RecoveryConfig::default().with_mode(RecoveryMode::None));

        let report = driver.run().await.unwrap();
        assert_eq!(report.action, RecoveryAction::Skipped);
        assert!(report.start.is_none());
        assert_eq!(index.document_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_validate_reports_without_repairing() {
        let (store, index, context) = setup();
        commit_many(&store, 3);
        let driver = FullRecoveryDriver::new(context, RecoveryConfig::default());

        let report = driver.run().await.unwrap();
        assert_eq!(report.start, Some(Presence::No));
        assert_eq!(report.action, RecoveryAction::Validated { up_to_date: false });
        assert_eq!(index.document_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_mode_rebuilds_and_marks_checkpoint_complete() {
        let (store, index, context) = setup();
        commit_many(&store, 30);
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let driver = FullRecoveryDriver::new(
            context,
            RecoveryConfig::default()
                .with_mode(RecoveryMode::Full)
                .with_max_transactions_per_iteration(10),
        )
        .with_checkpoint_store(checkpoints.clone());

        let report = driver.run().await.unwrap();
        assert!(matches!(report.action, RecoveryAction::FullRecovery(ref sweep) if sweep.examined == 30));
        assert!(!report.resumed);
        assert_eq!(index.document_count(), 30);

        let saved = load_recovery_checkpoint(checkpoints.as_ref()).unwrap().unwrap();
        assert!(saved.completed);
        assert_eq!(saved.processed_count, 30);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_mode_resumes_incomplete_checkpoint() {
        let (store, index, context) = setup();
        commit_many(&store, 20);
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let mut saved = RecoveryCheckpoint::new();
        // First ten done; the last of them sits at commit time 1_009
        saved.update(Some(1_009), vec![10], 10);
        save_recovery_checkpoint(checkpoints.as_ref(), &saved).unwrap();

        let driver = FullRecoveryDriver::new(context, RecoveryConfig::default().with_mode(RecoveryMode::Full))
            .with_checkpoint_store(checkpoints.clone());
        let report = driver.run().await.unwrap();

        assert!(report.resumed);
        assert_eq!(index.document_count(), 10);
        assert!(!index.is_indexed(&node("n0")));
        assert!(index.is_indexed(&node("n19")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_server_lock_restored_after_failure() {
        let (store, index, context) = setup();
        commit_many(&store, 3);
        index.fail_on(node("n1"));
        let driver = FullRecoveryDriver::new(
            context,
            RecoveryConfig::default()
                .with_mode(RecoveryMode::Full)
                .with_lock_server(true),
        );

        let err = driver.run().await.unwrap_err();
        assert!(matches!(err, IndexingError::Aborted { txn_id: 2, .. }));
        assert!(!store.is_read_only());
    }

    #[test]
    fn test_progress_reported_at_each_tenth() {
        let mut progress = RecoveryProgress::new(250, RecoveryCheckpoint::new(), None);
        let milestones: Vec<u64> = (0..250).filter_map(|_| progress.advance()).collect();
        assert_eq!(milestones, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);

        // Resumed runs count from the checkpoint
        let mut saved = RecoveryCheckpoint::new();
        saved.update(Some(1_000), vec![1], 125);
        let mut resumed = RecoveryProgress::new(250, saved, None);
        let milestones: Vec<u64> = (0..125).filter_map(|_| resumed.advance()).collect();
        assert_eq!(milestones, vec![60, 70, 80, 90, 100]);

        let mut empty = RecoveryProgress::new(0, RecoveryCheckpoint::new(), None);
        assert_eq!(empty.advance(), None);
    }

    #[test]
    fn test_throttled_listener_logs_at_most_once_per_interval() {
        let clock = Arc::new(ManualClock::new(0));
        let listener = ThrottledProgressListener::new(clock.clone(), PROGRESS_LOG_INTERVAL_MS);
        listener.indexed_transactions(0, 1);
        let first = *listener.last_logged.lock().unwrap();
        clock.advance(5_000);
        listener.indexed_transactions(0, 2);
        assert_eq!(*listener.last_logged.lock().unwrap(), first);
        clock.advance(5_000);
        listener.indexed_transactions(0, 3);
        assert_eq!(*listener.last_logged.lock().unwrap(), Some(10_000));
    }
}
