//! The transaction tracker tick.
//!
//! Each tick pulls the next window of transactions in commit-time order,
//! skips those already in the index and hands the rest to the reindex
//! scheduler in groups. The watermark records where the next tick starts.
//! Transactions sharing the watermark's commit time are remembered by ID
//! so they are not pulled twice.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracker_types::{Presence, StoreRef, TimestampMs, TransactionRecord, TxnId};

use crate::clock::Clock;
use crate::collaborators::{TrackerListener, TransactionQuery, TransactionSource};
use crate::config::{RecoveryConfig, TrackerConfig};
use crate::engine::ReindexPolicy;
use crate::error::IndexingError;
use crate::presence::PresenceOracle;
use crate::reindex::Reindexer;
use crate::scheduler::ReindexScheduler;
use crate::voids::VoidTracker;

const ONE_MINUTE_MS: i64 = 60_000;
const ONE_HOUR_MS: i64 = 3_600_000;

/// Where the next tick starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermark {
    /// Commit time to scan from; `None` is the start of history
    pub from_time_inclusive: Option<TimestampMs>,
    /// Already processed transactions to exclude from the next scan
    pub previous_txn_ids: Vec<TxnId>,
    /// Highest transaction ID walked for void detection
    pub last_max_txn_id: Option<TxnId>,
    /// Reindex everything until caught up
    pub force_reindex: bool,
}

impl Watermark {
    pub fn starting_at(from_time_inclusive: Option<TimestampMs>) -> Self {
        Self {
            from_time_inclusive,
            ..Default::default()
        }
    }

    pub fn with_previous_txn_ids(mut self, txn_ids: Vec<TxnId>) -> Self {
        self.previous_txn_ids = txn_ids;
        self
    }

    /// Move back to an earlier commit time. Everything from there on is
    /// scanned again.
    pub fn rewind(&mut self, to_time_inclusive: TimestampMs) {
        self.from_time_inclusive = Some(to_time_inclusive);
        self.previous_txn_ids.clear();
    }
}

/// Mutable state of a sweep. Only the tick writes it.
#[derive(Debug, Default)]
pub struct SweepState {
    pub watermark: Watermark,
    pub voids: VoidTracker,
}

impl SweepState {
    pub fn new(watermark: Watermark) -> Self {
        Self {
            watermark,
            voids: VoidTracker::new(),
        }
    }
}

/// Size and time bounds of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepLimits {
    pub max_record_set_size: usize,
    pub max_transactions_per_commit: usize,
    pub reindex_lag_ms: i64,
    pub max_txn_duration_ms: i64,
}

impl From<&TrackerConfig> for SweepLimits {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            max_record_set_size: config.max_record_set_size,
            max_transactions_per_commit: config.max_transactions_per_commit,
            reindex_lag_ms: config.reindex_lag_ms,
            max_txn_duration_ms: config.max_txn_duration_ms,
        }
    }
}

impl From<&RecoveryConfig> for SweepLimits {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            max_record_set_size: config.max_transactions_per_iteration,
            max_transactions_per_commit: config.max_transactions_per_commit,
            reindex_lag_ms: 0,
            max_txn_duration_ms: 0,
        }
    }
}

/// Hooks into a running sweep.
pub trait SweepObserver: Send {
    /// Called for every transaction examined.
    fn transaction_processed(&mut self, _txn: &TransactionRecord) {}

    /// Called after a non-empty tick of a full sweep, once its work has
    /// been drained.
    fn iteration_complete(&mut self, _watermark: &Watermark, _examined: usize) -> Result<(), IndexingError> {
        Ok(())
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SweepObserver for NoopObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing left in the window
    CaughtUp,
    /// Call again right away
    MoreWork,
    /// Shutdown observed; the watermark was not moved
    Terminated,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub outcome: TickOutcome,
    pub from_time_inclusive: Option<TimestampMs>,
    /// Transactions examined
    pub examined: usize,
    /// Transactions sent for reindexing
    pub reindexed: usize,
    pub max_commit_time_ms: Option<TimestampMs>,
}

impl TickReport {
    fn new(from_time_inclusive: Option<TimestampMs>) -> Self {
        Self {
            outcome: TickOutcome::CaughtUp,
            from_time_inclusive,
            examined: 0,
            reindexed: 0,
            max_commit_time_ms: None,
        }
    }
}

/// Drives ticks for one policy.
pub struct TransactionTracker {
    source: Arc<dyn TransactionSource>,
    oracle: PresenceOracle,
    reindexer: Arc<Reindexer>,
    scheduler: Arc<ReindexScheduler>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    policy: ReindexPolicy,
    limits: SweepLimits,
}

impl TransactionTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn TransactionSource>,
        oracle: PresenceOracle,
        reindexer: Arc<Reindexer>,
        scheduler: Arc<ReindexScheduler>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
        policy: ReindexPolicy,
        limits: SweepLimits,
    ) -> Self {
        Self {
            source,
            oracle,
            reindexer,
            scheduler,
            clock,
            shutdown,
            policy,
            limits,
        }
    }

    pub fn policy(&self) -> ReindexPolicy {
        self.policy
    }

    pub fn limits(&self) -> SweepLimits {
        self.limits
    }

    pub fn scheduler(&self) -> &Arc<ReindexScheduler> {
        &self.scheduler
    }

    /// Watermark for the first tick of live tracking: the lesser of the
    /// last indexed commit times over all and over remote transactions.
    pub fn starting_watermark(&self) -> Result<Watermark, IndexingError> {
        let now = self.clock.now_ms();
        let all = self.last_indexed_commit_time(now, false)?;
        let remote = self.last_indexed_commit_time(now, true)?;
        let start = all.min(remote);
        info!(start_time_ms = start, all_time_ms = all, remote_time_ms = remote, "Tracker starting point");
        Ok(Watermark::starting_at(Some(start)))
    }

    /// Walk back from `now - max_txn_duration` until a transaction that is
    /// in the index turns up. Steps start at a minute and grow by 10% each
    /// time, never more than an hour.
    ///
    /// When the first candidate is already indexed the look-back point
    /// itself is returned. With no indexed transaction at all the start of
    /// history (0) is returned.
    pub fn last_indexed_commit_time(&self, now: TimestampMs, remote_only: bool) -> Result<TimestampMs, IndexingError> {
        let max_to_exclusive = now - self.limits.max_txn_duration_ms;
        let mut to_exclusive = max_to_exclusive;
        let mut from_inclusive = 0;
        let mut step_factor = 1.0_f64;
        let mut first_was_in_index = true;
        let stores = self.oracle.ordered_stores()?;

        loop {
            let query = TransactionQuery::descending(None, Some(to_exclusive))
                .with_limit(1)
                .with_remote_only(remote_only);
            let Some(txn) = self.source.list_transactions(&query)?.into_iter().next() else {
                break;
            };
            let Some(commit_time) = txn.commit_time_ms else {
                break;
            };
            if self.oracle.presence_in(&txn, &stores)? == Presence::Yes {
                from_inclusive = commit_time;
                break;
            }
            first_was_in_index = false;
            let decrement = ONE_HOUR_MS.min((ONE_MINUTE_MS as f64 * step_factor) as i64);
            to_exclusive = commit_time - decrement;
            step_factor *= 1.1;
        }

        if first_was_in_index {
            Ok(max_to_exclusive)
        } else {
            Ok(from_inclusive)
        }
    }

    /// Run one tick.
    pub async fn tick(
        &self,
        state: &mut SweepState,
        observer: &mut dyn SweepObserver,
        listener: Option<Arc<dyn TrackerListener>>,
    ) -> Result<TickReport, IndexingError> {
        let now = self.clock.now_ms();
        let to_exclusive = self
            .policy
            .use_lag_window
            .then(|| now - self.limits.reindex_lag_ms);

        if !self.policy.full_sweep {
            let expire_before = now - self.limits.max_txn_duration_ms;
            let filled = state
                .voids
                .check_and_expire(&*self.source, &self.oracle, expire_before)?;
            if let Some(void_time) = filled {
                if state
                    .watermark
                    .from_time_inclusive
                    .is_some_and(|from| void_time <= from)
                {
                    debug!(
                        from_time_ms = ?state.watermark.from_time_inclusive,
                        void_time_ms = void_time,
                        "Void filled before the watermark, rewinding"
                    );
                    state.watermark.rewind(void_time);
                }
            }
        }

        let mut report = TickReport::new(state.watermark.from_time_inclusive);
        let query = TransactionQuery::ascending(state.watermark.from_time_inclusive, to_exclusive)
            .with_limit(self.limits.max_record_set_size)
            .excluding(&state.watermark.previous_txn_ids);
        let txns = self.source.list_transactions(&query)?;

        if txns.is_empty() {
            state.watermark.force_reindex = false;
            return Ok(report);
        }
        debug!(
            count = txns.len(),
            from_time_ms = ?state.watermark.from_time_inclusive,
            first_txn_id = txns[0].id,
            "Reindexing transactions"
        );

        let mut processed: BTreeMap<TxnId, TimestampMs> = BTreeMap::new();
        let mut buffer: Vec<TxnId> = Vec::with_capacity(self.limits.max_transactions_per_commit);
        let mut terminated = false;
        let mut stores: Option<Vec<StoreRef>> = None;

        for txn in &txns {
            if self.shutdown.is_cancelled() {
                terminated = true;
                break;
            }
            let Some(commit_time) = txn.commit_time_ms else {
                continue;
            };
            processed.insert(txn.id, commit_time);
            report.examined += 1;
            if !self.policy.full_sweep {
                state.voids.remove(txn.id);
            }

            let reindex = if self.policy.full_sweep || state.watermark.force_reindex {
                true
            } else {
                if stores.is_none() {
                    stores = Some(self.oracle.ordered_stores()?);
                }
                self.oracle
                    .presence_in(txn, stores.as_deref().unwrap_or(&[]))?
                    .is_missing()
            };
            if reindex {
                if !self.policy.full_sweep {
                    // Everything after the first missing transaction is reindexed
                    state.watermark.force_reindex = true;
                }
                report.reindexed += 1;
                debug!(txn_id = txn.id, "Reindexing transaction");

                if self.policy.stop_on_error {
                    match self.reindex_now(txn.id).await {
                        Ok(()) => {}
                        Err(e) if e.is_terminated() => {
                            info!(txn_id = txn.id, "Reindex terminated by shutdown");
                            terminated = true;
                            break;
                        }
                        Err(e) => {
                            return Err(IndexingError::Aborted {
                                txn_id: txn.id,
                                source: Box::new(e),
                            })
                        }
                    }
                } else {
                    buffer.push(txn.id);
                    if buffer.len() >= self.limits.max_transactions_per_commit && !self.flush(&mut buffer).await {
                        terminated = true;
                        break;
                    }
                }
            } else {
                debug!(txn_id = txn.id, "Reindex skipping transaction");
            }
            observer.transaction_processed(txn);
        }

        if !terminated && !buffer.is_empty() && !self.flush(&mut buffer).await {
            terminated = true;
        }
        if terminated {
            report.outcome = TickOutcome::Terminated;
            return Ok(report);
        }

        if !self.policy.full_sweep {
            self.record_voids(state, &processed, now);
        }

        let Some(max_commit_time) = processed.values().copied().max() else {
            return Ok(report);
        };
        report.max_commit_time_ms = Some(max_commit_time);

        if let Some(listener) = listener {
            let from = state.watermark.from_time_inclusive.unwrap_or(max_commit_time);
            listener.indexed_transactions(from, max_commit_time);
        }

        // With an unchanged commit time the same transactions would come
        // back next tick, so keep excluding them
        if state.watermark.from_time_inclusive != Some(max_commit_time) {
            state.watermark.from_time_inclusive = Some(max_commit_time);
            state.watermark.previous_txn_ids.clear();
        }
        state
            .watermark
            .previous_txn_ids
            .extend(txns.iter().map(|txn| txn.id));

        report.outcome = TickOutcome::MoreWork;
        Ok(report)
    }

    /// Record every skipped ID above the last walked one. Transactions that
    /// committed longer ago than the longest transaction cannot hide voids.
    fn record_voids(&self, state: &mut SweepState, processed: &BTreeMap<TxnId, TimestampMs>, now: TimestampMs) {
        let retention_start = now - self.limits.max_txn_duration_ms;
        let mut last_id = state.watermark.last_max_txn_id;
        for (&txn_id, &commit_time) in processed {
            if last_id.is_some_and(|last| txn_id <= last) {
                continue;
            }
            if let Some(last) = last_id {
                if commit_time >= retention_start {
                    state.voids.record_range(last, txn_id, commit_time);
                }
            }
            last_id = Some(txn_id);
        }
        state.watermark.last_max_txn_id = last_id;
    }

    /// Hand a group to the scheduler. Returns false when shutdown stopped it.
    async fn flush(&self, buffer: &mut Vec<TxnId>) -> bool {
        let txn_ids = std::mem::take(buffer);
        match self.scheduler.submit(txn_ids.clone()).await {
            Ok(_) => true,
            Err(e) if e.is_terminated() => {
                info!(count = txn_ids.len(), reason = %e, "Reindex terminated by shutdown");
                false
            }
            Err(e) => {
                warn!(txn_ids = ?txn_ids, error = %e, "Reindex of transactions failed");
                true
            }
        }
    }

    async fn reindex_now(&self, txn_id: TxnId) -> Result<(), IndexingError> {
        let reindexer = self.reindexer.clone();
        tokio::task::spawn_blocking(move || reindexer.reindex_transaction(txn_id))
            .await
            .map_err(|e| IndexingError::Index(format!("reindex worker panicked: {}", e)))??;
        Ok(())
    }
}
