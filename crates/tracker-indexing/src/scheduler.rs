//! Ordered, bounded-concurrency reindex workers.
//!
//! Work items run in parallel but their index commits land in submission
//! order. Each submitted item takes a ticket and joins the back of one FIFO
//! queue. A worker that finished writing waits until its ticket is at the
//! head before committing, then leaves the queue and wakes the next one.
//!
//! The concurrency permit is taken before the ticket, so the head of the
//! queue always holds a permit and can never wait behind a later item.
//! While a submit waits for a permit it keeps watching the head, so a head
//! that stalls with every permit taken is still killed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, warn};
use tracker_types::TxnId;

use crate::error::IndexingError;
use crate::reindex::{CommitBarrier, Reindexer};

/// Log target for worker threads.
pub const THREADS_TARGET: &str = "tracker_indexing::threads";

/// Poll interval of workers waiting for their turn and of drain.
pub const TURN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Opaque handle ordering a work item in the commit queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkTicket(u64);

impl std::fmt::Display for WorkTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a work item ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Committed,
    /// Stopped by shutdown or by the inactivity guard and rolled back
    Terminated,
    Failed(String),
}

/// Handle to a submitted work item.
#[derive(Debug)]
pub struct WorkHandle {
    ticket: WorkTicket,
    outcome: oneshot::Receiver<WorkOutcome>,
}

impl WorkHandle {
    fn completed(ticket: WorkTicket, outcome: WorkOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        if tx.send(outcome).is_err() {
            debug!(ticket = %ticket, "Work handle dropped before completion");
        }
        Self { ticket, outcome: rx }
    }

    pub fn ticket(&self) -> WorkTicket {
        self.ticket
    }

    /// Wait for the item to finish.
    pub async fn outcome(self) -> WorkOutcome {
        self.outcome
            .await
            .unwrap_or_else(|_| WorkOutcome::Failed("worker exited without reporting".to_string()))
    }
}

/// Liveness of one in-flight work item. Workers only touch this.
#[derive(Debug)]
pub struct WorkProgress {
    epoch: Instant,
    last_progress_ms: AtomicU64,
    killed: AtomicBool,
}

impl WorkProgress {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_progress_ms: AtomicU64::new(0),
            killed: AtomicBool::new(false),
        }
    }

    /// Record progress and fail if the item has been killed.
    pub fn touch(&self) -> Result<(), IndexingError> {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_progress_ms.store(elapsed, Ordering::Release);
        self.check()
    }

    pub fn check(&self) -> Result<(), IndexingError> {
        if self.killed.load(Ordering::Acquire) {
            return Err(IndexingError::Terminated(
                "killed after making no progress".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_progress_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }
}

struct InFlight {
    ticket: WorkTicket,
    progress: Arc<WorkProgress>,
}

#[derive(Default)]
struct QueueState {
    next_ticket: u64,
    in_flight: VecDeque<InFlight>,
}

/// FIFO of in-flight work items. Head-of-queue is a ticket comparison
/// under the one lock.
#[derive(Default)]
pub struct OrderingQueue {
    state: Mutex<QueueState>,
    turn: Condvar,
}

impl OrderingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A ticket for work that is not queued.
    pub fn issue_ticket(&self) -> WorkTicket {
        let mut state = self.lock();
        state.next_ticket += 1;
        WorkTicket(state.next_ticket)
    }

    /// Take a ticket and join the back of the queue.
    pub fn enqueue(&self) -> (WorkTicket, Arc<WorkProgress>) {
        let mut state = self.lock();
        state.next_ticket += 1;
        let ticket = WorkTicket(state.next_ticket);
        let progress = Arc::new(WorkProgress::new());
        state.in_flight.push_back(InFlight {
            ticket,
            progress: progress.clone(),
        });
        (ticket, progress)
    }

    pub fn is_head(&self, ticket: WorkTicket) -> bool {
        self.lock().in_flight.front().is_some_and(|head| head.ticket == ticket)
    }

    /// Block for at most `timeout` until `ticket` is at the head.
    pub fn wait_for_head(&self, ticket: WorkTicket, timeout: Duration) -> bool {
        let state = self.lock();
        if state.in_flight.front().is_some_and(|head| head.ticket == ticket) {
            return true;
        }
        let (state, _) = self
            .turn
            .wait_timeout(state, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        state.in_flight.front().is_some_and(|head| head.ticket == ticket)
    }

    /// Leave the queue and wake the waiters. Removing twice is harmless.
    pub fn remove(&self, ticket: WorkTicket) -> bool {
        let mut state = self.lock();
        let before = state.in_flight.len();
        state.in_flight.retain(|item| item.ticket != ticket);
        let removed = state.in_flight.len() != before;
        drop(state);
        if removed {
            self.turn.notify_all();
        }
        removed
    }

    pub fn head(&self) -> Option<(WorkTicket, Arc<WorkProgress>)> {
        self.lock()
            .in_flight
            .front()
            .map(|head| (head.ticket, head.progress.clone()))
    }

    /// Kill and remove the head, provided it is still `ticket`.
    pub fn kill_if_head(&self, ticket: WorkTicket) -> bool {
        let mut state = self.lock();
        if !state.in_flight.front().is_some_and(|head| head.ticket == ticket) {
            return false;
        }
        if let Some(head) = state.in_flight.pop_front() {
            head.progress.killed.store(true, Ordering::Release);
        }
        drop(state);
        self.turn.notify_all();
        true
    }

    pub fn len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Waits on the queue for a worker's turn to commit.
struct QueueBarrier<'a> {
    queue: &'a OrderingQueue,
    ticket: WorkTicket,
    progress: &'a WorkProgress,
    reindexer: &'a Reindexer,
}

impl CommitBarrier for QueueBarrier<'_> {
    fn wait_for_turn(&self) -> Result<(), IndexingError> {
        loop {
            self.progress.check()?;
            if self.queue.wait_for_head(self.ticket, TURN_POLL_INTERVAL) {
                return self.progress.check();
            }
            if self.reindexer.shutdown_token().is_cancelled() {
                return Err(IndexingError::Terminated(
                    "shutdown while waiting to commit".to_string(),
                ));
            }
        }
    }
}

/// Removes the slot when the worker finishes, however it finishes.
struct QueueSlot {
    queue: Arc<OrderingQueue>,
    ticket: WorkTicket,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.queue.remove(self.ticket);
    }
}

/// Dispatches reindex work items to a bounded pool of blocking workers.
pub struct ReindexScheduler {
    reindexer: Arc<Reindexer>,
    queue: Arc<OrderingQueue>,
    permits: Arc<Semaphore>,
    worker_threads: usize,
    inactivity_timeout: Duration,
    /// Head being timed and when it was first seen there
    head_watch: Mutex<Option<(WorkTicket, Instant)>>,
}

impl ReindexScheduler {
    pub fn new(reindexer: Arc<Reindexer>, worker_threads: usize, inactivity_timeout: Duration) -> Self {
        Self {
            reindexer,
            queue: Arc::new(OrderingQueue::new()),
            permits: Arc::new(Semaphore::new(worker_threads.max(1))),
            worker_threads,
            inactivity_timeout,
            head_watch: Mutex::new(None),
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Whether work runs on the caller instead of on the pool.
    pub fn is_inline(&self) -> bool {
        self.worker_threads < 2
    }

    /// Work items not yet committed or rolled back.
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Submit a group of transactions to be committed to the index as one
    /// unit. Returns once the item is queued; with fewer than 2 workers the
    /// item runs to completion first and its error is returned directly.
    pub async fn submit(&self, txn_ids: Vec<TxnId>) -> Result<WorkHandle, IndexingError> {
        if txn_ids.is_empty() {
            return Ok(WorkHandle::completed(self.queue.issue_ticket(), WorkOutcome::Committed));
        }

        if self.is_inline() {
            let ticket = self.queue.issue_ticket();
            let reindexer = self.reindexer.clone();
            let stats = tokio::task::spawn_blocking(move || {
                reindexer.reindex_batch(&txn_ids, None, &|| Ok(()))
            })
            .await
            .map_err(|e| IndexingError::Index(format!("reindex worker panicked: {}", e)))??;
            debug!(ticket = %ticket, transactions = stats.transactions, "Reindexed inline");
            return Ok(WorkHandle::completed(ticket, WorkOutcome::Committed));
        }

        let acquire = self.permits.clone().acquire_owned();
        tokio::pin!(acquire);
        let permit = loop {
            tokio::select! {
                permit = &mut acquire => {
                    break permit.map_err(|_| IndexingError::Terminated("scheduler closed".to_string()))?;
                }
                _ = tokio::time::sleep(TURN_POLL_INTERVAL) => {
                    self.expire_stalled_head();
                }
            }
        };
        let (ticket, progress) = self.queue.enqueue();
        let (tx, rx) = oneshot::channel();
        let reindexer = self.reindexer.clone();
        let slot = QueueSlot {
            queue: self.queue.clone(),
            ticket,
        };

        debug!(ticket = %ticket, count = txn_ids.len(), "Submitted reindex work");
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let barrier = QueueBarrier {
                queue: &slot.queue,
                ticket,
                progress: &progress,
                reindexer: &reindexer,
            };
            let result = reindexer.reindex_batch(&txn_ids, Some(&barrier), &|| progress.touch());
            drop(slot);

            let outcome = match result {
                Ok(stats) => {
                    debug!(
                        target: THREADS_TARGET,
                        ticket = %ticket,
                        transactions = stats.transactions,
                        nodes = stats.nodes(),
                        "Reindex work committed"
                    );
                    WorkOutcome::Committed
                }
                Err(e) if e.is_terminated() => {
                    info!(target: THREADS_TARGET, ticket = %ticket, reason = %e, "Reindex work terminated");
                    WorkOutcome::Terminated
                }
                Err(e) => {
                    error!(
                        target: THREADS_TARGET,
                        ticket = %ticket,
                        txn_ids = ?txn_ids,
                        error = %e,
                        "Reindex work failed"
                    );
                    WorkOutcome::Failed(e.to_string())
                }
            };
            if tx.send(outcome).is_err() {
                debug!(target: THREADS_TARGET, ticket = %ticket, "Work handle dropped before completion");
            }
        });

        Ok(WorkHandle { ticket, outcome: rx })
    }

    /// Wait until every submitted item has committed or rolled back.
    ///
    /// A head of queue that makes no progress for the inactivity timeout is
    /// killed and removed, so one stuck worker cannot hold back the rest.
    pub async fn drain(&self) {
        while !self.queue.is_empty() {
            if !self.expire_stalled_head() {
                tokio::time::sleep(TURN_POLL_INTERVAL).await;
            }
        }
    }

    /// Kill the head if it has been idle for the inactivity timeout.
    /// Returns true when the head was found stalled.
    fn expire_stalled_head(&self) -> bool {
        let Some((ticket, progress)) = self.queue.head() else {
            return false;
        };
        let head_since = {
            let mut watch = self.head_watch.lock().unwrap_or_else(PoisonError::into_inner);
            match *watch {
                Some((watched, since)) if watched == ticket => since,
                _ => {
                    let now = Instant::now();
                    *watch = Some((ticket, now));
                    now
                }
            }
        };

        let idle = progress.idle_for().min(head_since.elapsed());
        if idle < self.inactivity_timeout {
            return false;
        }
        if self.queue.kill_if_head(ticket) {
            warn!(
                target: THREADS_TARGET,
                ticket = %ticket,
                idle_ms = idle.as_millis() as u64,
                remaining = self.queue.len(),
                "Reindex worker made no progress and was removed from the queue"
            );
        }
        true
    }
}
