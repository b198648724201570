//! Index transaction tracking and reindexing.
//!
//! This crate keeps a search index consistent with the authoritative node
//! store by walking committed transactions in commit-time order and
//! reindexing those the index does not yet reflect.
//!
//! ## Key Components
//!
//! - [`PresenceOracle`]: Decides whether a transaction is visible in the index
//! - [`VoidTracker`]: Remembers skipped transaction IDs that may still commit
//! - [`ReindexScheduler`]: Runs reindex work on a bounded pool, committing in submission order
//! - [`ReindexEngine`]: The tracking loop, also used for full sweeps
//! - [`FullRecoveryDriver`]: Startup validation and repair
//! - [`RecoveryCheckpoint`]: Persisted progress of a full rebuild
//!
//! ## Architecture
//!
//! 1. The engine lists transactions from its watermark up to `now - lag`
//! 2. Each is checked against the index; the first missing one forces
//!    reindexing of everything after it in the tick
//! 3. Reindex groups go to the scheduler, whose workers commit in order
//! 4. The watermark moves to the newest commit time seen
//! 5. Skipped IDs are watched as voids and rewind the watermark when they
//!    later appear
//!
//! ## Example
//!
//! ```ignore
//! use tracker_indexing::{ReindexContext, ReindexEngine, TrackerConfig};
//!
//! let context = ReindexContext::new(store.clone(), index.clone(), index.clone());
//! let engine = ReindexEngine::tracking(context, &TrackerConfig::default());
//!
//! // Called on every scheduler firing
//! let outcome = engine.trigger().await?;
//! ```

pub mod checkpoint;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod presence;
pub mod recovery;
pub mod reindex;
pub mod runner;
pub mod scheduler;
pub mod tracker;
pub mod voids;

pub use checkpoint::{
    load_recovery_checkpoint, save_recovery_checkpoint, CheckpointStore, InMemoryCheckpointStore,
    RecoveryCheckpoint, FULL_RECOVERY_JOB,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    CommitOrder, IndexProbe, IndexSession, Indexer, NodeIndexer, ReindexStats, TrackerListener,
    TransactionQuery, TransactionSource, WriteLock,
};
pub use config::{RecoveryConfig, TrackerConfig};
pub use engine::{ReindexContext, ReindexEngine, ReindexPolicy, SweepReport, TrackerState, TriggerOutcome};
pub use error::IndexingError;
pub use memory::{change_txn_id, MemoryIndex, MemoryNodeStore, UpdateHook};
pub use presence::PresenceOracle;
pub use recovery::{
    FullRecoveryDriver, RecoveryAction, RecoveryReport, ServerLockGuard, ThrottledProgressListener,
};
pub use reindex::{CommitBarrier, Reindexer};
pub use runner::{RetryingTransactionRunner, TransactionOptions, TransactionRunner};
pub use scheduler::{OrderingQueue, ReindexScheduler, WorkHandle, WorkOutcome, WorkTicket};
pub use tracker::{
    NoopObserver, SweepLimits, SweepObserver, SweepState, TickOutcome, TickReport, TransactionTracker,
    Watermark,
};
pub use voids::{VoidRecord, VoidTracker};
