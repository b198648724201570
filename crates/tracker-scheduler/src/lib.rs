//! Background triggering for the index transaction tracker.
//!
//! The tracker is not a long-running loop of its own: a cron job calls
//! [`ReindexEngine::trigger`](tracker_indexing::ReindexEngine::trigger) on a
//! fixed schedule and each firing catches the index up to the store.
//!
//! # Features
//!
//! - Cron schedules (6-field, seconds first) with timezone support
//! - Overlap policy: a firing that finds the previous run active is skipped
//! - Optional jitter before each run
//! - Run history and failure counts in a [`JobRegistry`]
//! - Graceful shutdown through a shared `CancellationToken`
//!
//! # Example
//!
//! ```ignore
//! use tracker_scheduler::{create_tracking_job, SchedulerConfig, SchedulerService, TrackingJobConfig};
//!
//! let scheduler = SchedulerService::new(SchedulerConfig::default()).await?;
//! create_tracking_job(&scheduler, engine.clone(), TrackingJobConfig::default()).await?;
//! scheduler.start().await?;
//!
//! let status = scheduler.registry().get_status("index_tracking");
//! ```

mod config;
mod error;
mod jitter;
pub mod jobs;
mod overlap;
mod registry;
mod scheduler;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use jitter::{with_jitter, JitterConfig};
pub use jobs::{create_tracking_job, TrackingJobConfig, TRACKING_JOB_NAME};
pub use overlap::{OverlapGuard, OverlapPolicy, RunGuard};
pub use registry::{JobOutput, JobRegistry, JobResult, JobStatus};
pub use scheduler::{validate_cron_expression, SchedulerService};
