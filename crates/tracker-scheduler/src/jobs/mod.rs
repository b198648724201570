//! Jobs registered with the scheduler.
//!
//! - **tracking**: periodic trigger of the index transaction tracker

pub mod tracking;

pub use tracking::{create_tracking_job, TrackingJobConfig, TRACKING_JOB_NAME};
