//! Scheduled index tracking.
//!
//! Fires [`ReindexEngine::trigger`] on a cron schedule. A firing that finds
//! the previous run still active is skipped by the overlap guard, and the
//! engine itself answers `Busy` if anything else is already running it.
//! Cancelling the scheduler's shutdown token shuts the engine down.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracker_indexing::{ReindexEngine, TriggerOutcome};
use tracker_types::Settings;

use crate::registry::JobOutput;
use crate::{JitterConfig, OverlapPolicy, SchedulerError, SchedulerService};

pub const TRACKING_JOB_NAME: &str = "index_tracking";

/// Schedule of the tracking job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingJobConfig {
    /// Cron expression (default: every 10 seconds)
    pub cron: String,
    pub timezone: String,
    /// Max jitter in seconds (default: none)
    pub jitter_secs: u64,
}

impl Default for TrackingJobConfig {
    fn default() -> Self {
        Self {
            cron: "*/10 * * * * *".to_string(),
            timezone: "UTC".to_string(),
            jitter_secs: 0,
        }
    }
}

impl TrackingJobConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cron: settings.tracking.cron.clone(),
            jitter_secs: settings.tracking.jitter_secs,
            ..Default::default()
        }
    }

    pub fn with_cron(mut self, cron: impl Into<String>) -> Self {
        self.cron = cron.into();
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_jitter_secs(mut self, jitter_secs: u64) -> Self {
        self.jitter_secs = jitter_secs;
        self
    }
}

/// Register the tracking job and tie the engine's lifetime to the
/// scheduler's shutdown token.
///
/// # Errors
///
/// Returns error if the cron expression or timezone is invalid.
pub async fn create_tracking_job(
    scheduler: &SchedulerService,
    engine: Arc<ReindexEngine>,
    config: TrackingJobConfig,
) -> Result<(), SchedulerError> {
    let job_engine = engine.clone();
    scheduler
        .register_job(
            TRACKING_JOB_NAME,
            &config.cron,
            Some(&config.timezone),
            OverlapPolicy::Skip,
            JitterConfig::new(config.jitter_secs),
            move |_token| {
                let engine = job_engine.clone();
                async move { run_tracking(&engine).await }
            },
        )
        .await?;

    let token = scheduler.shutdown_token();
    tokio::spawn(async move {
        token.cancelled().await;
        engine.shutdown();
    });

    info!(cron = %config.cron, "Registered index tracking job");
    Ok(())
}

async fn run_tracking(engine: &ReindexEngine) -> Result<JobOutput, String> {
    let outcome = engine
        .trigger()
        .await
        .map_err(|e| format!("Index tracking failed: {}", e))?;

    let output = match &outcome {
        TriggerOutcome::Busy => {
            debug!("Index tracker busy");
            JobOutput::new().with_metadata("outcome", "busy")
        }
        TriggerOutcome::CaughtUp(report) | TriggerOutcome::Terminated(report) => {
            if report.reindexed > 0 {
                info!(
                    examined = report.examined,
                    reindexed = report.reindexed,
                    watermark_ms = ?report.watermark,
                    "Index tracking reindexed transactions"
                );
            }
            let label = if matches!(outcome, TriggerOutcome::Terminated(_)) {
                "terminated"
            } else {
                "caught_up"
            };
            JobOutput::new()
                .with_metadata("outcome", label)
                .with_metadata("examined", report.examined.to_string())
                .with_metadata("reindexed", report.reindexed.to_string())
        }
    };
    Ok(output)
}
