//! Scheduler service wrapper around tokio-cron-scheduler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono_tz::Tz;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::jitter::with_jitter;
use crate::registry::JobOutput;
use crate::{JitterConfig, JobRegistry, JobResult, OverlapGuard, OverlapPolicy, SchedulerConfig, SchedulerError};

/// Validate a 6-field cron expression (second minute hour day month weekday).
///
/// ```
/// use tracker_scheduler::validate_cron_expression;
///
/// assert!(validate_cron_expression("*/10 * * * * *").is_ok());
/// assert!(validate_cron_expression("* * *").is_err());
/// ```
pub fn validate_cron_expression(expr: &str) -> Result<(), SchedulerError> {
    Job::new_async(expr, |_uuid, _lock| Box::pin(async {}))
        .map(|_| ())
        .map_err(|e| SchedulerError::InvalidCron(format!("'{}': {}", expr, e)))
}

/// Owns the cron scheduler, the job registry and the shutdown token handed
/// to every job.
pub struct SchedulerService {
    scheduler: JobScheduler,
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
    job_ids: Mutex<HashMap<String, Uuid>>,
    shutdown_token: CancellationToken,
    is_running: AtomicBool,
}

impl SchedulerService {
    /// Create a stopped scheduler.
    pub async fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.parse_timezone()?;
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler,
            config,
            registry: Arc::new(JobRegistry::new()),
            job_ids: Mutex::new(HashMap::new()),
            shutdown_token: CancellationToken::new(),
            is_running: AtomicBool::new(false),
        })
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.scheduler.start().await?;
        info!(jobs = self.registry.job_count(), "Scheduler started");
        Ok(())
    }

    /// Cancel the shared token, give running jobs up to the configured
    /// timeout to finish, then stop the scheduler.
    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        info!("Initiating scheduler shutdown");
        self.shutdown_token.cancel();

        let deadline = Instant::now() + Duration::from_secs(self.config.shutdown_timeout_secs);
        while self.registry.get_all_status().iter().any(|s| s.is_running) {
            if Instant::now() >= deadline {
                warn!("Jobs still running at shutdown timeout");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Err(e) = self.scheduler.shutdown().await {
            warn!(error = %e, "Error during scheduler shutdown");
        }
        self.is_running.store(false, Ordering::SeqCst);
        info!("Scheduler shutdown complete");
        Ok(())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register a cron job.
    ///
    /// Each firing checks the pause flag and the overlap policy, sleeps for
    /// the jitter, then runs `job_fn` with the shutdown token. The result
    /// lands in the registry.
    ///
    /// # Errors
    ///
    /// `InvalidCron` or `InvalidTimezone` for bad schedule input.
    #[allow(clippy::too_many_arguments)]
    pub async fn register_job<F, Fut>(
        &self,
        name: &str,
        cron_expr: &str,
        timezone: Option<&str>,
        overlap: OverlapPolicy,
        jitter: JitterConfig,
        job_fn: F,
    ) -> Result<Uuid, SchedulerError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobOutput, String>> + Send + 'static,
    {
        let tz: Tz = match timezone {
            Some(tz) => Self::parse_timezone(tz)?,
            None => self.config.parse_timezone()?,
        };
        validate_cron_expression(cron_expr)?;

        let job_name = name.to_string();
        let token = self.shutdown_token.clone();
        let registry = self.registry.clone();
        let guard = Arc::new(OverlapGuard::new(overlap));
        let job_fn = Arc::new(job_fn);

        let job = Job::new_async_tz(cron_expr, tz, move |_uuid, _lock| {
            let name = job_name.clone();
            let token = token.clone();
            let registry = registry.clone();
            let guard = guard.clone();
            let jitter = jitter.clone();
            let job_fn = job_fn.clone();

            Box::pin(async move {
                if token.is_cancelled() {
                    return;
                }
                if registry.is_paused(&name) {
                    debug!(job = %name, "Job paused, firing ignored");
                    return;
                }
                let Some(_run) = guard.try_acquire() else {
                    debug!(job = %name, "Previous run still active, skipping");
                    registry.record_complete(&name, JobResult::Skipped("overlap".to_string()), 0);
                    return;
                };

                registry.record_start(&name);
                let start = Instant::now();
                let result = with_jitter(&jitter, job_fn(token.clone())).await;
                let duration_ms = start.elapsed().as_millis() as u64;

                match result {
                    Ok(output) => {
                        debug!(job = %name, duration_ms, "Job completed");
                        registry.record_output(&name, JobResult::Success, duration_ms, output);
                    }
                    Err(e) => {
                        warn!(job = %name, error = %e, "Job failed");
                        registry.record_complete(&name, JobResult::Failed(e), duration_ms);
                    }
                }
            })
        })
        .map_err(|e| SchedulerError::InvalidCron(e.to_string()))?;

        let uuid = self.scheduler.add(job).await?;
        self.registry.register(name, cron_expr);
        self.job_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), uuid);
        info!(job = %name, uuid = %uuid, cron = %cron_expr, timezone = %tz.name(), "Job registered");

        Ok(uuid)
    }

    /// Remove a job by name.
    pub async fn remove_job(&self, name: &str) -> Result<(), SchedulerError> {
        let uuid = self
            .job_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| SchedulerError::JobNotFound(name.to_string()))?;
        self.scheduler.remove(&uuid).await?;
        self.registry.unregister(name);
        info!(job = %name, "Job removed");
        Ok(())
    }

    /// Keep the job registered but ignore its firings.
    pub fn pause_job(&self, name: &str) -> Result<(), SchedulerError> {
        self.set_paused(name, true)
    }

    pub fn resume_job(&self, name: &str) -> Result<(), SchedulerError> {
        self.set_paused(name, false)
    }

    fn set_paused(&self, name: &str, paused: bool) -> Result<(), SchedulerError> {
        if !self.registry.is_registered(name) {
            return Err(SchedulerError::JobNotFound(name.to_string()));
        }
        self.registry.set_paused(name, paused);
        info!(job = %name, paused, "Job pause state changed");
        Ok(())
    }

    pub fn parse_timezone(tz_str: &str) -> Result<Tz, SchedulerError> {
        tz_str
            .parse()
            .map_err(|_| SchedulerError::InvalidTimezone(tz_str.to_string()))
    }
}
