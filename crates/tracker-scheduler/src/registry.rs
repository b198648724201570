//! Run history of scheduled jobs.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobResult {
    Success,
    Failed(String),
    /// Not run, with the reason (overlap, shutdown)
    Skipped(String),
}

/// Key/value details a job reports about its run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    pub metadata: HashMap<String, String>,
}

impl JobOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Status of a registered job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_name: String,
    pub cron_expr: String,
    /// When the last run finished
    pub last_run: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_result: Option<JobResult>,
    /// Completed runs, skipped ones included
    pub run_count: u64,
    pub error_count: u64,
    pub is_running: bool,
    pub is_paused: bool,
    #[serde(default)]
    pub last_run_metadata: HashMap<String, String>,
}

impl JobStatus {
    pub fn new(job_name: String, cron_expr: String) -> Self {
        Self {
            job_name,
            cron_expr,
            last_run: None,
            last_duration_ms: None,
            last_result: None,
            run_count: 0,
            error_count: 0,
            is_running: false,
            is_paused: false,
            last_run_metadata: HashMap::new(),
        }
    }
}

/// Thread-safe map of job name to [`JobStatus`].
///
/// ```
/// use tracker_scheduler::{JobRegistry, JobResult};
///
/// let registry = JobRegistry::new();
/// registry.register("index_tracking", "*/10 * * * * *");
/// registry.record_start("index_tracking");
/// assert!(registry.is_running("index_tracking"));
///
/// registry.record_complete("index_tracking", JobResult::Success, 12);
/// assert_eq!(registry.get_status("index_tracking").unwrap().run_count, 1);
/// ```
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobStatus>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job, replacing any previous entry of that name.
    pub fn register(&self, job_name: &str, cron_expr: &str) {
        self.write().insert(
            job_name.to_string(),
            JobStatus::new(job_name.to_string(), cron_expr.to_string()),
        );
    }

    pub fn unregister(&self, job_name: &str) -> bool {
        self.write().remove(job_name).is_some()
    }

    pub fn record_start(&self, job_name: &str) {
        self.update(job_name, |status| status.is_running = true);
    }

    pub fn record_complete(&self, job_name: &str, result: JobResult, duration_ms: u64) {
        self.record_output(job_name, result, duration_ms, JobOutput::new());
    }

    /// Record a finished run together with what it reported. A skipped
    /// firing leaves the running flag of the active run untouched.
    pub fn record_output(&self, job_name: &str, result: JobResult, duration_ms: u64, output: JobOutput) {
        self.update(job_name, |status| {
            if !matches!(result, JobResult::Skipped(_)) {
                status.is_running = false;
            }
            status.last_run = Some(Utc::now());
            status.last_duration_ms = Some(duration_ms);
            status.run_count += 1;
            if matches!(result, JobResult::Failed(_)) {
                status.error_count += 1;
            }
            status.last_result = Some(result);
            status.last_run_metadata = output.metadata;
        });
    }

    pub fn set_paused(&self, job_name: &str, paused: bool) {
        self.update(job_name, |status| status.is_paused = paused);
    }

    pub fn get_status(&self, job_name: &str) -> Option<JobStatus> {
        self.read().get(job_name).cloned()
    }

    pub fn get_all_status(&self) -> Vec<JobStatus> {
        self.read().values().cloned().collect()
    }

    pub fn is_running(&self, job_name: &str) -> bool {
        self.read().get(job_name).is_some_and(|s| s.is_running)
    }

    pub fn is_paused(&self, job_name: &str) -> bool {
        self.read().get(job_name).is_some_and(|s| s.is_paused)
    }

    pub fn is_registered(&self, job_name: &str) -> bool {
        self.read().contains_key(job_name)
    }

    pub fn job_count(&self) -> usize {
        self.read().len()
    }

    fn update(&self, job_name: &str, f: impl FnOnce(&mut JobStatus)) {
        if let Some(status) = self.write().get_mut(job_name) {
            f(status);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, JobStatus>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, JobStatus>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let registry = JobRegistry::new();
        registry.register("index_tracking", "*/10 * * * * *");

        let status = registry.get_status("index_tracking").unwrap();
        assert_eq!(status.cron_expr, "*/10 * * * * *");
        assert_eq!(status.run_count, 0);
        assert!(!status.is_running);
        assert!(registry.is_registered("index_tracking"));
        assert_eq!(registry.job_count(), 1);
    }

    #[test]
    fn test_failure_counts_as_error_skip_does_not() {
        let registry = JobRegistry::new();
        registry.register("job", "0 * * * * *");

        registry.record_start("job");
        registry.record_complete("job", JobResult::Failed("store offline".into()), 40);
        registry.record_complete("job", JobResult::Skipped("overlap".into()), 0);

        let status = registry.get_status("job").unwrap();
        assert_eq!(status.run_count, 2);
        assert_eq!(status.error_count, 1);
        assert_eq!(status.last_result, Some(JobResult::Skipped("overlap".into())));
        assert!(!status.is_running);
    }

    #[test]
    fn test_skip_keeps_active_run_flag() {
        let registry = JobRegistry::new();
        registry.register("job", "0 * * * * *");

        registry.record_start("job");
        registry.record_complete("job", JobResult::Skipped("overlap".into()), 0);
        assert!(registry.is_running("job"));

        registry.record_complete("job", JobResult::Success, 10);
        assert!(!registry.is_running("job"));
    }

    #[test]
    fn test_output_metadata_recorded() {
        let registry = JobRegistry::new();
        registry.register("job", "0 * * * * *");
        registry.record_output(
            "job",
            JobResult::Success,
            5,
            JobOutput::new().with_metadata("reindexed", "12"),
        );

        let status = registry.get_status("job").unwrap();
        assert_eq!(status.last_run_metadata.get("reindexed").map(String::as_str), Some("12"));
        assert_eq!(status.last_duration_ms, Some(5));
    }

    #[test]
    fn test_pause_and_unregister() {
        let registry = JobRegistry::new();
        registry.register("job", "0 * * * * *");
        registry.set_paused("job", true);
        assert!(registry.is_paused("job"));
        assert!(registry.unregister("job"));
        assert!(!registry.unregister("job"));
        assert!(!registry.is_paused("job"));
    }

    #[test]
    fn test_unknown_job_is_ignored() {
        let registry = JobRegistry::new();
        registry.record_start("missing");
        registry.record_complete("missing", JobResult::Success, 1);
        assert!(registry.get_status("missing").is_none());
        assert!(!registry.is_running("missing"));
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(JobRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let name = format!("job-{}", i);
                    registry.register(&name, "0 * * * * *");
                    registry.record_start(&name);
                    registry.record_complete(&name, JobResult::Success, 1);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.job_count(), 8);
        assert!(registry.get_all_status().iter().all(|s| s.run_count == 1));
    }
}
