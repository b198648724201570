//! Random start delay for scheduled jobs.
//!
//! Several tracker processes sharing one index and one cron schedule would
//! otherwise all query the store in the same second.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound of the random delay applied before each run.
///
/// ```
/// use tracker_scheduler::JitterConfig;
///
/// let config = JitterConfig::new(5);
/// assert!(config.generate_jitter() < std::time::Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JitterConfig {
    /// 0 disables jitter
    pub max_jitter_secs: u64,
}

impl JitterConfig {
    pub fn new(max_jitter_secs: u64) -> Self {
        Self { max_jitter_secs }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// A delay in `[0, max_jitter_secs)`, at millisecond resolution.
    pub fn generate_jitter(&self) -> Duration {
        if self.max_jitter_secs == 0 {
            return Duration::ZERO;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..self.max_jitter_secs * 1000);
        Duration::from_millis(jitter_ms)
    }

    pub fn is_enabled(&self) -> bool {
        self.max_jitter_secs > 0
    }
}

/// Sleep for a random jitter, then run `job`.
pub async fn with_jitter<F, T>(config: &JitterConfig, job: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let jitter = config.generate_jitter();
    if !jitter.is_zero() {
        tracing::debug!(jitter_ms = jitter.as_millis() as u64, "Applying jitter delay");
        tokio::time::sleep(jitter).await;
    }
    job.await
}
