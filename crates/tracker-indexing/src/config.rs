//! Runtime configuration of the tracker and of full recovery.

use std::time::Duration;

use tracker_types::{RecoveryMode, Settings};

/// Transactions per query during full recovery.
pub const DEFAULT_MAX_TRANSACTIONS_PER_ITERATION: usize = 1000;

/// Tunables of the live transaction tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Longest transaction the tracker must cope with
    pub max_txn_duration_ms: i64,
    /// Transactions younger than this are left for a later tick
    pub reindex_lag_ms: i64,
    /// Transactions requested per query
    pub max_record_set_size: usize,
    /// Transactions grouped into one index commit
    pub max_transactions_per_commit: usize,
    /// Reindex workers; fewer than 2 reindexes inline
    pub worker_threads: usize,
    /// How long the head of the commit queue may stall before it is killed
    pub inactivity_timeout: Duration,
    /// Turn off indexing inside user transactions on first activation
    pub disable_in_transaction_indexing: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_txn_duration_ms: 3_600_000,
            reindex_lag_ms: 1_000,
            max_record_set_size: 1000,
            max_transactions_per_commit: 100,
            worker_threads: 4,
            inactivity_timeout: Duration::from_secs(60),
            disable_in_transaction_indexing: false,
        }
    }
}

impl TrackerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let tracking = &settings.tracking;
        Self {
            max_txn_duration_ms: (tracking.max_txn_duration_minutes as i64).saturating_mul(60_000),
            reindex_lag_ms: tracking.reindex_lag_ms as i64,
            max_record_set_size: tracking.max_record_set_size,
            max_transactions_per_commit: tracking.max_transactions_per_commit,
            worker_threads: tracking.worker_threads,
            inactivity_timeout: Duration::from_secs(tracking.inactivity_timeout_secs),
            disable_in_transaction_indexing: tracking.disable_in_transaction_indexing,
        }
    }

    pub fn with_max_txn_duration_ms(mut self, ms: i64) -> Self {
        self.max_txn_duration_ms = ms.max(1);
        self
    }

    pub fn with_reindex_lag_ms(mut self, ms: i64) -> Self {
        self.reindex_lag_ms = ms.max(1);
        self
    }

    pub fn with_max_record_set_size(mut self, size: usize) -> Self {
        self.max_record_set_size = size.max(1);
        self
    }

    pub fn with_max_transactions_per_commit(mut self, count: usize) -> Self {
        self.max_transactions_per_commit = count.max(1);
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_disable_in_transaction_indexing(mut self, disable: bool) -> Self {
        self.disable_in_transaction_indexing = disable;
        self
    }
}

/// Tunables of startup recovery.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub mode: RecoveryMode,
    /// Abort a full rebuild on the first failed transaction
    pub stop_on_error: bool,
    /// Keep the store read-only while recovery runs
    pub lock_server: bool,
    pub max_transactions_per_commit: usize,
    /// Transactions requested per full recovery iteration
    pub max_transactions_per_iteration: usize,
    pub worker_threads: usize,
    pub inactivity_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            mode: RecoveryMode::Validate,
            stop_on_error: true,
            lock_server: false,
            max_transactions_per_commit: 100,
            max_transactions_per_iteration: DEFAULT_MAX_TRANSACTIONS_PER_ITERATION,
            worker_threads: 4,
            inactivity_timeout: Duration::from_secs(60),
        }
    }
}

impl RecoveryConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            mode: settings.recovery.mode,
            stop_on_error: settings.recovery.stop_on_error,
            lock_server: settings.recovery.lock_server,
            max_transactions_per_commit: settings.recovery.max_transactions_per_commit,
            worker_threads: settings.tracking.worker_threads,
            inactivity_timeout: Duration::from_secs(settings.tracking.inactivity_timeout_secs),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: RecoveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    pub fn with_lock_server(mut self, lock_server: bool) -> Self {
        self.lock_server = lock_server;
        self
    }

    pub fn with_max_transactions_per_commit(mut self, count: usize) -> Self {
        self.max_transactions_per_commit = count.max(1);
        self
    }

    pub fn with_max_transactions_per_iteration(mut self, count: usize) -> Self {
        self.max_transactions_per_iteration = count.max(1);
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_default_settings() {
        let settings = Settings::default();
        let tracker = TrackerConfig::from_settings(&settings);
        assert_eq!(tracker.max_txn_duration_ms, 3_600_000);
        assert_eq!(tracker.reindex_lag_ms, 1_000);
        assert_eq!(tracker.max_record_set_size, 1000);
        assert_eq!(tracker.max_transactions_per_commit, 100);
        assert_eq!(tracker.inactivity_timeout, Duration::from_secs(60));

        let recovery = RecoveryConfig::from_settings(&settings);
        assert_eq!(recovery.mode, RecoveryMode::Validate);
        assert!(recovery.stop_on_error);
        assert!(!recovery.lock_server);
        assert_eq!(recovery.max_transactions_per_iteration, 1000);
    }

    #[test]
    fn test_builders_clamp_minimums() {
        let config = TrackerConfig::default()
            .with_max_txn_duration_ms(0)
            .with_reindex_lag_ms(-5)
            .with_max_record_set_size(0)
            .with_max_transactions_per_commit(0);
        assert_eq!(config.max_txn_duration_ms, 1);
        assert_eq!(config.reindex_lag_ms, 1);
        assert_eq!(config.max_record_set_size, 1);
        assert_eq!(config.max_transactions_per_commit, 1);
    }

    #[test]
    fn test_recovery_builders() {
        let config = RecoveryConfig::default()
            .with_mode(RecoveryMode::Full)
            .with_stop_on_error(false)
            .with_lock_server(true)
            .with_max_transactions_per_iteration(50);
        assert_eq!(config.mode, RecoveryMode::Full);
        assert!(!config.stop_on_error);
        assert!(config.lock_server);
        assert_eq!(config.max_transactions_per_iteration, 50);
    }
}
