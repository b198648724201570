//! Retrying transaction execution.
//!
//! All reindex work runs inside a unit of work supplied by a
//! [`TransactionRunner`]. The runner retries transient conflicts and
//! surfaces every other failure to the caller unchanged.

use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use tracing::{debug, error, warn};

use crate::error::IndexingError;

/// How a unit of work should be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    pub read_only: bool,
    /// Start a fresh transaction even if the caller is already inside one
    pub requires_new: bool,
}

impl TransactionOptions {
    /// Read-only work in a fresh transaction, as used by reindex workers.
    pub fn read_only_new() -> Self {
        Self {
            read_only: true,
            requires_new: true,
        }
    }

    /// Read-only work that may join an existing transaction.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            requires_new: false,
        }
    }
}

/// Executes work inside a store transaction.
pub trait TransactionRunner: Send + Sync {
    /// Run `work`, retrying it on transient conflicts. The closure may be
    /// called more than once and must start from scratch each time.
    fn run(
        &self,
        options: TransactionOptions,
        work: &mut dyn FnMut() -> Result<(), IndexingError>,
    ) -> Result<(), IndexingError>;
}

/// Runner that retries [`IndexingError::Conflict`] with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryingTransactionRunner {
    max_retries: u32,
    initial_interval: Duration,
    max_interval: Duration,
}

impl Default for RetryingTransactionRunner {
    fn default() -> Self {
        Self {
            max_retries: 20,
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(2),
        }
    }
}

impl RetryingTransactionRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }
}

impl TransactionRunner for RetryingTransactionRunner {
    fn run(
        &self,
        options: TransactionOptions,
        work: &mut dyn FnMut() -> Result<(), IndexingError>,
    ) -> Result<(), IndexingError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut retries = 0;
        loop {
            match work() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    if retries >= self.max_retries {
                        error!(error = %e, retries, "Max retries exceeded");
                        return Err(e);
                    }
                    retries += 1;
                    match backoff.next_backoff() {
                        Some(duration) => {
                            warn!(
                                error = %e,
                                retry = retries,
                                read_only = options.read_only,
                                retry_in_ms = duration.as_millis() as u64,
                                "Transaction conflict, retrying"
                            );
                            std::thread::sleep(duration);
                        }
                        None => {
                            error!(error = %e, "Backoff exhausted");
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Transaction failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_runner(max_retries: u32) -> RetryingTransactionRunner {
        RetryingTransactionRunner::new()
            .with_max_retries(max_retries)
            .with_initial_interval(Duration::from_millis(1))
            .with_max_interval(Duration::from_millis(2))
    }

    #[test]
    fn test_conflicts_are_retried() {
        let runner = fast_runner(5);
        let mut attempts = 0;
        let result = runner.run(TransactionOptions::read_only_new(), &mut || {
            attempts += 1;
            if attempts < 3 {
                Err(IndexingError::Conflict("row version changed".to_string()))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_retries_are_bounded() {
        let runner = fast_runner(2);
        let mut attempts = 0;
        let result = runner.run(TransactionOptions::read_only(), &mut || {
            attempts += 1;
            Err(IndexingError::Conflict("always".to_string()))
        });
        assert!(matches!(result, Err(IndexingError::Conflict(_))));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let runner = fast_runner(5);
        let mut attempts = 0;
        let result = runner.run(TransactionOptions::read_only_new(), &mut || {
            attempts += 1;
            Err(IndexingError::Index("disk full".to_string()))
        });
        assert!(matches!(result, Err(IndexingError::Index(_))));
        assert_eq!(attempts, 1);
    }
}
