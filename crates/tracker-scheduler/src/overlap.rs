//! What to do when a job fires while its previous run is still active.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OverlapPolicy {
    /// Drop the firing and record it as skipped.
    #[default]
    Skip,

    /// Start another run alongside the active one.
    ///
    /// The tracker refuses to run twice anyway (it reports `Busy`), so this
    /// only costs a wasted wake-up.
    Concurrent,
}

/// Per-job running flag.
pub struct OverlapGuard {
    is_running: Arc<AtomicBool>,
    skipped: AtomicU64,
    policy: OverlapPolicy,
}

impl OverlapGuard {
    pub fn new(policy: OverlapPolicy) -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            skipped: AtomicU64::new(0),
            policy,
        }
    }

    /// Claim the job for one run. `None` means the firing is skipped.
    pub fn try_acquire(&self) -> Option<RunGuard> {
        match self.policy {
            OverlapPolicy::Skip => {
                if self
                    .is_running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    Some(RunGuard {
                        flag: Some(self.is_running.clone()),
                    })
                } else {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
            OverlapPolicy::Concurrent => Some(RunGuard { flag: None }),
        }
    }

    /// Only meaningful under `Skip`.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Firings dropped since creation.
    pub fn skipped_count(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }
}

/// Clears the running flag on drop, including when the job panics.
pub struct RunGuard {
    flag: Option<Arc<AtomicBool>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(flag) = &self.flag {
            flag.store(false, Ordering::SeqCst);
        }
    }
}
