//! Key encoding for the storage layer.
//!
//! Checkpoint keys are `checkpoint:{job_name}` so that every checkpoint
//! sorts under a single prefix.

/// Prefix shared by all checkpoint keys.
pub const CHECKPOINT_PREFIX: &str = "checkpoint:";

/// Key for checkpoint entries
/// Format: checkpoint:{job_name}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointKey {
    /// Job name (e.g., "full_recovery")
    pub job_name: String,
}

impl CheckpointKey {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}{}", CHECKPOINT_PREFIX, self.job_name).into_bytes()
    }
}
