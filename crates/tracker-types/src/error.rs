//! Error types for the index tracker.

use thiserror::Error;

/// Unified error type for shared tracker types.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrackerError::Config("bad lag".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad lag");

        let err = TrackerError::InvalidInput("unknown recovery mode".to_string());
        assert_eq!(err.to_string(), "Invalid input: unknown recovery mode");
    }
}
