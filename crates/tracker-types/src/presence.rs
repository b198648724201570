//! Presence of a transaction in the index.

use serde::{Deserialize, Serialize};

/// Whether a transaction's effects are observable through the index.
///
/// Computed on demand and never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// The index reflects the transaction (or there was nothing to index)
    Yes,
    /// The index is provably behind the transaction
    No,
    /// The available evidence cannot decide either way
    Indeterminate,
}

impl Presence {
    /// True for `No` only; `Indeterminate` is not evidence of a missing txn.
    pub fn is_missing(&self) -> bool {
        matches!(self, Presence::No)
    }
}

impl std::fmt::Display for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Presence::Yes => write!(f, "yes"),
            Presence::No => write!(f, "no"),
            Presence::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_display() {
        assert_eq!(Presence::Yes.to_string(), "yes");
        assert_eq!(Presence::No.to_string(), "no");
        assert_eq!(Presence::Indeterminate.to_string(), "indeterminate");
    }

    #[test]
    fn test_presence_serialization() {
        let json = serde_json::to_string(&Presence::Indeterminate).unwrap();
        assert_eq!(json, "\"indeterminate\"");
        let back: Presence = serde_json::from_str("\"no\"").unwrap();
        assert!(back.is_missing());
    }
}
