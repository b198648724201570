//! # tracker-types
//!
//! Shared domain types for the index transaction tracker.
//!
//! This crate defines the data structures exchanged between the node store,
//! the index and the reindexing engine:
//! - Transactions: committed units of change in the authoritative store
//! - Nodes: node and store references plus per-transaction change lists
//! - Presence: whether a transaction is observable in the index
//! - Settings: layered configuration for tracking and recovery
//!
//! ## Usage
//!
//! ```rust
//! use tracker_types::{Presence, TransactionRecord};
//!
//! let txn = TransactionRecord::new(7, Some(1_706_540_400_000), "txn-7");
//! assert!(txn.is_committed());
//! assert_eq!(Presence::Yes.to_string(), "yes");
//! ```

pub mod config;
pub mod error;
pub mod node;
pub mod presence;
pub mod transaction;

pub use config::{RecoveryMode, RecoverySettings, Settings, TrackingSettings};
pub use error::TrackerError;
pub use node::{ChildAssocRef, NodeChange, NodeRef, StoreRef};
pub use presence::Presence;
pub use transaction::{TimestampMs, TransactionRecord, TxnId};
