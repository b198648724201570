//! Durable state for the index tracker.
//!
//! RocksDB-backed storage for the little state the tracker keeps across
//! restarts. The index itself is the source of truth for what has been
//! indexed; this crate only holds resume points for long-running jobs
//! such as a full index rebuild.

pub mod column_families;
pub mod db;
pub mod error;
pub mod keys;

pub use db::Storage;
pub use error::StorageError;
pub use keys::CheckpointKey;
