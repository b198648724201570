//! Column family definitions for RocksDB.

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for background job checkpoints
pub const CF_CHECKPOINTS: &str = "checkpoints";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[CF_CHECKPOINTS];

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    ALL_CF_NAMES
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
        .collect()
}
