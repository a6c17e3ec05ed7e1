//! RocksDB configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for RocksDB storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDbConfig {
    /// Path to the RocksDB database
    pub path: PathBuf,

    /// Fsync the WAL on every write
    pub sync_writes: bool,

    /// Block cache size for metadata column families, in MB
    pub metadata_cache_mb: u64,
}

impl RocksDbConfig {
    /// Create a new configuration with the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: true,
            metadata_cache_mb: 64,
        }
    }

    /// Disable WAL fsync, trading durability for throughput
    pub fn without_sync(mut self) -> Self {
        self.sync_writes = false;
        self
    }
}
