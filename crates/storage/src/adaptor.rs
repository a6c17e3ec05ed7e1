//! Storage adaptor trait for implementing storage backends
//!
//! This trait defines the interface that storage implementations must provide
//! to back a partition's block log.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::{LogStorage, LogStorageStreaming, StorageResult};

/// Abstract interface for storage backends
///
/// Requires both plain and streaming log access, and adds lifecycle
/// operations that a partition invokes on shutdown.
#[async_trait]
pub trait StorageAdaptor:
    LogStorage + LogStorageStreaming + Debug + Send + Sync + Clone + 'static
{
    /// Gracefully shutdown the storage, ensuring all data is persisted
    async fn shutdown(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Get storage statistics (optional operation)
    /// Returns implementation-specific statistics about the storage
    async fn stats(&self) -> StorageResult<String> {
        Ok("No statistics available".to_string())
    }
}

#[async_trait]
impl<T: StorageAdaptor> StorageAdaptor for std::sync::Arc<T> {
    async fn shutdown(&self) -> StorageResult<()> {
        (**self).shutdown().await
    }

    async fn stats(&self) -> StorageResult<String> {
        (**self).stats().await
    }
}
