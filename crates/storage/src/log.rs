//! Index-addressed log storage abstraction
//!
//! Backends store indexed byte sequences per namespace and know nothing
//! about blocks, terms or positions. Indexes start at 1 and are dense:
//! the log layer above only ever appends at `last_index + 1`.
//!
//! Each namespace also carries a small metadata map, used for raft's
//! persistent term and vote and for partition snapshots.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Display;
use tokio_stream::Stream;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Storage backend error
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A stored block failed to decode or its checksum did not match
    #[error("Corrupted block at index {index}: {reason}")]
    Corrupted {
        /// Index of the unreadable entry
        index: u64,
        /// What was wrong with it
        reason: String,
    },

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Invalid value format
    #[error("Invalid value format: {0}")]
    InvalidValue(String),

    /// A write did not land directly after the current tail
    #[error("Out of order write: expected index {expected}, got {actual}")]
    OutOfOrder {
        /// The index the log expected next
        expected: u64,
        /// The index that was offered
        actual: u64,
    },

    /// Committed entries cannot be truncated
    #[error("Cannot truncate after index {index}: entries up to {committed} are committed")]
    TruncateCommitted {
        /// Requested truncation point
        index: u64,
        /// Current commit index
        committed: u64,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Namespace not found
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Operation not supported
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// The reader was closed
    #[error("Reader is closed")]
    ReaderClosed,

    /// The appender was shut down before the write completed
    #[error("Appender is closed")]
    AppenderClosed,
}

impl StorageError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend(_) | StorageError::Io(_))
    }
}

/// A namespace for organizing data
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorageNamespace(String);

impl StorageNamespace {
    /// Create a new storage namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the namespace as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StorageNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log storage trait - stores indexed byte sequences
#[async_trait]
pub trait LogStorage: Clone + Send + Sync + 'static {
    /// Atomically append entries (one or more)
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()>;

    /// Get the current bounds of the log (first_index, last_index)
    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>>;

    /// Remove all entries up to and including the given index
    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()>;

    /// Read a range of entries [start, end)
    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>>;

    /// Remove all entries after the given index
    async fn truncate_after(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()>;

    /// Read a metadata value of the namespace
    async fn get_metadata(
        &self,
        namespace: &StorageNamespace,
        key: &str,
    ) -> StorageResult<Option<Bytes>>;

    /// Durably write a metadata value of the namespace
    async fn set_metadata(
        &self,
        namespace: &StorageNamespace,
        key: &str,
        value: Bytes,
    ) -> StorageResult<()>;
}

/// Log storage trait that supports streaming reads
/// This trait allows storage backends to provide optimized streaming
#[async_trait]
pub trait LogStorageStreaming: LogStorage {
    /// Stream entries from a range [start, end)
    ///
    /// Returns a stream of (index, data) pairs. The stream may yield errors inline.
    /// If end is None, streams until the last available entry.
    async fn stream_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: Option<u64>,
    ) -> StorageResult<Box<dyn Stream<Item = StorageResult<(u64, Bytes)>> + Send + Unpin>>;
}

/// Implement LogStorage for Arc<T> where T: LogStorage
#[async_trait]
impl<T: LogStorage> LogStorage for std::sync::Arc<T> {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()> {
        (**self).append(namespace, entries).await
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        (**self).bounds(namespace).await
    }

    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        (**self).compact_before(namespace, index).await
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>> {
        (**self).read_range(namespace, start, end).await
    }

    async fn truncate_after(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        (**self).truncate_after(namespace, index).await
    }

    async fn get_metadata(
        &self,
        namespace: &StorageNamespace,
        key: &str,
    ) -> StorageResult<Option<Bytes>> {
        (**self).get_metadata(namespace, key).await
    }

    async fn set_metadata(
        &self,
        namespace: &StorageNamespace,
        key: &str,
        value: Bytes,
    ) -> StorageResult<()> {
        (**self).set_metadata(namespace, key, value).await
    }
}

/// Implement LogStorageStreaming for Arc<T> where T: LogStorageStreaming
#[async_trait]
impl<T: LogStorageStreaming> LogStorageStreaming for std::sync::Arc<T> {
    async fn stream_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: Option<u64>,
    ) -> StorageResult<Box<dyn Stream<Item = StorageResult<(u64, Bytes)>> + Send + Unpin>> {
        (**self).stream_range(namespace, start, end).await
    }
}
