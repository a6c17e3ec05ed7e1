//! Error types for the state store

use thiserror::Error;

/// Result type for state operations
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised by the state store
#[derive(Debug, Error)]
pub enum StateError {
    /// The backend failed to read or write
    #[error("State backend error: {0}")]
    Backend(String),

    /// A value could not be serialized
    #[error("Failed to encode value: {0}")]
    Encode(String),

    /// A stored value could not be deserialized
    #[error("Failed to decode value in column family {cf}: {reason}")]
    Decode {
        /// Column family of the value
        cf: String,
        /// Decoder message
        reason: String,
    },

    /// The store was written by a newer build
    #[error("Unsupported state schema version {found} (supported up to {supported})")]
    UnsupportedSchema {
        /// Version found in the store
        found: u32,
        /// Highest version this build understands
        supported: u32,
    },

    /// The partition id does not fit into the bits keys reserve for it
    #[error("Partition id {0} exceeds the maximum of {max}", max = crate::MAX_PARTITION_ID)]
    PartitionOutOfRange(u32),

    /// The key space of a partition is used up
    #[error("Key space of partition {0} exhausted")]
    KeySpaceExhausted(u32),
}

impl StateError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::Backend(_))
    }
}
