//! Raft errors

use conductor_storage::StorageError;
use conductor_transport::{MemberId, TransportError};
use thiserror::Error;

use crate::ValidationError;

/// Result type for raft operations
pub type RaftResult<T> = Result<T, RaftError>;

/// Errors raised by the replication layer
#[derive(Debug, Error)]
pub enum RaftError {
    /// Only the leader accepts entries
    #[error("Not the leader (current leader: {leader:?})")]
    NotLeader {
        /// Leader known to this member, if any
        leader: Option<MemberId>,
    },

    /// The entry does not continue the log
    #[error("Entry rejected: {0}")]
    Validation(#[from] ValidationError),

    /// Log storage failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A message or persisted record could not be (de)serialized
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The server is shutting down
    #[error("Raft server is shut down")]
    Shutdown,
}

impl RaftError {
    /// Whether the caller should retry, possibly against another member
    pub fn is_transient(&self) -> bool {
        match self {
            RaftError::NotLeader { .. } | RaftError::Transport(_) => true,
            RaftError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}
