//! Error types for the processing engine

use std::fmt;

use conductor_raft::RaftError;
use conductor_state::StateError;
use conductor_storage::StorageError;
use conductor_transport::MemberId;
use thiserror::Error;

use crate::applier::ApplyError;
use crate::processor::ProcessingError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, Error>;

/// Main error type of the engine
#[derive(Debug, Error)]
pub struct Error {
    /// Error kind
    kind: ErrorKind,
    /// Error context
    context: ErrorContext,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, context: ErrorContext) -> Self {
        Self { kind, context }
    }

    /// Create error with string context
    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: ErrorContext::Message(context.into()),
        }
    }

    /// Create error wrapping a source error
    pub fn chain(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            context: ErrorContext::Chain {
                message: message.into(),
                source: Box::new(source),
            },
        }
    }

    /// Get error kind
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Get error context
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::NotFound, what)
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::InvalidState, msg)
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Timeout, msg)
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Codec, msg)
    }

    /// Create a shutdown error
    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Shutdown, msg)
    }

    /// Create a not leader error
    pub fn not_leader(msg: impl Into<String>, current_leader: Option<MemberId>) -> Self {
        Self {
            kind: ErrorKind::NotLeader,
            context: ErrorContext::Leadership {
                message: msg.into(),
                current_leader,
            },
        }
    }

    /// Check if this is a not-leader error
    pub fn is_not_leader(&self) -> bool {
        matches!(self.kind, ErrorKind::NotLeader)
    }

    /// Get the current leader from a not-leader error
    pub fn get_leader(&self) -> Option<&MemberId> {
        match &self.context {
            ErrorContext::Leadership { current_leader, .. } => current_leader.as_ref(),
            _ => None,
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient | ErrorKind::Timeout)
    }

    /// Whether the partition cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Storage
                | ErrorKind::State
                | ErrorKind::Codec
                | ErrorKind::Validation
                | ErrorKind::Fatal
                | ErrorKind::Internal
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            ErrorContext::Message(msg) => write!(f, "{}: {}", self.kind, msg),
            ErrorContext::Chain { message, source } => {
                write!(f, "{}: {} (caused by: {})", self.kind, message, source)
            }
            ErrorContext::Leadership {
                message,
                current_leader,
            } => {
                if let Some(leader) = current_leader {
                    write!(f, "{}: {} (current leader: {})", self.kind, message, leader)
                } else {
                    write!(f, "{}: {} (no known leader)", self.kind, message)
                }
            }
        }
    }
}

/// Error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resource not found
    NotFound,
    /// Invalid state for operation
    InvalidState,
    /// A retry may succeed
    Transient,
    /// Operation timed out
    Timeout,
    /// Log storage error
    Storage,
    /// State store error
    State,
    /// Replication error
    Replication,
    /// Encoding or decoding failed
    Codec,
    /// Configuration error
    Configuration,
    /// An entry was refused by the log
    Validation,
    /// Processing cannot continue
    Fatal,
    /// Not the leader
    NotLeader,
    /// The component is shutting down
    Shutdown,
    /// Internal error
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::InvalidState => write!(f, "Invalid state"),
            ErrorKind::Transient => write!(f, "Transient failure"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::Storage => write!(f, "Storage error"),
            ErrorKind::State => write!(f, "State error"),
            ErrorKind::Replication => write!(f, "Replication error"),
            ErrorKind::Codec => write!(f, "Codec error"),
            ErrorKind::Configuration => write!(f, "Configuration error"),
            ErrorKind::Validation => write!(f, "Validation error"),
            ErrorKind::Fatal => write!(f, "Fatal error"),
            ErrorKind::NotLeader => write!(f, "Not the leader"),
            ErrorKind::Shutdown => write!(f, "Shut down"),
            ErrorKind::Internal => write!(f, "Internal error"),
        }
    }
}

/// Error context
#[derive(Debug)]
pub enum ErrorContext {
    /// Simple message
    Message(String),
    /// Error chain with source
    Chain {
        /// Error message
        message: String,
        /// Source error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Leadership error with info
    Leadership {
        /// Error message
        message: String,
        /// Current leader if known
        current_leader: Option<MemberId>,
    },
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        let kind = if err.is_transient() {
            ErrorKind::Transient
        } else {
            ErrorKind::Storage
        };
        Self::chain(kind, "Log storage error", err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        let kind = if err.is_transient() {
            ErrorKind::Transient
        } else {
            ErrorKind::State
        };
        Self::chain(kind, "State store error", err)
    }
}

impl From<RaftError> for Error {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { leader } => Self::not_leader("Replication refused", leader),
            RaftError::Shutdown => Self::shutdown("Raft server stopped"),
            RaftError::Validation(e) => Self::chain(ErrorKind::Validation, "Entry refused", e),
            e if e.is_transient() => Self::chain(ErrorKind::Transient, "Replication failed", e),
            e => Self::chain(ErrorKind::Replication, "Replication failed", e),
        }
    }
}

impl From<ProcessingError> for Error {
    fn from(err: ProcessingError) -> Self {
        match err {
            ProcessingError::State(e) => e.into(),
            e if e.is_transient() => Self::chain(ErrorKind::Transient, "Processor failed", e),
            e => Self::chain(ErrorKind::Fatal, "Processor failed", e),
        }
    }
}

impl From<ApplyError> for Error {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::State(e) => e.into(),
            e @ ApplyError::Transient(_) => {
                Self::chain(ErrorKind::Transient, "Event applier failed", e)
            }
            e @ ApplyError::Fatal(_) => Self::chain(ErrorKind::Fatal, "Event applier failed", e),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::chain(ErrorKind::Internal, "Task join error", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_are_classified() {
        let transient: Error = StorageError::Backend("disk busy".to_string()).into();
        assert!(transient.is_transient());
        assert!(!transient.is_fatal());

        let corrupted: Error = StorageError::Corrupted {
            index: 3,
            reason: "checksum mismatch".to_string(),
        }
        .into();
        assert!(corrupted.is_fatal());
        assert!(corrupted.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_not_leader_keeps_leader_hint() {
        let err: Error = RaftError::NotLeader {
            leader: Some(MemberId::new("b")),
        }
        .into();
        assert!(err.is_not_leader());
        assert_eq!(err.get_leader(), Some(&MemberId::new("b")));
        assert!(err.to_string().contains("current leader: b"));
    }

    #[test]
    fn test_processing_errors_keep_their_class() {
        let err: Error = ProcessingError::Transient("lock".to_string()).into();
        assert!(err.is_transient());

        let err: Error = ProcessingError::Fatal("broken".to_string()).into();
        assert!(err.is_fatal());
    }
}
