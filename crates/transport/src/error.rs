//! Transport errors

use thiserror::Error;

/// Errors raised while moving messages between members
#[derive(Debug, Error)]
pub enum TransportError {
    /// No route to the recipient
    #[error("Member {0} is unreachable")]
    Unreachable(String),

    /// The message exceeds the configured size limit
    #[error("Message of {size} bytes exceeds the limit of {limit} bytes")]
    MessageTooLarge {
        /// Size of the rejected message
        size: usize,
        /// Configured maximum
        limit: usize,
    },

    /// The transport was shut down
    #[error("Transport is shut down")]
    Shutdown,

    /// Anything else
    #[error("Transport error: {0}")]
    Other(String),
}
