//! Generic transport abstraction for member-to-member messages
//!
//! The replication layer only needs to address a peer by its member id and
//! to receive a stream of envelopes. Concrete transports live in separate
//! crates.

pub mod error;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::pin::Pin;

pub use error::TransportError;

/// Identity of a partition member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Transport-level message envelope
#[derive(Debug, Clone)]
pub struct TransportEnvelope {
    /// Message type chosen by the sender
    pub message_type: String,
    /// The message payload
    pub payload: Bytes,
    /// The sender of the message
    pub sender: MemberId,
}

/// Transport trait for sending and receiving messages
///
/// Delivery is best effort: messages may be lost, delayed, duplicated or
/// reordered, and callers must tolerate all of it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The member this transport sends as
    fn local_member(&self) -> &MemberId;

    /// Send a message to a specific member
    async fn send_envelope(
        &self,
        recipient: &MemberId,
        payload: &Bytes,
        message_type: &str,
    ) -> Result<(), TransportError>;

    /// Get a stream of incoming message envelopes
    ///
    /// Only one stream receives any given envelope.
    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEnvelope> + Send>>;

    /// Shutdown the transport
    async fn shutdown(&self) -> Result<(), TransportError>;
}

/// Configuration for transports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum message size in bytes
    pub max_message_size: usize,
    /// Message queue size per member
    pub queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024, // 10MB
            queue_size: 1000,
        }
    }
}
