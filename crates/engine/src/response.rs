//! Routing command responses back to waiting requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::record::{Intent, Record, RecordType, RejectionType, ValueType};

/// What a client gets back for a command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    /// Key of the entity the command created or changed
    pub key: i64,
    /// `Event` when accepted, `CommandRejection` when refused
    pub record_type: RecordType,
    /// Value type
    pub value_type: ValueType,
    /// Resulting intent
    pub intent: Intent,
    /// Resulting value
    pub value: serde_json::Value,
    /// Set on rejections
    pub rejection_type: Option<RejectionType>,
    /// Set on rejections
    pub rejection_reason: Option<String>,
}

impl CommandResponse {
    /// Whether the command was refused
    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::CommandRejection
    }
}

/// A response waiting for its batch to become durable
#[derive(Debug, Clone)]
pub(crate) struct StagedResponse {
    pub(crate) request_id: u64,
    pub(crate) request_stream_id: u32,
    pub(crate) response: CommandResponse,
}

impl StagedResponse {
    /// Response to `command`, if the command carries a request
    pub(crate) fn for_command(command: &Record, response: CommandResponse) -> Option<Self> {
        Some(Self {
            request_id: command.request_id?,
            request_stream_id: command.request_stream_id?,
            response,
        })
    }
}

/// Requests submitted on this member that wait for a response.
///
/// Every registry has its own stream id; responses to commands submitted
/// elsewhere (on a former leader, say) carry a different one and are
/// dropped.
#[derive(Debug, Clone)]
pub struct ResponseRegistry {
    stream_id: u32,
    next_request_id: Arc<AtomicU64>,
    waiting: Arc<DashMap<u64, oneshot::Sender<CommandResponse>>>,
}

impl ResponseRegistry {
    /// Registry of the request stream `stream_id`
    pub fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            next_request_id: Arc::new(AtomicU64::new(1)),
            waiting: Arc::new(DashMap::new()),
        }
    }

    /// Stream id stamped on submitted commands
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Allocate a request id and the receiver its response arrives on
    pub fn register(&self) -> (u64, oneshot::Receiver<CommandResponse>) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(request_id, tx);
        (request_id, rx)
    }

    /// Forget a request that gave up waiting
    pub fn cancel(&self, request_id: u64) {
        self.waiting.remove(&request_id);
    }

    /// Number of requests waiting
    pub fn pending(&self) -> usize {
        self.waiting.len()
    }

    /// Hand a staged response to its request. Returns whether anybody
    /// received it.
    pub(crate) fn complete(&self, staged: StagedResponse) -> bool {
        if staged.request_stream_id != self.stream_id {
            return false;
        }

        match self.waiting.remove(&staged.request_id) {
            Some((_, tx)) => tx.send(staged.response).is_ok(),
            None => {
                debug!(request_id = staged.request_id, "No request waiting for response");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response() -> CommandResponse {
        CommandResponse {
            key: 7,
            record_type: RecordType::Event,
            value_type: ValueType::new("COUNTER"),
            intent: Intent::new("CREATED"),
            value: json!({}),
            rejection_type: None,
            rejection_reason: None,
        }
    }

    #[tokio::test]
    async fn test_response_reaches_registered_request() {
        let registry = ResponseRegistry::new(9);
        let (request_id, rx) = registry.register();

        let staged = StagedResponse {
            request_id,
            request_stream_id: 9,
            response: response(),
        };
        assert!(registry.complete(staged));
        assert_eq!(rx.await.unwrap().key, 7);
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_foreign_stream_is_ignored() {
        let registry = ResponseRegistry::new(1);
        let (request_id, _rx) = registry.register();

        let staged = StagedResponse {
            request_id,
            request_stream_id: 2,
            response: response(),
        };
        assert!(!registry.complete(staged));
        assert_eq!(registry.pending(), 1);
    }
}
