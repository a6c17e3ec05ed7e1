//! Wire messages between raft members.

use bytes::Bytes;
use conductor_transport::MemberId;
use serde::{Deserialize, Serialize};

use crate::{RaftError, RaftResult};

/// Transport message type of every raft message
pub const RAFT_MESSAGE_TYPE: &str = "raft";

/// Messages exchanged by raft members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// A candidate asks for a vote
    VoteRequest {
        /// Candidate's term
        term: u64,
        /// The candidate
        candidate: MemberId,
        /// Index of the candidate's last entry
        last_index: u64,
        /// Term of the candidate's last entry
        last_term: u64,
    },
    /// Answer to a vote request
    VoteResponse {
        /// Voter's current term
        term: u64,
        /// Whether the vote was granted
        granted: bool,
    },
    /// The leader ships entries (or a heartbeat when empty)
    AppendRequest {
        /// Leader's term
        term: u64,
        /// The leader
        leader: MemberId,
        /// Index right before the first shipped entry
        prev_index: u64,
        /// Term of the entry at `prev_index`
        prev_term: u64,
        /// Encoded blocks for `prev_index + 1 ..`
        entries: Vec<Bytes>,
        /// Leader's commit index
        leader_commit: u64,
    },
    /// Answer to an append request
    AppendResponse {
        /// Follower's current term
        term: u64,
        /// Whether every shipped entry was accepted
        success: bool,
        /// On success the last matching index, otherwise the index the
        /// leader should resend after
        last_index: u64,
    },
}

impl RaftMessage {
    /// Serialize for the transport
    pub fn encode(&self) -> RaftResult<Bytes> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| RaftError::Codec(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    /// Deserialize a transport payload
    pub fn decode(data: &[u8]) -> RaftResult<Self> {
        ciborium::from_reader(data).map_err(|e| RaftError::Codec(e.to_string()))
    }

    /// Term carried by the message
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendRequest { term, .. }
            | RaftMessage::AppendResponse { term, .. } => *term,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_request_survives_the_wire() {
        let message = RaftMessage::AppendRequest {
            term: 3,
            leader: MemberId::new("a"),
            prev_index: 7,
            prev_term: 2,
            entries: vec![Bytes::from_static(b"\x01\x02"), Bytes::new()],
            leader_commit: 6,
        };
        let decoded = RaftMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.term(), 3);
    }

    #[test]
    fn test_garbage_is_a_codec_error() {
        assert!(matches!(
            RaftMessage::decode(b"\xff\xff"),
            Err(RaftError::Codec(_))
        ));
    }
}
