//! Serializable copies of the full state.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{ProcessingPosition, StateError, StateResult};

/// Full state at a processing position.
///
/// Replay after restoring a snapshot starts from
/// [`ProcessingPosition::replay_start`] of the embedded marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Schema version of the entries
    pub schema_version: u32,
    /// Processing marker at the time of the snapshot
    pub position: ProcessingPosition,
    /// Raw backend entries in key order
    pub entries: Vec<(Bytes, Bytes)>,
}

impl StateSnapshot {
    /// CBOR encoding of the snapshot
    pub fn encode(&self) -> StateResult<Bytes> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| StateError::Encode(e.to_string()))?;
        Ok(buf.into())
    }

    /// Decode a snapshot produced by [`StateSnapshot::encode`]
    pub fn decode(bytes: &[u8]) -> StateResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| StateError::Decode {
            cf: "snapshot".to_string(),
            reason: e.to_string(),
        })
    }
}
