//! The processing position marker.

use conductor_storage::{NO_POSITION, Position};
use serde::{Deserialize, Serialize};

use crate::{Column, ColumnFamily, StateRead, StateResult, Transaction};

const MARKER: Column<str, ProcessingPosition> = Column::new(ColumnFamily::META);
const MARKER_KEY: &str = "processing_position";

/// How far the stream processor got.
///
/// Written in the same transaction as the state changes of the batch it
/// describes, so state and marker never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingPosition {
    /// Position of the last command whose effects are in state
    pub last_processed_position: Position,
    /// Highest position whose event has been applied or written by the processor
    pub last_written_position: Position,
}

impl Default for ProcessingPosition {
    fn default() -> Self {
        Self {
            last_processed_position: NO_POSITION,
            last_written_position: NO_POSITION,
        }
    }
}

impl ProcessingPosition {
    /// Load the marker, defaulting to "nothing processed"
    pub fn load<R: StateRead + ?Sized>(state: &R) -> StateResult<Self> {
        Ok(MARKER.get(state, MARKER_KEY)?.unwrap_or_default())
    }

    /// Stage the marker in `txn`
    pub fn store(&self, txn: &mut Transaction<'_>) -> StateResult<()> {
        MARKER.put(txn, MARKER_KEY, self)
    }

    /// Position replay has to seek to.
    pub fn replay_start(&self) -> Position {
        self.last_processed_position
            .min(self.last_written_position)
            .max(NO_POSITION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStateBackend, StateStore};

    #[test]
    fn test_marker_defaults_to_no_position() {
        let store = StateStore::open(MemoryStateBackend::new()).unwrap();
        let marker = ProcessingPosition::load(&store).unwrap();
        assert_eq!(marker, ProcessingPosition::default());
        assert_eq!(marker.replay_start(), NO_POSITION);
    }

    #[test]
    fn test_marker_round_trips_through_transaction() {
        let store = StateStore::open(MemoryStateBackend::new()).unwrap();
        let marker = ProcessingPosition {
            last_processed_position: 10,
            last_written_position: 12,
        };

        let mut txn = store.transaction();
        marker.store(&mut txn).unwrap();
        txn.commit().unwrap();

        assert_eq!(ProcessingPosition::load(&store).unwrap(), marker);
        assert_eq!(marker.replay_start(), 10);
    }
}
