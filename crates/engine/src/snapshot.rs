//! Persisted state snapshots of a partition.
//!
//! The latest snapshot is kept in the metadata map of the partition's log
//! namespace, next to raft's persistent state.

use conductor_state::{StateSnapshot, StateView};
use conductor_storage::{BlockLog, StorageAdaptor};
use tracing::info;

use crate::error::EngineResult;

const SNAPSHOT_KEY: &str = "snapshot";

/// Stores and loads the latest snapshot of one partition.
#[derive(Debug)]
pub struct SnapshotStore<S> {
    log: BlockLog<S>,
}

impl<S> Clone for SnapshotStore<S> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
        }
    }
}

impl<S: StorageAdaptor> SnapshotStore<S> {
    /// Snapshots of the partition owning `log`
    pub fn new(log: BlockLog<S>) -> Self {
        Self { log }
    }

    /// Take a snapshot of `state` and make it the latest
    pub async fn persist(&self, state: &StateView) -> EngineResult<StateSnapshot> {
        let snapshot = state.snapshot()?;
        self.log
            .storage()
            .set_metadata(self.log.namespace(), SNAPSHOT_KEY, snapshot.encode()?)
            .await?;

        info!(
            namespace = %self.log.namespace(),
            last_processed = snapshot.position.last_processed_position,
            entries = snapshot.entries.len(),
            "Persisted snapshot"
        );
        Ok(snapshot)
    }

    /// The latest snapshot, if one was ever taken
    pub async fn latest(&self) -> EngineResult<Option<StateSnapshot>> {
        let raw = self
            .log
            .storage()
            .get_metadata(self.log.namespace(), SNAPSHOT_KEY)
            .await?;
        Ok(raw.map(|bytes| StateSnapshot::decode(&bytes)).transpose()?)
    }
}
