//! Storage manager handing out partition-scoped views of one adaptor
//!
//! Every partition gets its own namespace for the block log; raft metadata
//! and snapshots live in that namespace's metadata map.

use tracing::info;

use crate::{BlockLog, StorageAdaptor, StorageNamespace, StorageResult};

/// Opens partition logs on one storage adaptor
#[derive(Clone, Debug)]
pub struct StorageManager<S>
where
    S: StorageAdaptor,
{
    /// The storage adaptor
    adaptor: S,
}

impl<S> StorageManager<S>
where
    S: StorageAdaptor,
{
    /// Create a new storage manager
    pub fn new(adaptor: S) -> Self {
        Self { adaptor }
    }

    /// Namespace of a partition's block log
    pub fn partition_namespace(partition_id: u32) -> StorageNamespace {
        StorageNamespace::new(format!("partition-{partition_id}"))
    }

    /// Open the block log of a partition
    pub async fn open_partition_log(&self, partition_id: u32) -> StorageResult<BlockLog<S>> {
        let namespace = Self::partition_namespace(partition_id);
        info!(partition_id, namespace = %namespace, "Opening partition log");
        BlockLog::open(self.adaptor.clone(), namespace).await
    }
}
