//! A running partition: log, state, stream processor and exporters.

use std::fmt;

use conductor_raft::RaftHandle;
use conductor_state::{
    ExporterPositions, MemoryStateBackend, StateSnapshot, StateStore, StateView,
};
use conductor_storage::{BlockLog, NO_POSITION, Position, StorageAdaptor};
use tracing::{debug, info};

use crate::config::PartitionConfig;
use crate::error::{EngineResult, Error, ErrorKind};
use crate::exporter::ExporterDirector;
use crate::log_stream::LogStream;
use crate::record::Record;
use crate::response::{CommandResponse, ResponseRegistry};
use crate::snapshot::SnapshotStore;
use crate::stream_processor::StreamProcessorHandle;

/// A started partition, built by [`crate::PartitionBuilder`].
pub struct Partition<S> {
    config: PartitionConfig,
    log: BlockLog<S>,
    state: StateView,
    snapshots: SnapshotStore<S>,
    log_stream: LogStream,
    responses: ResponseRegistry,
    processor: StreamProcessorHandle,
    exporters: ExporterDirector,
    raft: Option<RaftHandle>,
}

impl<S> fmt::Debug for Partition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("partition_id", &self.config.partition_id)
            .field("processor", &self.processor)
            .field("replicated", &self.raft.is_some())
            .finish()
    }
}

impl<S: StorageAdaptor> Partition<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: PartitionConfig,
        log: BlockLog<S>,
        state: StateView,
        snapshots: SnapshotStore<S>,
        log_stream: LogStream,
        responses: ResponseRegistry,
        processor: StreamProcessorHandle,
        exporters: ExporterDirector,
        raft: Option<RaftHandle>,
    ) -> Self {
        Self {
            config,
            log,
            state,
            snapshots,
            log_stream,
            responses,
            processor,
            exporters,
            raft,
        }
    }

    /// Partition id
    pub fn partition_id(&self) -> u32 {
        self.config.partition_id
    }

    /// Handle to the stream processor
    pub fn processor(&self) -> &StreamProcessorHandle {
        &self.processor
    }

    /// Read-only view of the partition's state
    pub fn state(&self) -> &StateView {
        &self.state
    }

    /// The partition's log
    pub fn log(&self) -> &BlockLog<S> {
        &self.log
    }

    /// The raft member, for replicated partitions
    pub fn raft(&self) -> Option<&RaftHandle> {
        self.raft.as_ref()
    }

    /// Append `command` and wait for the response to it.
    ///
    /// Fails with a not-leader error on followers and with a timeout if the
    /// command is not processed within the request timeout.
    pub async fn submit(&self, mut command: Record) -> EngineResult<CommandResponse> {
        if !command.is_command() {
            return Err(Error::with_context(
                ErrorKind::Validation,
                "Only commands can be submitted",
            ));
        }
        if let Some(raft) = &self.raft {
            if !raft.is_leader() {
                return Err(Error::not_leader("Partition is not leader", raft.leader()));
            }
        }

        let (request_id, response) = self.responses.register();
        command.source_record_position = NO_POSITION;
        command.request_id = Some(request_id);
        command.request_stream_id = Some(self.responses.stream_id());

        if let Err(e) = self.log_stream.write_batch(vec![command]).await {
            self.responses.cancel(request_id);
            return Err(match (&self.raft, e.is_not_leader()) {
                (Some(raft), true) => Error::not_leader("Partition is not leader", raft.leader()),
                _ => e,
            });
        }

        match tokio::time::timeout(self.config.request_timeout, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::shutdown("Partition closed before responding")),
            Err(_) => {
                self.responses.cancel(request_id);
                Err(Error::timeout(format!(
                    "No response to request {request_id} within {:?}",
                    self.config.request_timeout
                )))
            }
        }
    }

    /// Persist a snapshot of the current state
    pub async fn take_snapshot(&self) -> EngineResult<StateSnapshot> {
        self.snapshots.persist(&self.state).await
    }

    /// The latest persisted snapshot
    pub async fn latest_snapshot(&self) -> EngineResult<Option<StateSnapshot>> {
        self.snapshots.latest().await
    }

    /// Drop log blocks that neither replay nor any exporter still needs.
    ///
    /// Blocks are kept from the replay start of the latest snapshot and from
    /// the lowest acknowledged exporter position onwards, whichever is lower.
    /// Without a snapshot nothing is compacted. Returns the bound used.
    pub async fn compact(&self) -> EngineResult<Option<Position>> {
        let Some(snapshot) = self.snapshots.latest().await? else {
            debug!(partition_id = self.partition_id(), "No snapshot, skipping compaction");
            return Ok(None);
        };

        let mut bound = snapshot.position.replay_start();
        // a restored snapshot brings its own exporter positions back
        let restored = StateStore::open(MemoryStateBackend::new())?;
        restored.restore(&snapshot)?;
        for acknowledged in [
            ExporterPositions::lowest(&self.state)?,
            ExporterPositions::lowest(&restored)?,
        ]
        .into_iter()
        .flatten()
        {
            bound = bound.min(acknowledged + 1);
        }
        for id in self.exporters.exporter_ids() {
            if ExporterPositions::get(&self.state, id)?.is_none() {
                debug!(exporter = %id, "Exporter has not acknowledged, skipping compaction");
                return Ok(None);
            }
        }

        if bound <= 0 {
            return Ok(None);
        }
        self.log.compact_below_position(bound).await?;
        info!(
            partition_id = self.partition_id(),
            bound,
            first_index = self.log.first_index(),
            "Compacted log"
        );
        Ok(Some(bound))
    }

    /// Stop processing and exporting, then leave the raft group
    pub async fn close(&self) {
        self.processor.close().await;
        self.exporters.close().await;
        self.log_stream.disable().await;
        if let Some(raft) = &self.raft {
            raft.shutdown().await;
        }
        info!(partition_id = self.partition_id(), "Partition closed");
    }
}
