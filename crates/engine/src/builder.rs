//! Partition builder

use std::sync::Arc;

use conductor_raft::{RaftConfig, RaftHandle, RaftResult, RaftServer};
use conductor_state::{ExporterPositions, ProcessingPosition, StateStore};
use conductor_storage::{BlockLog, StorageAdaptor};
use conductor_transport::{MemberId, Transport};
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::applier::EventApplierRegistry;
use crate::config::PartitionConfig;
use crate::error::{EngineResult, Error, ErrorKind};
use crate::exporter::{Exporter, ExporterDirector};
use crate::log_stream::{LogStream, LogStreamWriter, RaftWriter, StandaloneWriter};
use crate::partition::Partition;
use crate::processor::ProcessorRegistry;
use crate::response::ResponseRegistry;
use crate::snapshot::SnapshotStore;
use crate::startup::{StartupCondition, tolerate};
use crate::stream_processor::{self, StreamProcessorParts};

type RaftStarter<S> =
    Box<dyn FnOnce(BlockLog<S>, RaftConfig) -> BoxFuture<'static, RaftResult<RaftHandle>> + Send>;

/// Partition builder
pub struct PartitionBuilder<S: StorageAdaptor> {
    /// Configuration
    config: PartitionConfig,

    /// Log of the partition
    log: Option<BlockLog<S>>,

    /// State store of the partition
    state: Option<StateStore>,

    processors: ProcessorRegistry,
    appliers: EventApplierRegistry,
    exporters: Vec<Box<dyn Exporter>>,

    /// Starts the raft member, if the partition is replicated
    raft: Option<RaftStarter<S>>,
}

impl<S: StorageAdaptor> Default for PartitionBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: StorageAdaptor> PartitionBuilder<S> {
    /// Create a new partition builder
    pub fn new() -> Self {
        Self {
            config: PartitionConfig::default(),
            log: None,
            state: None,
            processors: ProcessorRegistry::new(),
            appliers: EventApplierRegistry::new(),
            exporters: Vec::new(),
            raft: None,
        }
    }

    /// Set configuration
    pub fn with_config(mut self, config: PartitionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the log
    pub fn with_log(mut self, log: BlockLog<S>) -> Self {
        self.log = Some(log);
        self
    }

    /// Set the state store
    pub fn with_state(mut self, state: StateStore) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the command processors
    pub fn with_processors(mut self, processors: ProcessorRegistry) -> Self {
        self.processors = processors;
        self
    }

    /// Set the event appliers
    pub fn with_appliers(mut self, appliers: EventApplierRegistry) -> Self {
        self.appliers = appliers;
        self
    }

    /// Add an exporter
    pub fn with_exporter(mut self, exporter: impl Exporter) -> Self {
        self.exporters.push(Box::new(exporter));
        self
    }

    /// Replicate the log through raft as `member_id` of `members`.
    ///
    /// Without this the partition runs standalone and every append is
    /// committed as soon as it is durable.
    pub fn with_raft<T: Transport>(
        mut self,
        member_id: MemberId,
        members: Vec<MemberId>,
        transport: Arc<T>,
    ) -> Self {
        self.raft = Some(Box::new(move |log, config| {
            RaftServer::start(member_id, members, log, transport, config).boxed()
        }));
        self
    }

    /// Build and start the partition
    pub async fn build(self) -> EngineResult<Partition<S>> {
        let config = self.config;
        config.validate()?;

        let log = self
            .log
            .ok_or_else(|| Error::with_context(ErrorKind::Configuration, "Log not set"))?;
        let state = self
            .state
            .ok_or_else(|| Error::with_context(ErrorKind::Configuration, "State store not set"))?;
        if self.processors.is_empty() {
            warn!(partition_id = config.partition_id, "No command processors registered");
        }

        let snapshots = SnapshotStore::new(log.clone());
        restore_snapshot(&snapshots, &state, &config).await?;
        check_exporter_positions(&state, &self.exporters, &config)?;

        // Raft starts before the processor so that its status is there to
        // observe; a standalone writer commits everything already stored.
        let raft = match self.raft {
            Some(start) => Some(start(log.clone(), config.raft.clone()).await?),
            None => None,
        };
        let writer: Arc<dyn LogStreamWriter> = match &raft {
            Some(raft) => Arc::new(RaftWriter::new(raft.clone())),
            None => Arc::new(StandaloneWriter::start(log.clone())),
        };
        let log_stream = LogStream::new(config.partition_id, writer);
        let responses = ResponseRegistry::new(rand::random());

        let processor = stream_processor::spawn(StreamProcessorParts {
            partition_id: config.partition_id,
            log: log.clone(),
            state: state.clone(),
            processors: self.processors,
            appliers: self.appliers,
            log_stream: log_stream.clone(),
            responses: responses.clone(),
            config: config.processor.clone(),
            leadership: raft.as_ref().map(RaftHandle::role_changes),
        })?;

        let exporters = ExporterDirector::start(
            log.clone(),
            state.clone(),
            self.exporters,
            config.exporter.clone(),
        );

        info!(
            partition_id = config.partition_id,
            replicated = raft.is_some(),
            exporters = exporters.exporter_ids().len(),
            "Partition started"
        );

        Ok(Partition::new(
            config,
            log,
            state.view(),
            snapshots,
            log_stream,
            responses,
            processor,
            exporters,
            raft,
        ))
    }
}

/// Restore the latest snapshot if it is ahead of the state
async fn restore_snapshot<S: StorageAdaptor>(
    snapshots: &SnapshotStore<S>,
    state: &StateStore,
    config: &PartitionConfig,
) -> EngineResult<()> {
    let Some(snapshot) = snapshots.latest().await? else {
        return tolerate(
            StartupCondition::MissingSnapshot,
            &config.ignorable_startup_conditions,
            "state is rebuilt from the log",
        );
    };

    let current = ProcessingPosition::load(state)?;
    if snapshot.position.last_processed_position > current.last_processed_position {
        state.restore(&snapshot)?;
    } else {
        info!(
            snapshot = snapshot.position.last_processed_position,
            state = current.last_processed_position,
            "State is ahead of the latest snapshot"
        );
    }
    Ok(())
}

fn check_exporter_positions(
    state: &StateStore,
    exporters: &[Box<dyn Exporter>],
    config: &PartitionConfig,
) -> EngineResult<()> {
    for exporter in exporters {
        if ExporterPositions::get(state, exporter.id())?.is_none() {
            tolerate(
                StartupCondition::MissingExporterPosition,
                &config.ignorable_startup_conditions,
                exporter.id(),
            )?;
        }
    }
    Ok(())
}
