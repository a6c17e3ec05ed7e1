//! Deterministic stream processing on top of a replicated log
//!
//! A partition turns committed commands into follow-up records and
//! applies the resulting events to its embedded state:
//! - Command processors decide, event appliers mutate state
//! - Every processed command ends in one atomic batch and one transaction
//! - Replay rebuilds the same state from the log alone
//! - Exporters follow the committed log and bound its compaction

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::result_large_err)]

/// Event appliers
pub mod applier;

mod backoff;
mod batch;

/// Partition builder
pub mod builder;

/// Configuration types
pub mod config;

/// Processing context handed to command processors
pub mod context;

/// Error types
pub mod error;

/// Exporters
pub mod exporter;

/// Sequenced writes to the log
pub mod log_stream;

/// Running partitions
pub mod partition;

/// Command processors
pub mod processor;

/// Records and their encoding
pub mod record;

/// Responses to submitted commands
pub mod response;

/// State snapshots
pub mod snapshot;

/// Startup conditions
pub mod startup;

/// The stream processor
pub mod stream_processor;

pub use {
    applier::{ApplyError, EventApplier, EventApplierRegistry},
    builder::PartitionBuilder,
    config::{ExporterConfig, PartitionConfig, StreamProcessorConfig},
    context::{PostCommitTask, ProcessingContext, TaskError},
    error::{EngineResult, Error, ErrorContext, ErrorKind},
    exporter::{Exporter, ExporterController, ExporterDirector, ExporterError, RecordCursor},
    log_stream::{LogStream, LogStreamWriter, RaftWriter, StandaloneWriter},
    partition::Partition,
    processor::{CommandProcessor, ProcessingError, ProcessorRegistry},
    record::{Intent, Record, RecordType, RejectionType, ValueType, decode_records},
    response::{CommandResponse, ResponseRegistry},
    snapshot::SnapshotStore,
    startup::{IGNORABLE_STARTUP_CONDITIONS, StartupCondition},
    stream_processor::{Phase, StreamProcessorHandle},
};
