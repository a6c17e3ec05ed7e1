//! Configuration for stream processing, exporters and partitions

use std::time::Duration;

use conductor_raft::RaftConfig;
use conductor_state::MAX_PARTITION_ID;
use serde::{Deserialize, Serialize};

use crate::error::{EngineResult, Error, ErrorKind};
use crate::startup::{IGNORABLE_STARTUP_CONDITIONS, StartupCondition};

/// Stream processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamProcessorConfig {
    /// First delay after a transient failure
    pub min_backoff: Duration,

    /// Upper bound of the retry delay
    pub max_backoff: Duration,

    /// Max encoded size of the records written for one command
    pub max_batch_bytes: usize,

    /// Max number of records written for one command
    pub max_batch_records: usize,

    /// Blocks applied per state transaction while replaying
    pub replay_batch_size: usize,
}

impl Default for StreamProcessorConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_batch_bytes: 4 * 1024 * 1024,
            max_batch_records: 1024,
            replay_batch_size: 64,
        }
    }
}

/// Exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// First delay after a failed export
    pub min_backoff: Duration,

    /// Upper bound of the export retry delay
    pub max_backoff: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Partition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Partition id, encoded into every key the partition hands out
    pub partition_id: u32,

    /// Stream processor settings
    pub processor: StreamProcessorConfig,

    /// Exporter settings
    pub exporter: ExporterConfig,

    /// Replication settings, used when the partition runs with raft
    pub raft: RaftConfig,

    /// How long a submitted command waits for its response
    pub request_timeout: Duration,

    /// Conditions found at startup that do not abort it
    pub ignorable_startup_conditions: Vec<StartupCondition>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partition_id: 1,
            processor: StreamProcessorConfig::default(),
            exporter: ExporterConfig::default(),
            raft: RaftConfig::default(),
            request_timeout: Duration::from_secs(10),
            ignorable_startup_conditions: IGNORABLE_STARTUP_CONDITIONS.to_vec(),
        }
    }
}

impl PartitionConfig {
    /// Default configuration of `partition_id`
    pub fn for_partition(partition_id: u32) -> Self {
        Self {
            partition_id,
            ..Self::default()
        }
    }

    /// Reject settings the partition cannot run with
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: &str| Err(Error::with_context(ErrorKind::Configuration, msg));

        if self.partition_id > MAX_PARTITION_ID {
            return Err(Error::with_context(
                ErrorKind::Configuration,
                format!(
                    "partition_id {} exceeds the maximum of {MAX_PARTITION_ID}",
                    self.partition_id
                ),
            ));
        }

        if self.processor.min_backoff > self.processor.max_backoff {
            return invalid("processor.min_backoff exceeds processor.max_backoff");
        }
        if self.exporter.min_backoff > self.exporter.max_backoff {
            return invalid("exporter.min_backoff exceeds exporter.max_backoff");
        }
        if self.processor.max_batch_records == 0 || self.processor.max_batch_bytes == 0 {
            return invalid("batch limits must be positive");
        }
        if self.processor.replay_batch_size == 0 {
            return invalid("replay_batch_size must be positive");
        }
        if self.request_timeout.is_zero() {
            return invalid("request_timeout must be positive");
        }
        self.raft
            .validate()
            .map_err(|e| Error::chain(ErrorKind::Configuration, "Invalid raft config", e))
    }
}
