//! Position sequencing and the write path into the log.
//!
//! A [`LogStream`] hands out positions and writes each batch of records as
//! one block. It only accepts writes while the local member may write, that
//! is while it leads the partition (or always, without replication).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use conductor_raft::{EntryValidator, GapValidator, RaftHandle};
use conductor_storage::{
    BlockAddress, BlockLog, CommitMode, LogAppender, LogBlock, Position, PositionAllocator,
    StorageAdaptor,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{EngineResult, Error, ErrorKind};
use crate::record::{Record, encode_records};

/// Durably writes one block and reports where it landed
#[async_trait]
pub trait LogStreamWriter: Send + Sync + 'static {
    /// Write `payload` covering `[lowest, highest]`; returns once the block
    /// is committed.
    async fn write(
        &self,
        lowest: Position,
        highest: Position,
        payload: Bytes,
    ) -> EngineResult<BlockAddress>;
}

/// Writes straight into the local log, committing every block at once.
pub struct StandaloneWriter<S> {
    log: BlockLog<S>,
    appender: LogAppender,
}

impl<S: StorageAdaptor> StandaloneWriter<S> {
    /// Start the appender of `log`. Everything already stored counts as
    /// committed.
    pub fn start(log: BlockLog<S>) -> Self {
        let term = log.last_term();
        let appender = LogAppender::start(log.clone(), term, CommitMode::Immediate);
        Self { log, appender }
    }
}

#[async_trait]
impl<S: StorageAdaptor> LogStreamWriter for StandaloneWriter<S> {
    async fn write(
        &self,
        lowest: Position,
        highest: Position,
        payload: Bytes,
    ) -> EngineResult<BlockAddress> {
        let candidate = LogBlock::application(self.log.last_term(), lowest, highest, Bytes::new());
        GapValidator
            .validate(self.log.last_application().as_ref(), &candidate)
            .map_err(|e| Error::chain(ErrorKind::Validation, "Entry refused", e))?;

        Ok(self.appender.append_async(lowest, highest, payload).await?)
    }
}

/// Writes through the partition's raft leader.
pub struct RaftWriter {
    raft: RaftHandle,
}

impl RaftWriter {
    /// Writer replicating through `raft`
    pub fn new(raft: RaftHandle) -> Self {
        Self { raft }
    }
}

#[async_trait]
impl LogStreamWriter for RaftWriter {
    async fn write(
        &self,
        lowest: Position,
        highest: Position,
        payload: Bytes,
    ) -> EngineResult<BlockAddress> {
        Ok(self.raft.replicate(lowest, highest, payload).await?)
    }
}

/// Sequenced, batch-atomic writes into a partition's log.
///
/// Clones share the sequencer; writes are serialized.
#[derive(Clone)]
pub struct LogStream {
    partition_id: u32,
    writer: Arc<dyn LogStreamWriter>,
    allocator: Arc<Mutex<Option<PositionAllocator>>>,
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("partition_id", &self.partition_id)
            .finish_non_exhaustive()
    }
}

impl LogStream {
    /// A log stream that refuses writes until [`LogStream::reset`]
    pub fn new(partition_id: u32, writer: Arc<dyn LogStreamWriter>) -> Self {
        Self {
            partition_id,
            writer,
            allocator: Arc::new(Mutex::new(None)),
        }
    }

    /// Accept writes, continuing after `last_position`
    pub async fn reset(&self, last_position: Position) {
        *self.allocator.lock().await = Some(PositionAllocator::starting_after(last_position));
        info!(
            partition_id = self.partition_id,
            next_position = last_position.max(0) + 1,
            "Log stream accepts writes"
        );
    }

    /// Refuse writes until the next reset
    pub async fn disable(&self) {
        if self.allocator.lock().await.take().is_some() {
            debug!(partition_id = self.partition_id, "Log stream stopped accepting writes");
        }
    }

    /// Whether writes are accepted
    pub async fn is_writable(&self) -> bool {
        self.allocator.lock().await.is_some()
    }

    /// Assign positions to `records` and write them as one block.
    ///
    /// Either every record lands or none does; a failed write leaves no gap
    /// in the positions handed out.
    pub async fn write_batch(
        &self,
        mut records: Vec<Record>,
    ) -> EngineResult<(BlockAddress, Vec<Record>)> {
        if records.is_empty() {
            return Err(Error::invalid_state("Cannot write an empty batch"));
        }

        let mut allocator = self.allocator.lock().await;
        let Some(sequencer) = allocator.as_mut() else {
            return Err(Error::not_leader("Log stream is not writable", None));
        };

        let (lowest, highest) = sequencer.reserve(records.len());
        for (record, position) in records.iter_mut().zip(lowest..) {
            record.position = position;
            record.partition_id = self.partition_id;
        }

        let payload = encode_records(&records)?;
        let address = self.writer.write(lowest, highest, payload).await?;
        sequencer.commit(highest);
        Ok((address, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_storage::StorageNamespace;
    use conductor_storage_memory::MemoryStorage;
    use serde_json::json;

    async fn standalone() -> (MemoryStorage, BlockLog<MemoryStorage>, LogStream) {
        let storage = MemoryStorage::new();
        let log = BlockLog::open(storage.clone(), StorageNamespace::new("partition-1"))
            .await
            .unwrap();
        let stream = LogStream::new(1, Arc::new(StandaloneWriter::start(log.clone())));
        (storage, log, stream)
    }

    fn commands(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| Record::command("COUNTER", "CREATE", json!(i)))
            .collect()
    }

    #[tokio::test]
    async fn test_refuses_writes_until_reset() {
        let (_, _, stream) = standalone().await;
        let err = stream.write_batch(commands(1)).await.unwrap_err();
        assert!(err.is_not_leader());

        stream.reset(-1).await;
        let (address, written) = stream.write_batch(commands(2)).await.unwrap();
        assert_eq!((address.lowest_position, address.highest_position), (1, 2));
        assert_eq!(written[1].position, 2);
        assert_eq!(written[1].partition_id, 1);

        stream.disable().await;
        assert!(!stream.is_writable().await);
    }

    #[tokio::test]
    async fn test_failed_append_leaves_no_gap() {
        let (storage, log, stream) = standalone().await;
        stream.reset(-1).await;
        stream.write_batch(commands(1)).await.unwrap();

        storage.fail_next_appends(1);
        let err = stream.write_batch(commands(3)).await.unwrap_err();
        assert!(err.is_transient());

        let (address, _) = stream.write_batch(commands(1)).await.unwrap();
        assert_eq!(address.lowest_position, 2);
        assert_eq!(log.commit_watermark().position, 2);
    }

    #[tokio::test]
    async fn test_stale_sequencer_is_refused() {
        let (_, _, stream) = standalone().await;
        stream.reset(-1).await;
        stream.write_batch(commands(2)).await.unwrap();

        // a sequencer that lost track of the log would open a gap
        stream.reset(5).await;
        let err = stream.write_batch(commands(1)).await.unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Validation);
    }
}
