//! Seekable reader over the committed prefix of a block log.

use tokio::sync::watch;
use tracing::debug;

use crate::{BlockLog, CommitWatermark, LogBlock, Position, StorageAdaptor, StorageError, StorageResult};

/// Reads application blocks in log order.
///
/// A reader only ever returns committed blocks; initial blocks are skipped.
/// Reaching the end of the committed log yields `Ok(None)`, which is
/// distinct from a corrupted block (`Err(StorageError::Corrupted)`).
pub struct LogReader<S> {
    log: BlockLog<S>,
    next_index: u64,
    closed: bool,
}

impl<S: StorageAdaptor> LogReader<S> {
    pub(crate) fn new(log: BlockLog<S>) -> Self {
        let next_index = log.first_index().max(1);
        Self {
            log,
            next_index,
            closed: false,
        }
    }

    /// Position the reader so that the next call to [`LogReader::next`]
    /// returns the block containing `position`.
    ///
    /// If no block contains it, the reader lands on the last block ending
    /// before `position`. Negative positions select the first block, and
    /// positions past the end select the last committed block.
    pub fn seek(&mut self, position: Position) -> StorageResult<()> {
        self.ensure_open()?;
        self.next_index = self
            .log
            .seek_index(position)
            .unwrap_or_else(|| self.log.first_index().max(1));
        Ok(())
    }

    /// Position the reader at the first stored block.
    pub fn seek_to_first(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        self.next_index = self.log.first_index().max(1);
        Ok(())
    }

    /// The next committed application block, or `None` at the end of the log.
    pub async fn next(&mut self) -> StorageResult<Option<LogBlock>> {
        loop {
            self.ensure_open()?;

            let first = self.log.first_index();
            if self.next_index < first {
                self.next_index = first;
            }
            if self.next_index > self.log.commit_watermark().index {
                return Ok(None);
            }

            let Some(block) = self.log.read(self.next_index).await? else {
                return Ok(None);
            };
            self.next_index += 1;

            if block.is_application() {
                return Ok(Some(block));
            }
        }
    }

    /// Whether unread committed blocks exist.
    pub fn has_next(&self) -> bool {
        !self.closed && self.next_index <= self.log.commit_watermark().index
    }

    /// Watch channel that fires whenever more of the log becomes readable.
    pub fn commit_updates(&self) -> watch::Receiver<CommitWatermark> {
        self.log.subscribe_commits()
    }

    /// Close the reader. Closing twice is a no-op.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!(namespace = %self.log.namespace(), "Closed log reader");
        }
    }

    /// Whether [`LogReader::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            Err(StorageError::ReaderClosed)
        } else {
            Ok(())
        }
    }
}
