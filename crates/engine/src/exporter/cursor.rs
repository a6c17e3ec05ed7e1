//! Record-level iteration over the committed log.

use std::collections::VecDeque;

use conductor_storage::{BlockLog, CommitWatermark, LogReader, Position, StorageAdaptor};
use tokio::sync::watch;

use crate::error::EngineResult;
use crate::record::{Record, decode_records};

/// Committed records in position order, starting at a given position.
pub struct RecordCursor<S> {
    reader: LogReader<S>,
    buffered: VecDeque<Record>,
    from: Position,
}

impl<S: StorageAdaptor> RecordCursor<S> {
    /// Cursor whose first record is the first one at or after `from`
    pub fn new(log: &BlockLog<S>, from: Position) -> EngineResult<Self> {
        let mut reader = log.new_reader();
        reader.seek(from)?;
        Ok(Self {
            reader,
            buffered: VecDeque::new(),
            from,
        })
    }

    /// The next committed record, `None` at the end of the committed log
    pub async fn next(&mut self) -> EngineResult<Option<Record>> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                if record.position >= self.from {
                    self.from = record.position + 1;
                    return Ok(Some(record));
                }
                continue;
            }

            match self.reader.next().await? {
                Some(block) => self.buffered.extend(decode_records(&block)?),
                None => return Ok(None),
            }
        }
    }

    /// Fires whenever more of the log is committed
    pub fn commit_updates(&self) -> watch::Receiver<CommitWatermark> {
        self.reader.commit_updates()
    }

    /// Position the next record is at or after
    pub fn next_position(&self) -> Position {
        self.from
    }
}
