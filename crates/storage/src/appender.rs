//! Sequential block appender with completion callbacks.
//!
//! Callers enqueue blocks without blocking; a single writer task writes
//! them in submission order and reports each outcome to the request's
//! [`AppendListener`].

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::{BlockAddress, BlockLog, LogBlock, Position, StorageAdaptor, StorageError, StorageResult};

/// Receives the outcome of one append. Exactly one method is called.
pub trait AppendListener: Send + 'static {
    /// The block is durably stored at `address`.
    fn on_write(self: Box<Self>, address: BlockAddress);

    /// The block could not be stored; nothing from it is visible.
    fn on_write_error(self: Box<Self>, error: StorageError);
}

/// When appended blocks become visible to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Commit each block as soon as it is stored (single-member partitions).
    Immediate,
    /// Leave committing to someone else, such as a replication layer.
    External,
}

struct AppendRequest {
    lowest: Position,
    highest: Position,
    payload: Bytes,
    listener: Box<dyn AppendListener>,
}

struct OneshotListener(oneshot::Sender<StorageResult<BlockAddress>>);

impl AppendListener for OneshotListener {
    fn on_write(self: Box<Self>, address: BlockAddress) {
        let _ = self.0.send(Ok(address));
    }

    fn on_write_error(self: Box<Self>, error: StorageError) {
        let _ = self.0.send(Err(error));
    }
}

/// Handle to the writer task. Clones share the same task, which exits once
/// every handle is dropped.
#[derive(Clone)]
pub struct LogAppender {
    tx: mpsc::UnboundedSender<AppendRequest>,
}

impl LogAppender {
    /// Spawn the writer task for `log`, tagging blocks with `term`.
    pub fn start<S: StorageAdaptor>(log: BlockLog<S>, term: u64, mode: CommitMode) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AppendRequest>();

        if mode == CommitMode::Immediate {
            log.commit_to(log.last_index());
        }

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let block = LogBlock::application(
                    term,
                    request.lowest,
                    request.highest,
                    request.payload,
                );

                match log.append(block).await {
                    Ok(address) => {
                        if mode == CommitMode::Immediate {
                            log.commit_to(address.index);
                        }
                        request.listener.on_write(address);
                    }
                    Err(e) => {
                        error!(
                            namespace = %log.namespace(),
                            lowest = request.lowest,
                            highest = request.highest,
                            "Failed to append block: {}", e
                        );
                        request.listener.on_write_error(e);
                    }
                }
            }
            debug!(namespace = %log.namespace(), "Log appender stopped");
        });

        Self { tx }
    }

    /// Enqueue a block covering `[lowest, highest]`.
    pub fn append(
        &self,
        lowest: Position,
        highest: Position,
        payload: Bytes,
        listener: impl AppendListener,
    ) -> StorageResult<()> {
        self.tx
            .send(AppendRequest {
                lowest,
                highest,
                payload,
                listener: Box::new(listener),
            })
            .map_err(|_| StorageError::AppenderClosed)
    }

    /// Enqueue a block and wait for the outcome.
    pub async fn append_async(
        &self,
        lowest: Position,
        highest: Position,
        payload: Bytes,
    ) -> StorageResult<BlockAddress> {
        let (tx, rx) = oneshot::channel();
        self.append(lowest, highest, payload, OneshotListener(tx))?;
        rx.await.map_err(|_| StorageError::AppenderClosed)?
    }
}
