//! Position-addressed block log over a [`LogStorage`](crate::LogStorage) namespace.
//!
//! The block log keeps an in-memory index of every stored block (term,
//! kind, position range) so that seeks, term lookups and the commit
//! watermark never touch the backend. The index is rebuilt on open by
//! streaming the namespace once.
//!
//! Writes are serialized through an async mutex; reads are lock-free with
//! respect to writers apart from the short index lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{Mutex, watch};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::{
    BlockKind, LogBlock, LogReader, NO_POSITION, Position, StorageAdaptor, StorageError,
    StorageNamespace, StorageResult,
};

/// Where a block landed in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAddress {
    /// Log index of the block
    pub index: u64,
    /// Term the block was written in
    pub term: u64,
    /// First record position (or [`NO_POSITION`] for initial blocks)
    pub lowest_position: Position,
    /// Last record position (or [`NO_POSITION`] for initial blocks)
    pub highest_position: Position,
}

/// The committed prefix of the log.
///
/// `position` is the highest record position contained in the committed
/// prefix, which is what the stream processor waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitWatermark {
    /// Highest committed log index
    pub index: u64,
    /// Highest committed record position
    pub position: Position,
}

impl Default for CommitWatermark {
    fn default() -> Self {
        Self {
            index: 0,
            position: NO_POSITION,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BlockMeta {
    term: u64,
    kind: BlockKind,
    lowest: Position,
    highest: Position,
}

impl BlockMeta {
    fn of(block: &LogBlock) -> Self {
        Self {
            term: block.term,
            kind: block.kind,
            lowest: block.lowest_position,
            highest: block.highest_position,
        }
    }

    fn address(&self, index: u64) -> BlockAddress {
        BlockAddress {
            index,
            term: self.term,
            lowest_position: self.lowest,
            highest_position: self.highest,
        }
    }

    fn is_application(&self) -> bool {
        self.kind == BlockKind::Application
    }
}

#[derive(Debug, Default)]
struct BlockIndex {
    entries: BTreeMap<u64, BlockMeta>,
    by_lowest: BTreeMap<Position, u64>,
}

impl BlockIndex {
    fn insert(&mut self, index: u64, meta: BlockMeta) {
        if meta.is_application() {
            self.by_lowest.insert(meta.lowest, index);
        }
        self.entries.insert(index, meta);
    }

    fn forget(&mut self, removed: BTreeMap<u64, BlockMeta>) {
        for meta in removed.values().filter(|m| m.is_application()) {
            self.by_lowest.remove(&meta.lowest);
        }
    }

    fn truncate_after(&mut self, index: u64) {
        let removed = self.entries.split_off(&(index + 1));
        self.forget(removed);
    }

    fn compact_before(&mut self, index: u64) {
        let kept = self.entries.split_off(&(index + 1));
        let removed = std::mem::replace(&mut self.entries, kept);
        self.forget(removed);
    }

    fn first_index(&self) -> u64 {
        self.entries.keys().next().copied().unwrap_or(0)
    }

    fn last_index(&self) -> u64 {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    fn last_term(&self) -> u64 {
        self.entries.values().next_back().map(|m| m.term).unwrap_or(0)
    }

    fn last_application(&self) -> Option<BlockAddress> {
        let (_, &index) = self.by_lowest.iter().next_back()?;
        self.entries.get(&index).map(|meta| meta.address(index))
    }

    fn application_at_or_before(&self, bound: u64) -> Option<BlockAddress> {
        self.entries
            .range(..=bound)
            .rev()
            .find(|(_, meta)| meta.is_application())
            .map(|(&index, meta)| meta.address(index))
    }

    fn first_application(&self, bound: u64) -> Option<u64> {
        self.entries
            .range(..=bound)
            .find(|(_, meta)| meta.is_application())
            .map(|(&index, _)| index)
    }

    /// Index of the block containing `position`, else the last block ending
    /// before it, limited to blocks at or below `bound`.
    fn seek(&self, position: Position, bound: u64) -> Option<u64> {
        if position < 0 {
            return self.first_application(bound);
        }

        match self.by_lowest.range(..=position).next_back() {
            Some((_, &index)) if index <= bound => Some(index),
            Some(_) => self.application_at_or_before(bound).map(|a| a.index),
            None => self.first_application(bound),
        }
    }
}

struct Inner<S> {
    storage: S,
    namespace: StorageNamespace,
    index: RwLock<BlockIndex>,
    commit_tx: watch::Sender<CommitWatermark>,
    write_lock: Mutex<()>,
}

/// Append-only block log of one partition.
///
/// Cloning is cheap; all clones share the same index and commit watermark.
pub struct BlockLog<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for BlockLog<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> std::fmt::Debug for BlockLog<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockLog")
            .field("namespace", &self.inner.namespace)
            .field("commit", &*self.inner.commit_tx.borrow())
            .finish()
    }
}

impl<S: StorageAdaptor> BlockLog<S> {
    /// Open the block log stored in `namespace`, rebuilding the index.
    ///
    /// Nothing is considered committed after opening; the owner decides
    /// (raft through replication, a standalone appender immediately).
    pub async fn open(storage: S, namespace: StorageNamespace) -> StorageResult<Self> {
        let mut index = BlockIndex::default();

        if let Some((first, last)) = storage.bounds(&namespace).await? {
            let mut stream = storage.stream_range(&namespace, first, None).await?;
            while let Some(entry) = stream.next().await {
                let (idx, data) = entry?;
                let block = LogBlock::decode(idx, &data)?;
                index.insert(idx, BlockMeta::of(&block));
            }
            info!(
                namespace = %namespace,
                first, last,
                "Opened block log"
            );
        } else {
            debug!(namespace = %namespace, "Opened empty block log");
        }

        let (commit_tx, _) = watch::channel(CommitWatermark::default());

        Ok(Self {
            inner: Arc::new(Inner {
                storage,
                namespace,
                index: RwLock::new(index),
                commit_tx,
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// The namespace the log lives in.
    pub fn namespace(&self) -> &StorageNamespace {
        &self.inner.namespace
    }

    /// The underlying storage backend.
    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    /// Append `block` right after the current tail.
    pub async fn append(&self, block: LogBlock) -> StorageResult<BlockAddress> {
        let _guard = self.inner.write_lock.lock().await;
        let index = self.inner.index.read().last_index() + 1;
        self.write_locked(index, block).await
    }

    /// Write `block` at `index`, which must directly follow the tail.
    pub async fn write_at(&self, index: u64, block: LogBlock) -> StorageResult<BlockAddress> {
        let _guard = self.inner.write_lock.lock().await;
        let expected = self.inner.index.read().last_index() + 1;
        if index != expected {
            return Err(StorageError::OutOfOrder {
                expected,
                actual: index,
            });
        }
        self.write_locked(index, block).await
    }

    async fn write_locked(&self, index: u64, block: LogBlock) -> StorageResult<BlockAddress> {
        self.inner
            .storage
            .append(&self.inner.namespace, vec![(index, block.encode())])
            .await?;

        let meta = BlockMeta::of(&block);
        self.inner.index.write().insert(index, meta);
        Ok(meta.address(index))
    }

    /// Drop every block after `index`. Committed blocks are never dropped.
    pub async fn truncate_after(&self, index: u64) -> StorageResult<()> {
        let _guard = self.inner.write_lock.lock().await;
        let committed = self.inner.commit_tx.borrow().index;
        if index < committed {
            return Err(StorageError::TruncateCommitted { index, committed });
        }
        if index >= self.inner.index.read().last_index() {
            return Ok(());
        }

        self.inner
            .storage
            .truncate_after(&self.inner.namespace, index)
            .await?;
        self.inner.index.write().truncate_after(index);
        warn!(namespace = %self.inner.namespace, index, "Truncated uncommitted blocks");
        Ok(())
    }

    /// Remove committed blocks up to and including `index`.
    pub async fn compact_before(&self, index: u64) -> StorageResult<()> {
        let _guard = self.inner.write_lock.lock().await;
        let bound = index.min(self.inner.commit_tx.borrow().index);
        if bound == 0 {
            return Ok(());
        }

        self.inner
            .storage
            .compact_before(&self.inner.namespace, bound)
            .await?;
        self.inner.index.write().compact_before(bound);
        debug!(namespace = %self.inner.namespace, index = bound, "Compacted block log");
        Ok(())
    }

    /// Remove every block that lies entirely below `position`.
    pub async fn compact_below_position(&self, position: Position) -> StorageResult<()> {
        let committed = self.inner.commit_tx.borrow().index;
        let target = self.inner.index.read().seek(position, committed);
        match target {
            Some(index) if index > 1 => self.compact_before(index - 1).await,
            _ => Ok(()),
        }
    }

    /// Read and decode the block at `index`.
    pub async fn read(&self, index: u64) -> StorageResult<Option<LogBlock>> {
        let mut entries = self
            .inner
            .storage
            .read_range(&self.inner.namespace, index, index + 1)
            .await?;
        match entries.pop() {
            Some((idx, data)) => LogBlock::decode(idx, &data).map(Some),
            None => Ok(None),
        }
    }

    /// Raw encoded blocks in `[start, end)`, as shipped to followers.
    pub async fn read_raw(&self, start: u64, end: u64) -> StorageResult<Vec<(u64, Bytes)>> {
        self.inner
            .storage
            .read_range(&self.inner.namespace, start, end)
            .await
    }

    /// First stored index, 0 when empty.
    pub fn first_index(&self) -> u64 {
        self.inner.index.read().first_index()
    }

    /// Last stored index, 0 when empty.
    pub fn last_index(&self) -> u64 {
        self.inner.index.read().last_index()
    }

    /// Term of the last stored block, 0 when empty.
    pub fn last_term(&self) -> u64 {
        self.inner.index.read().last_term()
    }

    /// Term of the block at `index`; index 0 has term 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.inner.index.read().entries.get(&index).map(|m| m.term)
    }

    /// Address of the last application block.
    pub fn last_application(&self) -> Option<BlockAddress> {
        self.inner.index.read().last_application()
    }

    /// Log index a reader has to start from to see `position`.
    pub fn seek_index(&self, position: Position) -> Option<u64> {
        let committed = self.inner.commit_tx.borrow().index;
        self.inner.index.read().seek(position, committed)
    }

    /// Advance the commit watermark to `index` (clamped to the tail).
    ///
    /// The watermark never moves backwards.
    pub fn commit_to(&self, index: u64) -> CommitWatermark {
        let (target, position) = {
            let block_index = self.inner.index.read();
            let target = index.min(block_index.last_index());
            let position = block_index
                .application_at_or_before(target)
                .map(|a| a.highest_position)
                .unwrap_or(NO_POSITION);
            (target, position)
        };

        self.inner.commit_tx.send_if_modified(|current| {
            if target > current.index {
                current.index = target;
                current.position = current.position.max(position);
                true
            } else {
                false
            }
        });

        *self.inner.commit_tx.borrow()
    }

    /// Current commit watermark.
    pub fn commit_watermark(&self) -> CommitWatermark {
        *self.inner.commit_tx.borrow()
    }

    /// Subscribe to commit watermark changes.
    pub fn subscribe_commits(&self) -> watch::Receiver<CommitWatermark> {
        self.inner.commit_tx.subscribe()
    }

    /// A new reader positioned at the start of the log.
    pub fn new_reader(&self) -> LogReader<S> {
        LogReader::new(self.clone())
    }
}
