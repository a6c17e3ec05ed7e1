//! RocksDB backend for the partition state store

use std::sync::Arc;

use conductor_state::{StateBackend, StateError, StateResult, WriteOp};
use rocksdb::{BoundColumnFamily, Direction, IteratorMode, Options, WriteBatch, WriteOptions};
use tracing::info;

use crate::log::Db;

const STATE_CF: &str = "state";

/// State backend over the `state` column family of a [`crate::RocksDbStorage`]
#[derive(Clone)]
pub struct RocksDbStateBackend {
    db: Arc<Db>,
    sync_writes: bool,
}

impl RocksDbStateBackend {
    pub(crate) fn new(db: Arc<Db>, sync_writes: bool) -> StateResult<Self> {
        if db.cf_handle(STATE_CF).is_none() {
            db.create_cf(STATE_CF, &Options::default())
                .map_err(|e| StateError::Backend(format!("Failed to create state family: {e}")))?;
            info!("Created state column family");
        }
        Ok(Self { db, sync_writes })
    }

    fn cf(&self) -> StateResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(STATE_CF)
            .ok_or_else(|| StateError::Backend("state column family missing".to_string()))
    }

    fn write_batch(&self, batch: WriteBatch) -> StateResult<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db
            .write_opt(batch, &opts)
            .map_err(|e| StateError::Backend(format!("Failed to write state: {e}")))
    }
}

impl std::fmt::Debug for RocksDbStateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbStateBackend")
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl StateBackend for RocksDbStateBackend {
    fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        let cf = self.cf()?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StateError::Backend(format!("Failed to read state: {e}")))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf()?;
        let mut entries = Vec::new();

        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) =
                item.map_err(|e| StateError::Backend(format!("Iterator error: {e}")))?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }

        Ok(entries)
    }

    fn write(&self, ops: Vec<WriteOp>) -> StateResult<()> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                WriteOp::Put(key, value) => batch.put_cf(&cf, key, value),
                WriteOp::Delete(key) => batch.delete_cf(&cf, key),
            }
        }
        self.write_batch(batch)
    }

    fn replace_all(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> StateResult<()> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StateError::Backend(format!("Iterator error: {e}")))?;
            batch.delete_cf(&cf, key);
        }
        for (key, value) in entries {
            batch.put_cf(&cf, key, value);
        }

        self.write_batch(batch)
    }
}
