//! RocksDB log storage implementation

use async_trait::async_trait;
use bytes::Bytes;
use conductor_storage::{
    LogStorage, LogStorageStreaming, StorageAdaptor, StorageError, StorageNamespace,
    StorageResult,
};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch, WriteOptions,
};
use std::{collections::HashMap, path::Path, sync::Arc};
use tokio::sync::RwLock;
use tokio_stream::Stream;
use tracing::{debug, info};

use crate::{RocksDbConfig, RocksDbStateBackend};

/// Type alias for log bounds cache to reduce type complexity
type LogBoundsCache = Arc<RwLock<HashMap<StorageNamespace, (u64, u64)>>>;

pub(crate) type Db = DBWithThreadMode<MultiThreaded>;

/// RocksDB log storage implementation
#[derive(Clone)]
pub struct RocksDbStorage {
    /// The RocksDB instance
    db: Arc<Db>,
    /// Log bounds cache: namespace -> (first_index, last_index)
    log_bounds: LogBoundsCache,
    config: Arc<RocksDbConfig>,
}

impl RocksDbStorage {
    /// Open storage at `path` with default settings
    pub async fn new(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::with_config(RocksDbConfig::new(path.as_ref())).await
    }

    /// Open storage described by `config`
    pub async fn with_config(config: RocksDbConfig) -> StorageResult<Self> {
        let path_str = config
            .path
            .to_str()
            .ok_or_else(|| StorageError::Backend("Invalid path".to_string()))?
            .to_string();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Reopen every existing column family
        let cf_names = match Db::list_cf(&db_opts, &path_str) {
            Ok(existing) if !existing.is_empty() => existing,
            _ => vec!["default".to_string()],
        };

        let cfs: Vec<ColumnFamilyDescriptor> = cf_names
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &path_str, cfs)
            .map_err(|e| StorageError::Backend(format!("Failed to open RocksDB: {e}")))?;

        info!(path = %path_str, sync_writes = config.sync_writes, "Opened RocksDB storage");

        Ok(Self {
            db: Arc::new(db),
            log_bounds: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        })
    }

    /// State backend stored in the same database
    pub fn state_backend(&self) -> StorageResult<RocksDbStateBackend> {
        RocksDbStateBackend::new(self.db.clone(), self.config.sync_writes)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        self.db
            .write_opt(batch, &self.write_options())
            .map_err(|e| StorageError::Backend(format!("Failed to write batch: {e}")))
    }

    /// Get or create a column family for a namespace
    fn get_or_create_cf(
        &self,
        namespace: &StorageNamespace,
    ) -> StorageResult<Arc<BoundColumnFamily<'_>>> {
        let cf_name = namespace.as_str();

        if let Some(cf) = self.db.cf_handle(cf_name) {
            return Ok(cf);
        }

        self.db
            .create_cf(cf_name, &Options::default())
            .map_err(|e| StorageError::Backend(format!("Failed to create column family: {e}")))?;

        self.db.cf_handle(cf_name).ok_or_else(|| {
            StorageError::Backend("Failed to get column family after creation".to_string())
        })
    }

    /// Get or create a metadata column family for a namespace
    fn get_or_create_metadata_cf(
        &self,
        namespace: &StorageNamespace,
    ) -> StorageResult<Arc<BoundColumnFamily<'_>>> {
        let cf_name = format!("{}_meta", namespace.as_str());

        if let Some(cf) = self.db.cf_handle(&cf_name) {
            return Ok(cf);
        }

        // Metadata is small and accessed frequently, optimize for point lookups
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.optimize_for_point_lookup(self.config.metadata_cache_mb);

        self.db.create_cf(&cf_name, &opts).map_err(|e| {
            StorageError::Backend(format!("Failed to create metadata column family: {e}"))
        })?;

        self.db.cf_handle(&cf_name).ok_or_else(|| {
            StorageError::Backend("Failed to get metadata column family after creation".to_string())
        })
    }

    /// Encode a log key for RocksDB
    fn encode_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    /// Decode a log key from RocksDB
    fn decode_key(key: &[u8]) -> StorageResult<u64> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| StorageError::InvalidKey("Invalid key length".to_string()))?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn first_and_last(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        let cf = self.get_or_create_cf(namespace)?;

        let mut first_iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        let first = match first_iter.next() {
            Some(Ok((key, _))) => Self::decode_key(&key)?,
            Some(Err(e)) => return Err(StorageError::Backend(format!("Iterator error: {e}"))),
            None => return Ok(None),
        };

        let mut last_iter = self.db.iterator_cf(&cf, IteratorMode::End);
        let last = match last_iter.next() {
            Some(Ok((key, _))) => Self::decode_key(&key)?,
            Some(Err(e)) => return Err(StorageError::Backend(format!("Iterator error: {e}"))),
            None => return Ok(None),
        };

        Ok(Some((first, last)))
    }
}

#[async_trait]
impl LogStorage for RocksDbStorage {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let cf = self.get_or_create_cf(namespace)?;
        let mut batch = WriteBatch::default();
        let mut bounds = self.log_bounds.write().await;

        let existing = match bounds.get(namespace).copied() {
            Some(cached) => Some(cached),
            None => self.first_and_last(namespace)?,
        };
        let mut first = existing.map(|(f, _)| f);
        let mut last = existing.map(|(_, l)| l);

        for (index, data) in &entries {
            batch.put_cf(&cf, Self::encode_key(*index), data.as_ref());
            first = Some(first.map_or(*index, |f| f.min(*index)));
            last = Some(last.map_or(*index, |l| l.max(*index)));
        }

        self.write(batch)?;

        if let (Some(first), Some(last)) = (first, last) {
            bounds.insert(namespace.clone(), (first, last));
        }

        Ok(())
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>> {
        let cf = self.get_or_create_cf(namespace)?;
        let mut entries = Vec::new();

        let start_key = Self::encode_key(start);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));

        for result in iter {
            let (key, value) =
                result.map_err(|e| StorageError::Backend(format!("Iterator error: {e}")))?;

            let index = Self::decode_key(&key)?;
            if index >= end {
                break;
            }
            entries.push((index, Bytes::copy_from_slice(&value)));
        }

        Ok(entries)
    }

    async fn truncate_after(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        let cf = self.get_or_create_cf(namespace)?;
        let mut batch = WriteBatch::default();
        let mut bounds = self.log_bounds.write().await;

        let start_key = Self::encode_key(index.saturating_add(1));
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));

        for result in iter {
            let (key, _) =
                result.map_err(|e| StorageError::Backend(format!("Iterator error: {e}")))?;
            batch.delete_cf(&cf, key);
        }

        self.write(batch)?;

        if let Some((first, last)) = bounds.get_mut(namespace) {
            if index < *last {
                *last = index;
            }
            if *first > *last {
                bounds.remove(namespace);
            }
        }

        Ok(())
    }

    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        let cf = self.get_or_create_cf(namespace)?;
        let mut batch = WriteBatch::default();
        let mut bounds = self.log_bounds.write().await;

        for result in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) =
                result.map_err(|e| StorageError::Backend(format!("Iterator error: {e}")))?;
            if Self::decode_key(&key)? > index {
                break;
            }
            batch.delete_cf(&cf, key);
        }

        self.write(batch)?;

        if let Some((first, last)) = bounds.get_mut(namespace) {
            if index >= *first {
                *first = index.saturating_add(1);
            }
            if *first > *last {
                bounds.remove(namespace);
            }
        }

        Ok(())
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        {
            let bounds = self.log_bounds.read().await;
            if let Some(&cached) = bounds.get(namespace) {
                return Ok(Some(cached));
            }
        }

        let computed = self.first_and_last(namespace)?;
        if let Some(found) = computed {
            self.log_bounds.write().await.insert(namespace.clone(), found);
        }
        Ok(computed)
    }

    async fn get_metadata(
        &self,
        namespace: &StorageNamespace,
        key: &str,
    ) -> StorageResult<Option<Bytes>> {
        let cf = self.get_or_create_metadata_cf(namespace)?;

        self.db
            .get_cf(&cf, key.as_bytes())
            .map(|value| value.map(Bytes::from))
            .map_err(|e| StorageError::Backend(format!("Failed to get metadata: {e}")))
    }

    async fn set_metadata(
        &self,
        namespace: &StorageNamespace,
        key: &str,
        value: Bytes,
    ) -> StorageResult<()> {
        let cf = self.get_or_create_metadata_cf(namespace)?;

        self.db
            .put_cf_opt(&cf, key.as_bytes(), value.as_ref(), &self.write_options())
            .map_err(|e| StorageError::Backend(format!("Failed to set metadata: {e}")))
    }
}

#[async_trait]
impl LogStorageStreaming for RocksDbStorage {
    async fn stream_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: Option<u64>,
    ) -> StorageResult<Box<dyn Stream<Item = StorageResult<(u64, Bytes)>> + Send + Unpin>> {
        // Make sure the column family exists before the stream looks it up
        let _cf = self.get_or_create_cf(namespace)?;
        let start_key = Self::encode_key(start);

        let db = self.db.clone();
        let namespace_str = namespace.as_str().to_string();

        let stream = async_stream::stream! {
            let Some(cf) = db.cf_handle(&namespace_str) else {
                yield Err(StorageError::NamespaceNotFound(namespace_str));
                return;
            };

            let iter = db.iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));

            for item in iter {
                match item {
                    Ok((key, value)) => match Self::decode_key(&key) {
                        Ok(index) => {
                            if end.is_some_and(|end| index >= end) {
                                break;
                            }
                            yield Ok((index, Bytes::from(value.to_vec())));
                        }
                        Err(e) => {
                            yield Err(e);
                            break;
                        }
                    },
                    Err(e) => {
                        yield Err(StorageError::Backend(format!("Iterator error: {e}")));
                        break;
                    }
                }
            }
        };

        Ok(Box::new(Box::pin(stream)))
    }
}

impl std::fmt::Debug for RocksDbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbStorage")
            .field("path", &self.config.path)
            .finish()
    }
}

#[async_trait]
impl StorageAdaptor for RocksDbStorage {
    async fn shutdown(&self) -> StorageResult<()> {
        self.db
            .flush()
            .map_err(|e| StorageError::Backend(format!("Failed to flush database: {e}")))?;
        self.log_bounds.write().await.clear();

        debug!(
            strong_count = Arc::strong_count(&self.db),
            "RocksDB storage flushed"
        );
        Ok(())
    }

    async fn stats(&self) -> StorageResult<String> {
        let estimate = self
            .db
            .property_value("rocksdb.estimate-num-keys")
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .unwrap_or_else(|| "unknown".to_string());
        Ok(format!("rocksdb: ~{estimate} keys in default column family"))
    }
}
