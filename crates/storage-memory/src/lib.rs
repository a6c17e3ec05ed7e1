//! In-memory log storage implementation
//!
//! Used for tests and for single-process partitions. Besides the plain
//! storage it offers fault injection: failing a number of upcoming appends
//! and corrupting stored entries.

use async_trait::async_trait;
use bytes::Bytes;
use conductor_storage::{
    LogStorage, LogStorageStreaming, StorageAdaptor, StorageError, StorageNamespace,
    StorageResult,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::sync::RwLock;
use tokio_stream::Stream;
use tracing::warn;

#[derive(Default)]
struct NamespaceData {
    /// index -> bytes
    entries: BTreeMap<u64, Bytes>,
    metadata: HashMap<String, Bytes>,
}

/// In-memory log storage implementation using BTreeMap for ordering
#[derive(Clone, Default)]
pub struct MemoryStorage {
    namespaces: Arc<RwLock<HashMap<StorageNamespace, NamespaceData>>>,
    /// Number of upcoming appends that fail with a backend error
    failing_appends: Arc<AtomicUsize>,
}

impl MemoryStorage {
    /// Create a new in-memory storage instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail with [`StorageError::Backend`].
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Overwrite the stored bytes at `index`, keeping the entry in place.
    pub async fn corrupt_entry(&self, namespace: &StorageNamespace, index: u64, data: Bytes) {
        let mut namespaces = self.namespaces.write().await;
        if let Some(entry) = namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.entries.get_mut(&index))
        {
            *entry = data;
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LogStorage for MemoryStorage {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        if self.take_injected_failure() {
            warn!(namespace = %namespace, "Injected append failure");
            return Err(StorageError::Backend("injected append failure".to_string()));
        }

        let mut namespaces = self.namespaces.write().await;
        let data = namespaces.entry(namespace.clone()).or_default();
        for (index, bytes) in entries {
            data.entries.insert(index, bytes);
        }

        Ok(())
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>> {
        if start >= end {
            return Ok(Vec::new());
        }

        let namespaces = self.namespaces.read().await;
        Ok(namespaces
            .get(namespace)
            .map(|data| {
                data.entries
                    .range(start..end)
                    .map(|(&idx, bytes)| (idx, bytes.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn truncate_after(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        let mut namespaces = self.namespaces.write().await;
        if let Some(data) = namespaces.get_mut(namespace) {
            data.entries.split_off(&(index + 1));
        }
        Ok(())
    }

    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        let mut namespaces = self.namespaces.write().await;
        if let Some(data) = namespaces.get_mut(namespace) {
            data.entries = data.entries.split_off(&(index + 1));
        }
        Ok(())
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        let namespaces = self.namespaces.read().await;
        Ok(namespaces.get(namespace).and_then(|data| {
            let first = data.entries.keys().next()?;
            let last = data.entries.keys().next_back()?;
            Some((*first, *last))
        }))
    }

    async fn get_metadata(
        &self,
        namespace: &StorageNamespace,
        key: &str,
    ) -> StorageResult<Option<Bytes>> {
        let namespaces = self.namespaces.read().await;
        Ok(namespaces
            .get(namespace)
            .and_then(|data| data.metadata.get(key).cloned()))
    }

    async fn set_metadata(
        &self,
        namespace: &StorageNamespace,
        key: &str,
        value: Bytes,
    ) -> StorageResult<()> {
        let mut namespaces = self.namespaces.write().await;
        namespaces
            .entry(namespace.clone())
            .or_default()
            .metadata
            .insert(key.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl LogStorageStreaming for MemoryStorage {
    async fn stream_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: Option<u64>,
    ) -> StorageResult<Box<dyn Stream<Item = StorageResult<(u64, Bytes)>> + Send + Unpin>> {
        // Snapshot the range; the memory backend has no cheaper cursor
        let entries = self
            .read_range(namespace, start, end.unwrap_or(u64::MAX))
            .await?;
        Ok(Box::new(tokio_stream::iter(entries.into_iter().map(Ok))))
    }
}

#[async_trait]
impl StorageAdaptor for MemoryStorage {
    async fn stats(&self) -> StorageResult<String> {
        let namespaces = self.namespaces.read().await;
        let entries: usize = namespaces.values().map(|d| d.entries.len()).sum();
        Ok(format!(
            "memory storage: {} namespaces, {} entries",
            namespaces.len(),
            entries
        ))
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("namespaces", &"<locked>")
            .field("failing_appends", &self.failing_appends.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_storage_append_and_get() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("test");

        storage
            .append(&namespace, vec![(1, Bytes::from("test data 1"))])
            .await
            .unwrap();

        let result = storage.read_range(&namespace, 1, 2).await.unwrap();
        assert_eq!(result, vec![(1, Bytes::from("test data 1"))]);
        assert_eq!(storage.bounds(&namespace).await.unwrap(), Some((1, 1)));
    }

    #[tokio::test]
    async fn test_log_storage_truncate() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("test");

        let entries = (1..=5).map(|i| (i, Bytes::from(format!("data {i}")))).collect();
        storage.append(&namespace, entries).await.unwrap();

        storage.truncate_after(&namespace, 3).await.unwrap();

        let range = storage.read_range(&namespace, 1, 6).await.unwrap();
        assert_eq!(range.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(storage.bounds(&namespace).await.unwrap(), Some((1, 3)));
    }

    #[tokio::test]
    async fn test_log_storage_compact() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("test");

        let entries = (1..=5).map(|i| (i, Bytes::from(format!("data {i}")))).collect();
        storage.append(&namespace, entries).await.unwrap();

        storage.compact_before(&namespace, 3).await.unwrap();

        let range = storage.read_range(&namespace, 1, 6).await.unwrap();
        assert_eq!(range.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(storage.bounds(&namespace).await.unwrap(), Some((4, 5)));
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("test");

        assert!(storage.get_metadata(&namespace, "term").await.unwrap().is_none());
        storage
            .set_metadata(&namespace, "term", Bytes::from_static(b"7"))
            .await
            .unwrap();
        assert_eq!(
            storage.get_metadata(&namespace, "term").await.unwrap(),
            Some(Bytes::from_static(b"7"))
        );
    }

    #[tokio::test]
    async fn test_injected_append_failures() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("test");
        storage.fail_next_appends(1);

        let err = storage
            .append(&namespace, vec![(1, Bytes::from("a"))])
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(storage.bounds(&namespace).await.unwrap(), None);

        storage
            .append(&namespace, vec![(1, Bytes::from("a"))])
            .await
            .unwrap();
        assert_eq!(storage.bounds(&namespace).await.unwrap(), Some((1, 1)));
    }
}
