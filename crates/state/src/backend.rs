//! Ordered key-value backends for the state store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::warn;

use crate::{StateError, StateResult};

/// One mutation inside an atomic write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite a key
    Put(Vec<u8>, Vec<u8>),
    /// Remove a key
    Delete(Vec<u8>),
}

/// An ordered byte key-value store with atomic multi-key writes.
pub trait StateBackend: Send + Sync + 'static {
    /// Point lookup
    fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply all operations atomically
    fn write(&self, ops: Vec<WriteOp>) -> StateResult<()>;

    /// Replace the whole content, used when restoring a snapshot
    fn replace_all(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> StateResult<()>;
}

/// In-memory backend over a `BTreeMap`.
#[derive(Clone, Default)]
pub struct MemoryStateBackend {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    failing_writes: Arc<AtomicUsize>,
}

impl MemoryStateBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with [`StateError::Backend`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl std::fmt::Debug for MemoryStateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStateBackend")
            .field("keys", &self.len())
            .finish()
    }
}

impl StateBackend for MemoryStateBackend {
    fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, ops: Vec<WriteOp>) -> StateResult<()> {
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            warn!("Injected state write failure");
            return Err(StateError::Backend("injected write failure".to_string()));
        }

        let mut data = self.data.write();
        for op in ops {
            match op {
                WriteOp::Put(k, v) => {
                    data.insert(k, v);
                }
                WriteOp::Delete(k) => {
                    data.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn replace_all(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> StateResult<()> {
        *self.data.write() = entries.into_iter().collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_prefix_stops_at_prefix_end() {
        let backend = MemoryStateBackend::new();
        backend
            .write(vec![
                WriteOp::Put(vec![0, 1, 1], b"a".to_vec()),
                WriteOp::Put(vec![0, 1, 2], b"b".to_vec()),
                WriteOp::Put(vec![0, 2, 1], b"c".to_vec()),
            ])
            .unwrap();

        let scanned = backend.scan_prefix(&[0, 1]).unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[1].1, b"b".to_vec());
    }

    #[test]
    fn test_failed_write_changes_nothing() {
        let backend = MemoryStateBackend::new();
        backend.fail_next_writes(1);

        let result = backend.write(vec![WriteOp::Put(vec![1], vec![1])]);
        assert!(result.unwrap_err().is_transient());
        assert!(backend.is_empty());
    }
}
