//! The state store, its read view and write transactions.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info};

use crate::{
    Column, ColumnFamily, ProcessingPosition, StateBackend, StateError, StateResult,
    StateSnapshot, WriteOp,
};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_VERSION_COLUMN: Column<str, u32> = Column::new(ColumnFamily::META);
const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Read access to state.
pub trait StateRead {
    /// Raw point lookup of a full backend key
    fn get_raw(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>>;

    /// Raw prefix scan over full backend keys
    fn scan_raw(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>>;
}

pub(crate) fn encode_value<V: Serialize + ?Sized>(value: &V) -> StateResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StateError::Encode(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn decode_value<V: DeserializeOwned>(cf: ColumnFamily, bytes: &[u8]) -> StateResult<V> {
    ciborium::from_reader(bytes).map_err(|e| StateError::Decode {
        cf: cf.to_string(),
        reason: e.to_string(),
    })
}

/// Handle to a partition's state. Clones share the backend.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open a store on `backend`, writing the schema version on first use.
    ///
    /// A store written by a newer schema is refused.
    pub fn open(backend: impl StateBackend) -> StateResult<Self> {
        let store = Self {
            backend: Arc::new(backend),
        };

        match SCHEMA_VERSION_COLUMN.get(&store, SCHEMA_VERSION_KEY)? {
            Some(found) if found > SCHEMA_VERSION => {
                return Err(StateError::UnsupportedSchema {
                    found,
                    supported: SCHEMA_VERSION,
                });
            }
            Some(found) => debug!(schema_version = found, "Opened existing state"),
            None => {
                let mut txn = store.transaction();
                SCHEMA_VERSION_COLUMN.put(&mut txn, SCHEMA_VERSION_KEY, &SCHEMA_VERSION)?;
                txn.commit()?;
                info!(schema_version = SCHEMA_VERSION, "Initialized empty state");
            }
        }

        Ok(store)
    }

    /// Start a write transaction. Dropping it without commit discards it.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            overlay: BTreeMap::new(),
        }
    }

    /// Read-only handle sharing this store's backend.
    pub fn view(&self) -> StateView {
        StateView {
            store: self.clone(),
        }
    }

    /// Copy of the full state tagged with the processing position.
    ///
    /// The position is taken from the same scan as the entries.
    pub fn snapshot(&self) -> StateResult<StateSnapshot> {
        let scanned = ScannedEntries(self.backend.scan_prefix(&[])?);
        let position = ProcessingPosition::load(&scanned)?;
        let entries = scanned
            .0
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        Ok(StateSnapshot {
            schema_version: SCHEMA_VERSION,
            position,
            entries,
        })
    }

    /// Replace the full state with `snapshot`.
    pub fn restore(&self, snapshot: &StateSnapshot) -> StateResult<()> {
        if snapshot.schema_version > SCHEMA_VERSION {
            return Err(StateError::UnsupportedSchema {
                found: snapshot.schema_version,
                supported: SCHEMA_VERSION,
            });
        }

        let entries = snapshot
            .entries
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        self.backend.replace_all(entries)?;
        info!(
            last_processed = snapshot.position.last_processed_position,
            last_written = snapshot.position.last_written_position,
            "Restored state from snapshot"
        );
        Ok(())
    }

    /// Every entry outside the engine's bookkeeping families, in key order.
    pub fn application_entries(&self) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let first = ColumnFamily::application(0).prefix();
        Ok(self
            .backend
            .scan_prefix(&[])?
            .into_iter()
            .filter(|(k, _)| k.as_slice() >= first.as_slice())
            .collect())
    }
}

/// Entries of one full scan, sorted by key.
struct ScannedEntries(Vec<(Vec<u8>, Vec<u8>)>);

impl StateRead for ScannedEntries {
    fn get_raw(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        Ok(self
            .0
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|i| self.0[i].1.clone()))
    }

    fn scan_raw(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .0
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Read-only access to a partition's state.
///
/// Handed to code outside the stream processor, which stays the only writer.
#[derive(Clone, Debug)]
pub struct StateView {
    store: StateStore,
}

impl StateView {
    /// See [`StateStore::snapshot`]
    pub fn snapshot(&self) -> StateResult<StateSnapshot> {
        self.store.snapshot()
    }

    /// See [`StateStore::application_entries`]
    pub fn application_entries(&self) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.store.application_entries()
    }
}

impl StateRead for StateView {
    fn get_raw(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        self.store.get_raw(key)
    }

    fn scan_raw(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.store.scan_raw(prefix)
    }
}

impl StateRead for StateStore {
    fn get_raw(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        self.backend.get(key)
    }

    fn scan_raw(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.backend.scan_prefix(prefix)
    }
}

/// Buffered writes that become visible atomically on [`Transaction::commit`].
///
/// Reads through the transaction see its own uncommitted writes.
pub struct Transaction<'a> {
    store: &'a StateStore,
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Transaction<'_> {
    pub(crate) fn put_raw(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.overlay.insert(key, Some(value));
    }

    pub(crate) fn delete_raw(&mut self, key: Vec<u8>) {
        self.overlay.insert(key, None);
    }

    /// Whether nothing was written yet
    pub fn is_empty(&self) -> bool {
        self.overlay.is_empty()
    }

    /// Write everything atomically.
    pub fn commit(self) -> StateResult<()> {
        if self.overlay.is_empty() {
            return Ok(());
        }

        let ops = self
            .overlay
            .into_iter()
            .map(|(k, v)| match v {
                Some(v) => WriteOp::Put(k, v),
                None => WriteOp::Delete(k),
            })
            .collect();
        self.store.backend.write(ops)
    }
}

impl StateRead for Transaction<'_> {
    fn get_raw(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        match self.overlay.get(key) {
            Some(value) => Ok(value.clone()),
            None => self.store.backend.get(key),
        }
    }

    fn scan_raw(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.store.backend.scan_prefix(prefix)?.into_iter().collect();

        for (k, v) in self
            .overlay
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match v {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }

        Ok(merged.into_iter().collect())
    }
}
