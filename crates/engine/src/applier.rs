//! Event appliers: the only code that changes application state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use conductor_state::{KeyGenerator, StateError, Transaction};
use thiserror::Error;
use tracing::trace;

use crate::record::{Intent, Record, ValueType};

/// Why an event could not be applied
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Applying the same event later may succeed
    #[error("Transient apply failure: {0}")]
    Transient(String),

    /// State and log disagree; the partition stops
    #[error("Fatal apply failure: {0}")]
    Fatal(String),

    /// The state store failed
    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Applies one kind of event to state.
///
/// Appliers run during processing and during replay and must produce the
/// same state changes in both.
pub trait EventApplier: Send + Sync + 'static {
    /// Stage the state changes of `record` in `txn`
    fn apply_state(
        &self,
        key: i64,
        record: &Record,
        txn: &mut Transaction<'_>,
    ) -> Result<(), ApplyError>;
}

/// Appliers by (value type, intent, version).
#[derive(Clone, Default)]
pub struct EventApplierRegistry {
    appliers: HashMap<(ValueType, Intent), BTreeMap<u16, Arc<dyn EventApplier>>>,
}

impl std::fmt::Debug for EventApplierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.appliers
                    .iter()
                    .map(|(k, versions)| (k, versions.keys().collect::<Vec<_>>())),
            )
            .finish()
    }
}

impl EventApplierRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the version 1 applier of an event
    pub fn with_applier(
        self,
        value_type: impl Into<ValueType>,
        intent: impl Into<Intent>,
        applier: impl EventApplier,
    ) -> Self {
        self.with_versioned_applier(value_type, intent, 1, applier)
    }

    /// Register the applier of one version of an event
    pub fn with_versioned_applier(
        mut self,
        value_type: impl Into<ValueType>,
        intent: impl Into<Intent>,
        version: u16,
        applier: impl EventApplier,
    ) -> Self {
        self.appliers
            .entry((value_type.into(), intent.into()))
            .or_default()
            .insert(version, Arc::new(applier));
        self
    }

    /// Applier for `version`, falling back to the highest registered version
    /// below it.
    pub fn resolve(
        &self,
        value_type: &ValueType,
        intent: &Intent,
        version: u16,
    ) -> Option<&Arc<dyn EventApplier>> {
        self.appliers
            .get(&(value_type.clone(), intent.clone()))?
            .range(..=version)
            .next_back()
            .map(|(_, applier)| applier)
    }

    /// Stage the effects of `record`: its key becomes used, and an event
    /// goes through its applier. Events without an applier change nothing.
    pub(crate) fn apply(
        &self,
        partition_id: u32,
        record: &Record,
        txn: &mut Transaction<'_>,
    ) -> Result<(), ApplyError> {
        KeyGenerator::set_key_if_higher(txn, partition_id, record.key)?;

        if !record.is_event() {
            return Ok(());
        }

        match self.resolve(&record.value_type, &record.intent, record.record_version) {
            Some(applier) => applier.apply_state(record.key, record, txn),
            None => {
                trace!(
                    position = record.position,
                    value_type = %record.value_type,
                    intent = %record.intent,
                    "No applier for event"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_state::{Column, ColumnFamily, MemoryStateBackend, StateStore};
    use serde_json::json;

    const SEEN: Column<str, u16> = Column::new(ColumnFamily::application(0));

    struct Version(u16);

    impl EventApplier for Version {
        fn apply_state(
            &self,
            _key: i64,
            _record: &Record,
            txn: &mut Transaction<'_>,
        ) -> Result<(), ApplyError> {
            SEEN.put(txn, "applied", &self.0)?;
            Ok(())
        }
    }

    fn event(version: u16) -> Record {
        let mut record = Record::command("JOB", "CREATED", json!({}));
        record.record_type = crate::record::RecordType::Event;
        record.record_version = version;
        record
    }

    #[test]
    fn test_version_falls_back_to_highest_below() {
        let registry = EventApplierRegistry::new()
            .with_applier("JOB", "CREATED", Version(1))
            .with_versioned_applier("JOB", "CREATED", 3, Version(3));

        let resolved = |version| {
            registry
                .resolve(&"JOB".into(), &"CREATED".into(), version)
                .is_some()
        };
        assert!(!resolved(0));
        assert!(resolved(2));

        let store = StateStore::open(MemoryStateBackend::new()).unwrap();
        for (version, expected) in [(1, 1), (2, 1), (3, 3), (7, 3)] {
            let mut txn = store.transaction();
            registry.apply(1, &event(version), &mut txn).unwrap();
            assert_eq!(SEEN.get(&txn, "applied").unwrap(), Some(expected));
        }
    }

    #[test]
    fn test_commands_only_mark_their_key() {
        let registry = EventApplierRegistry::new().with_applier("JOB", "CREATED", Version(1));
        let store = StateStore::open(MemoryStateBackend::new()).unwrap();

        let key = (1i64 << 51) + 5;
        let command = Record::command("JOB", "CREATED", json!({})).with_key(key);
        let mut txn = store.transaction();
        registry.apply(1, &command, &mut txn).unwrap();
        txn.commit().unwrap();

        assert_eq!(SEEN.get(&store, "applied").unwrap(), None);
        assert_eq!(KeyGenerator::load(1, &store).unwrap().peek(), key + 1);
    }
}
