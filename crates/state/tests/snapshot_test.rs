use conductor_state::{
    Column, ColumnFamily, MemoryStateBackend, ProcessingPosition, StateSnapshot, StateStore,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Counter {
    name: String,
    value: i64,
}

const COUNTERS: Column<i64, Counter> = Column::new(ColumnFamily::application(1));

fn populated_store() -> StateStore {
    let store = StateStore::open(MemoryStateBackend::new()).unwrap();
    let mut txn = store.transaction();
    for key in 1..=3 {
        let counter = Counter {
            name: format!("c{key}"),
            value: key * 10,
        };
        COUNTERS.put(&mut txn, &key, &counter).unwrap();
    }
    ProcessingPosition {
        last_processed_position: 5,
        last_written_position: 6,
    }
    .store(&mut txn)
    .unwrap();
    txn.commit().unwrap();
    store
}

#[test]
fn test_snapshot_restores_into_fresh_store() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let source = populated_store();

    let snapshot = source.snapshot().unwrap();
    assert_eq!(snapshot.position.last_processed_position, 5);

    let encoded = snapshot.encode().unwrap();
    let decoded = StateSnapshot::decode(&encoded).unwrap();
    assert_eq!(decoded, snapshot);

    let target = StateStore::open(MemoryStateBackend::new()).unwrap();
    target.restore(&decoded).unwrap();

    assert_eq!(
        target.application_entries().unwrap(),
        source.application_entries().unwrap()
    );
    assert_eq!(
        ProcessingPosition::load(&target).unwrap(),
        ProcessingPosition::load(&source).unwrap()
    );
    assert_eq!(
        COUNTERS.get(&target, &2).unwrap().map(|c| c.value),
        Some(20)
    );
}

#[test]
fn test_snapshot_from_newer_schema_is_refused() {
    let source = populated_store();
    let mut snapshot = source.snapshot().unwrap();
    snapshot.schema_version += 1;

    let target = StateStore::open(MemoryStateBackend::new()).unwrap();
    assert!(target.restore(&snapshot).is_err());
}

#[test]
fn test_corrupt_snapshot_bytes_fail_to_decode() {
    assert!(StateSnapshot::decode(&[0xff, 0x00, 0x13]).is_err());

    let json = serde_json::json!({"not": "a snapshot"}).to_string();
    assert!(StateSnapshot::decode(json.as_bytes()).is_err());
}
