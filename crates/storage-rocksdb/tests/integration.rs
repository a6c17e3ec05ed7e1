use bytes::Bytes;
use conductor_state::{Column, ColumnFamily, StateStore};
use conductor_storage::{BlockLog, LogBlock, LogStorage, StorageAdaptor, StorageNamespace};
use conductor_storage_rocksdb::{RocksDbConfig, RocksDbStorage};
use tempfile::TempDir;

#[tokio::test]
async fn test_basic_operations() {
    let temp_dir = TempDir::new().unwrap();
    let storage = RocksDbStorage::new(temp_dir.path()).await.unwrap();
    let namespace = StorageNamespace::new("test_basic");

    assert_eq!(storage.bounds(&namespace).await.unwrap(), None);

    let entries = vec![
        (1, Bytes::from("entry 1")),
        (2, Bytes::from("entry 2")),
        (3, Bytes::from("entry 3")),
    ];
    storage.append(&namespace, entries).await.unwrap();
    assert_eq!(storage.bounds(&namespace).await.unwrap(), Some((1, 3)));

    let read = storage.read_range(&namespace, 1, 4).await.unwrap();
    assert_eq!(read.len(), 3);
    assert_eq!(read[0], (1, Bytes::from("entry 1")));
    assert_eq!(read[2], (3, Bytes::from("entry 3")));

    let partial = storage.read_range(&namespace, 2, 3).await.unwrap();
    assert_eq!(partial, vec![(2, Bytes::from("entry 2"))]);
}

#[tokio::test]
async fn test_truncate_and_compact() {
    let temp_dir = TempDir::new().unwrap();
    let storage = RocksDbStorage::new(temp_dir.path()).await.unwrap();
    let namespace = StorageNamespace::new("test_truncate");

    let entries = (1..=10).map(|i| (i, Bytes::from(format!("e{i}")))).collect();
    storage.append(&namespace, entries).await.unwrap();

    storage.truncate_after(&namespace, 7).await.unwrap();
    assert_eq!(storage.bounds(&namespace).await.unwrap(), Some((1, 7)));

    storage.compact_before(&namespace, 3).await.unwrap();
    assert_eq!(storage.bounds(&namespace).await.unwrap(), Some((4, 7)));

    let remaining = storage.read_range(&namespace, 1, 100).await.unwrap();
    let indices: Vec<u64> = remaining.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, vec![4, 5, 6, 7]);
}

#[tokio::test]
async fn test_persistence_across_restart() {
    let temp_dir = TempDir::new().unwrap();
    let namespace = StorageNamespace::new("partition-1");

    {
        let storage = RocksDbStorage::new(temp_dir.path()).await.unwrap();
        let log = BlockLog::open(storage.clone(), namespace.clone())
            .await
            .unwrap();
        log.append(LogBlock::initial(1)).await.unwrap();
        log.append(LogBlock::application(1, 1, 3, Bytes::from("abc")))
            .await
            .unwrap();
        storage
            .set_metadata(&namespace, "term", Bytes::from_static(&[1]))
            .await
            .unwrap();
        storage.shutdown().await.unwrap();
    }

    let storage = RocksDbStorage::new(temp_dir.path()).await.unwrap();
    assert_eq!(
        storage.get_metadata(&namespace, "term").await.unwrap(),
        Some(Bytes::from_static(&[1]))
    );
    assert_eq!(storage.get_metadata(&namespace, "vote").await.unwrap(), None);

    let log = BlockLog::open(storage, namespace).await.unwrap();
    assert_eq!(log.last_index(), 2);
    assert_eq!(log.last_term(), 1);
    let block = log.read(2).await.unwrap().unwrap();
    assert_eq!((block.lowest_position, block.highest_position), (1, 3));
    assert_eq!(log.seek_index(2), Some(2));
}

#[tokio::test]
async fn test_namespaces_are_isolated() {
    let temp_dir = TempDir::new().unwrap();
    let storage = RocksDbStorage::with_config(RocksDbConfig::new(temp_dir.path()).without_sync())
        .await
        .unwrap();

    let a = StorageNamespace::new("partition-1");
    let b = StorageNamespace::new("partition-2");
    storage
        .append(&a, vec![(1, Bytes::from("a1"))])
        .await
        .unwrap();
    storage
        .append(&b, vec![(5, Bytes::from("b5"))])
        .await
        .unwrap();

    assert_eq!(storage.bounds(&a).await.unwrap(), Some((1, 1)));
    assert_eq!(storage.bounds(&b).await.unwrap(), Some((5, 5)));
}

const COUNTS: Column<u64, u64> = Column::new(ColumnFamily::application(1));

#[tokio::test]
async fn test_state_backend_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();

    {
        let storage = RocksDbStorage::new(temp_dir.path()).await.unwrap();
        let state = StateStore::open(storage.state_backend().unwrap()).unwrap();
        let mut txn = state.transaction();
        COUNTS.put(&mut txn, &1, &10).unwrap();
        COUNTS.put(&mut txn, &2, &20).unwrap();
        txn.commit().unwrap();

        let mut txn = state.transaction();
        COUNTS.delete(&mut txn, &1);
        txn.commit().unwrap();
        storage.shutdown().await.unwrap();
    }

    let storage = RocksDbStorage::new(temp_dir.path()).await.unwrap();
    let state = StateStore::open(storage.state_backend().unwrap()).unwrap();
    assert_eq!(COUNTS.get(&state, &1).unwrap(), None);
    assert_eq!(COUNTS.get(&state, &2).unwrap(), Some(20));
    assert_eq!(COUNTS.values(&state).unwrap(), vec![20]);
}

#[tokio::test]
async fn test_state_snapshot_restore_replaces_content() {
    let temp_dir = TempDir::new().unwrap();
    let storage = RocksDbStorage::new(temp_dir.path()).await.unwrap();
    let state = StateStore::open(storage.state_backend().unwrap()).unwrap();

    let mut txn = state.transaction();
    COUNTS.put(&mut txn, &1, &1).unwrap();
    txn.commit().unwrap();
    let snapshot = state.snapshot().unwrap();

    let mut txn = state.transaction();
    COUNTS.put(&mut txn, &2, &2).unwrap();
    txn.commit().unwrap();
    assert_eq!(COUNTS.count(&state).unwrap(), 2);

    state.restore(&snapshot).unwrap();
    assert_eq!(COUNTS.values(&state).unwrap(), vec![1]);
}
