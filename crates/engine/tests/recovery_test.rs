//! Restarts, replay, snapshots and failed appends.

use std::sync::Arc;
use std::time::Duration;

use conductor_engine::{
    ErrorKind, LogStream, Phase, RecordType, StandaloneWriter, StartupCondition, decode_records,
};
use conductor_state::MemoryStateBackend;
use conductor_storage::{BlockLog, StorageAdaptor};
use conductor_storage_memory::MemoryStorage;
use serde_json::json;

mod common;
use common::*;

async fn all_records<S: StorageAdaptor>(log: &BlockLog<S>) -> Vec<conductor_engine::Record> {
    let mut reader = log.new_reader();
    reader.seek_to_first().unwrap();
    let mut records = Vec::new();
    while let Some(block) = reader.next().await.unwrap() {
        records.extend(decode_records(&block).unwrap());
    }
    records
}

#[tokio::test]
async fn test_failed_append_is_retried_without_gaps() {
    init_tracing();
    let storage = MemoryStorage::new();
    let backend = MemoryStateBackend::new();
    let partition = Arc::new(start_partition(&storage, &backend).await);

    partition.processor().pause().await.unwrap();
    let submitted = tokio::spawn({
        let partition = partition.clone();
        async move { partition.submit(create(7)).await }
    });
    eventually("the command to be committed", || {
        partition.log().commit_watermark().position == 1
    })
    .await;

    storage.fail_next_appends(1);
    partition.processor().resume().await.unwrap();
    let response = submitted.await.unwrap().unwrap();
    assert_eq!(counter(partition.state(), response.key), Some(7));

    let records = all_records(partition.log()).await;
    let positions: Vec<i64> = records.iter().map(|r| r.position).collect();
    assert_eq!(positions, vec![1, 2]);
    assert_eq!(records[1].record_type, RecordType::Event);

    partition.close().await;
}

#[tokio::test]
async fn test_transient_state_failure_is_retried() {
    init_tracing();
    let storage = MemoryStorage::new();
    let backend = MemoryStateBackend::new();
    let partition = start_partition(&storage, &backend).await;

    backend.fail_next_writes(2);
    let response = partition.submit(create(1)).await.unwrap();
    assert_eq!(counter(partition.state(), response.key), Some(1));
    assert_eq!(partition.processor().phase(), Phase::Processing);
    // the batch was written once
    assert_eq!(all_records(partition.log()).await.len(), 2);

    partition.close().await;
}

#[tokio::test]
async fn test_restart_applies_appended_events_exactly_once() {
    init_tracing();
    let storage = MemoryStorage::new();
    let key = (1i64 << 51) + 1;

    // a command and its event made it to the log, the state did not
    {
        let log = open_log(&storage).await;
        let stream = LogStream::new(1, Arc::new(StandaloneWriter::start(log)));
        stream.reset(0).await;
        stream.write_batch(vec![create(10)]).await.unwrap();

        let mut event = create(10);
        event.record_type = RecordType::Event;
        event.intent = "CREATED".into();
        event.key = key;
        event.source_record_position = 1;
        event.value = json!({ "value": 10 });
        stream.write_batch(vec![event]).await.unwrap();
    }

    let backend = MemoryStateBackend::new();
    let partition = start_partition(&storage, &backend).await;
    assert_eq!(counter(partition.state(), key), Some(10));
    assert_eq!(counter_count(partition.state()), 1);
    let position = partition.processor().position();
    assert_eq!(position.last_processed_position, 1);
    assert_eq!(position.last_written_position, 2);

    // the command is not processed again, and its key stays taken
    let next = partition.submit(create(0)).await.unwrap();
    assert!(next.key > key);
    assert_eq!(counter_count(partition.state()), 2);
    assert_eq!(all_records(partition.log()).await.len(), 4);

    partition.close().await;
}

#[tokio::test]
async fn test_replay_rebuilds_identical_state() {
    init_tracing();
    let storage = MemoryStorage::new();
    let live = MemoryStateBackend::new();
    let partition = start_partition(&storage, &live).await;

    let first = partition.submit(create(1)).await.unwrap();
    let second = partition.submit(create(2)).await.unwrap();
    partition.submit(increment(first.key)).await.unwrap();
    partition.submit(increment(second.key)).await.unwrap();
    partition.submit(increment(99)).await.unwrap();
    let live_position = partition.processor().position();
    partition.close().await;

    let replayed = MemoryStateBackend::new();
    let restarted = start_partition(&storage, &replayed).await;
    assert_eq!(restarted.processor().position(), live_position);
    assert_eq!(
        open_state(&live).application_entries().unwrap(),
        restarted.state().application_entries().unwrap()
    );
    assert_eq!(counter(restarted.state(), first.key), Some(2));

    // processing continues where it left off
    let third = restarted.submit(create(0)).await.unwrap();
    assert!(third.key > second.key);
    restarted.close().await;
}

#[tokio::test]
async fn test_snapshot_restores_lost_state() {
    init_tracing();
    let storage = MemoryStorage::new();
    let backend = MemoryStateBackend::new();
    let partition = start_partition(&storage, &backend).await;

    let first = partition.submit(create(4)).await.unwrap();
    let snapshot = partition.take_snapshot().await.unwrap();
    assert_eq!(snapshot.position.last_processed_position, 1);
    let second = partition.submit(create(5)).await.unwrap();
    partition.close().await;

    let fresh = MemoryStateBackend::new();
    let restarted = start_partition(&storage, &fresh).await;
    assert_eq!(counter(restarted.state(), first.key), Some(4));
    assert_eq!(counter(restarted.state(), second.key), Some(5));
    assert_eq!(
        restarted.latest_snapshot().await.unwrap().unwrap().position,
        snapshot.position
    );
    restarted.close().await;
}

#[tokio::test]
async fn test_startup_aborts_on_conditions_not_allowed() {
    init_tracing();
    let storage = MemoryStorage::new();
    let backend = MemoryStateBackend::new();

    let mut config = test_config();
    config.ignorable_startup_conditions = vec![];
    let err = builder(open_log(&storage).await, open_state(&backend))
        .with_config(config)
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidState));

    let mut config = test_config();
    config.ignorable_startup_conditions = vec![StartupCondition::MissingSnapshot];
    let err = builder(open_log(&storage).await, open_state(&backend))
        .with_config(config)
        .with_exporter(CollectingExporter::new("audit", 0))
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidState));
}

#[tokio::test]
async fn test_builder_requires_log_and_state() {
    let err = conductor_engine::PartitionBuilder::<MemoryStorage>::new()
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Configuration));

    let mut config = test_config();
    config.processor.max_backoff = Duration::from_millis(1);
    let storage = MemoryStorage::new();
    let err = builder(open_log(&storage).await, open_state(&MemoryStateBackend::new()))
        .with_config(config)
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Configuration));

    // keys of partition 4096 would not fit into 63 bits
    let mut config = test_config();
    config.partition_id = 4096;
    let err = builder(open_log(&storage).await, open_state(&MemoryStateBackend::new()))
        .with_config(config)
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Configuration));
}
