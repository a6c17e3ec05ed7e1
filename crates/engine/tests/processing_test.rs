//! Command processing on a standalone partition.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use conductor_engine::{Phase, Record, RecordType, RejectionType, decode_records};
use conductor_state::{MemoryStateBackend, partition_id_of};
use conductor_storage_memory::MemoryStorage;
use serde_json::json;

mod common;
use common::*;

#[tokio::test]
async fn test_create_hands_out_increasing_keys() {
    init_tracing();
    let storage = MemoryStorage::new();
    let backend = MemoryStateBackend::new();
    let partition = start_partition(&storage, &backend).await;

    let first = partition.submit(create(5)).await.unwrap();
    assert!(!first.is_rejection());
    assert_eq!(first.record_type, RecordType::Event);
    assert_eq!(first.intent.as_str(), "CREATED");
    assert_eq!(first.value, json!({ "value": 5 }));
    assert_eq!(partition_id_of(first.key), 1);

    let second = partition.submit(create(0)).await.unwrap();
    assert!(second.key > first.key);

    let incremented = partition.submit(increment(first.key)).await.unwrap();
    assert_eq!(incremented.key, first.key);
    assert_eq!(counter(partition.state(), first.key), Some(6));
    assert_eq!(counter(partition.state(), second.key), Some(0));

    let position = partition.processor().position();
    assert_eq!(position.last_processed_position, 5);
    assert_eq!(position.last_written_position, 6);

    partition.close().await;
    assert_eq!(partition.processor().phase(), Phase::Closed);
}

#[tokio::test]
async fn test_follow_ups_reference_their_command() {
    init_tracing();
    let storage = MemoryStorage::new();
    let backend = MemoryStateBackend::new();
    let partition = start_partition(&storage, &backend).await;

    let command = create(1);
    let timestamp = command.timestamp;
    partition.submit(command).await.unwrap();

    let mut reader = partition.log().new_reader();
    reader.seek_to_first().unwrap();
    let mut records = Vec::new();
    while let Some(block) = reader.next().await.unwrap() {
        records.extend(decode_records(&block).unwrap());
    }

    assert_eq!(records.len(), 2);
    let (command, event) = (&records[0], &records[1]);
    assert!(command.is_command());
    assert!(command.request_id.is_some());
    assert_eq!(event.source_record_position, command.position);
    assert_eq!(event.position, command.position + 1);
    assert_eq!(event.timestamp, timestamp);
    assert_eq!(event.partition_id, 1);
    assert!(event.request_id.is_none());

    partition.close().await;
}

#[tokio::test]
async fn test_unknown_commands_are_rejected_as_unimplemented() {
    init_tracing();
    let storage = MemoryStorage::new();
    let backend = MemoryStateBackend::new();
    let partition = start_partition(&storage, &backend).await;

    let response = partition
        .submit(Record::command(COUNTER, "RESET", json!({})))
        .await
        .unwrap();
    assert!(response.is_rejection());
    assert_eq!(response.rejection_type, Some(RejectionType::Unimplemented));
    assert_eq!(response.intent.as_str(), "RESET");

    partition.close().await;
}

#[tokio::test]
async fn test_processor_rejection_leaves_state_alone() {
    init_tracing();
    let storage = MemoryStorage::new();
    let backend = MemoryStateBackend::new();
    let partition = start_partition(&storage, &backend).await;

    let response = partition.submit(increment(42)).await.unwrap();
    assert!(response.is_rejection());
    assert_eq!(response.rejection_type, Some(RejectionType::NotFound));
    assert_eq!(response.key, 42);
    assert_eq!(counter_count(partition.state()), 0);

    partition.close().await;
}

#[tokio::test]
async fn test_processing_errors_become_rejections() {
    init_tracing();
    let storage = MemoryStorage::new();
    let backend = MemoryStateBackend::new();
    let partition = start_partition(&storage, &backend).await;

    let response = partition
        .submit(Record::command(COUNTER, "FAIL", json!({})))
        .await
        .unwrap();
    assert_eq!(response.rejection_type, Some(RejectionType::ProcessingError));
    assert!(
        response
            .rejection_reason
            .as_deref()
            .unwrap()
            .contains("counter is broken")
    );

    // the partition keeps going
    let created = partition.submit(create(0)).await.unwrap();
    assert!(!created.is_rejection());
    assert_eq!(partition.processor().phase(), Phase::Processing);

    partition.close().await;
}

#[tokio::test]
async fn test_oversized_batch_is_rejected() {
    init_tracing();
    let storage = MemoryStorage::new();
    let backend = MemoryStateBackend::new();
    let mut config = test_config();
    config.processor.max_batch_records = 8;

    let partition = builder(open_log(&storage).await, open_state(&backend))
        .with_config(config)
        .build()
        .await
        .unwrap();
    partition
        .processor()
        .wait_for_phase(Phase::Processing, Duration::from_secs(5))
        .await
        .unwrap();

    let response = partition
        .submit(Record::command(COUNTER, "SPAM", json!({})))
        .await
        .unwrap();
    assert_eq!(
        response.rejection_type,
        Some(RejectionType::ExceededBatchRecordSize)
    );
    assert_eq!(counter_count(partition.state()), 0);

    partition.close().await;
}

#[tokio::test]
async fn test_post_commit_tasks_retry_until_done() {
    init_tracing();
    let storage = MemoryStorage::new();
    let backend = MemoryStateBackend::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let processors = processors().with_processor(
        COUNTER,
        "NOTIFY",
        Notify {
            calls: calls.clone(),
        },
    );
    let partition = builder(open_log(&storage).await, open_state(&backend))
        .with_processors(processors)
        .build()
        .await
        .unwrap();
    partition
        .processor()
        .wait_for_phase(Phase::Processing, Duration::from_secs(5))
        .await
        .unwrap();

    let response = partition
        .submit(Record::command(COUNTER, "NOTIFY", json!({})))
        .await
        .unwrap();
    assert_eq!(response.intent.as_str(), "NOTIFIED");

    eventually("the task to succeed", || calls.load(Ordering::SeqCst) == 2).await;
    // a command without records still counts as processed
    assert_eq!(partition.processor().position().last_processed_position, 1);
    assert_eq!(partition.processor().position().last_written_position, -1);

    partition.close().await;
}

#[tokio::test]
async fn test_paused_processor_holds_commands() {
    init_tracing();
    let storage = MemoryStorage::new();
    let backend = MemoryStateBackend::new();
    let partition = Arc::new(start_partition(&storage, &backend).await);

    partition.processor().pause().await.unwrap();
    assert_eq!(partition.processor().phase(), Phase::Suspended);

    let submitted = tokio::spawn({
        let partition = partition.clone();
        async move { partition.submit(create(3)).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!submitted.is_finished());
    assert_eq!(counter_count(partition.state()), 0);

    partition.processor().resume().await.unwrap();
    let response = submitted.await.unwrap().unwrap();
    assert_eq!(counter(partition.state(), response.key), Some(3));
    assert_eq!(partition.processor().phase(), Phase::Processing);

    partition.close().await;
}

#[tokio::test]
async fn test_submit_refuses_events() {
    init_tracing();
    let storage = MemoryStorage::new();
    let backend = MemoryStateBackend::new();
    let partition = start_partition(&storage, &backend).await;

    let mut event = create(0);
    event.record_type = RecordType::Event;
    assert!(partition.submit(event).await.is_err());

    partition.close().await;
    let err = partition.submit(create(0)).await.unwrap_err();
    assert!(err.is_not_leader());
}
