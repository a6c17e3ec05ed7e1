//! A counter application and partition helpers shared by the engine tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conductor_engine::{
    ApplyError, CommandProcessor, EventApplier, EventApplierRegistry, Exporter,
    ExporterController, ExporterError, Partition, PartitionBuilder, PartitionConfig, Phase,
    ProcessingContext, ProcessingError, ProcessorRegistry, Record, RejectionType,
};
use conductor_raft::RaftConfig;
use conductor_state::{Column, ColumnFamily, MemoryStateBackend, StateRead, StateStore, Transaction};
use conductor_storage::{BlockLog, StorageManager};
use conductor_storage_memory::MemoryStorage;
use serde_json::json;
use tokio::time::{Instant, sleep};

pub const COUNTER: &str = "COUNTER";
pub const COUNTERS: Column<i64, i64> = Column::new(ColumnFamily::application(1));

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("conductor_engine=debug,conductor_raft=info")
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> PartitionConfig {
    let mut config = PartitionConfig::for_partition(1);
    config.processor.min_backoff = Duration::from_millis(10);
    config.processor.max_backoff = Duration::from_millis(50);
    config.exporter.min_backoff = Duration::from_millis(10);
    config.exporter.max_backoff = Duration::from_millis(50);
    config.request_timeout = Duration::from_secs(5);
    config.raft = RaftConfig {
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(30),
        replication_timeout: Duration::from_millis(100),
        max_append_retries: 3,
        max_entries_per_append: 16,
    };
    config
}

/// Creates a counter with a fresh key, starting at `value` or 0
pub struct Create;

impl CommandProcessor for Create {
    fn process(
        &self,
        command: &Record,
        ctx: &mut ProcessingContext<'_>,
    ) -> Result<(), ProcessingError> {
        let key = ctx.next_key()?;
        let value = json!({ "value": command.value["value"].as_i64().unwrap_or(0) });
        ctx.append_follow_up_event(key, "CREATED", value.clone())?;
        ctx.append_response(key, "CREATED", value);
        Ok(())
    }
}

/// Adds one to an existing counter
pub struct Increment;

impl CommandProcessor for Increment {
    fn process(
        &self,
        command: &Record,
        ctx: &mut ProcessingContext<'_>,
    ) -> Result<(), ProcessingError> {
        let Some(current) = COUNTERS.get(ctx.state(), &command.key)? else {
            return ctx.reject(
                RejectionType::NotFound,
                format!("No counter with key {}", command.key),
            );
        };
        let value = json!({ "value": current + 1 });
        ctx.append_follow_up_event(command.key, "INCREMENTED", value.clone())?;
        ctx.append_response(command.key, "INCREMENTED", value);
        Ok(())
    }
}

/// Always fails
pub struct Fail;

impl CommandProcessor for Fail {
    fn process(&self, _: &Record, _: &mut ProcessingContext<'_>) -> Result<(), ProcessingError> {
        Err(ProcessingError::Failed("counter is broken".to_string()))
    }
}

/// Writes more events than any small batch holds
pub struct Spam;

impl CommandProcessor for Spam {
    fn process(&self, _: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), ProcessingError> {
        for i in 0..64 {
            let key = ctx.next_key()?;
            ctx.append_follow_up_event(key, "CREATED", json!({ "value": i }))?;
        }
        Ok(())
    }
}

/// Registers a post-commit task that wants a second attempt
pub struct Notify {
    pub calls: Arc<AtomicUsize>,
}

impl CommandProcessor for Notify {
    fn process(&self, _: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), ProcessingError> {
        let calls = self.calls.clone();
        ctx.append_post_commit_task(move || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(attempt >= 2)
        });
        ctx.append_response(-1, "NOTIFIED", json!({}));
        Ok(())
    }
}

struct StoreValue;

impl EventApplier for StoreValue {
    fn apply_state(
        &self,
        key: i64,
        record: &Record,
        txn: &mut Transaction<'_>,
    ) -> Result<(), ApplyError> {
        let value = record.value["value"]
            .as_i64()
            .ok_or_else(|| ApplyError::Fatal("counter event without value".to_string()))?;
        COUNTERS.put(txn, &key, &value)?;
        Ok(())
    }
}

pub fn processors() -> ProcessorRegistry {
    ProcessorRegistry::new()
        .with_processor(COUNTER, "CREATE", Create)
        .with_processor(COUNTER, "INCREMENT", Increment)
        .with_processor(COUNTER, "FAIL", Fail)
        .with_processor(COUNTER, "SPAM", Spam)
}

pub fn appliers() -> EventApplierRegistry {
    EventApplierRegistry::new()
        .with_applier(COUNTER, "CREATED", StoreValue)
        .with_applier(COUNTER, "INCREMENTED", StoreValue)
}

pub async fn open_log(storage: &MemoryStorage) -> BlockLog<MemoryStorage> {
    StorageManager::new(storage.clone())
        .open_partition_log(1)
        .await
        .unwrap()
}

pub fn open_state(backend: &MemoryStateBackend) -> StateStore {
    StateStore::open(backend.clone()).unwrap()
}

pub fn builder(
    log: BlockLog<MemoryStorage>,
    state: StateStore,
) -> PartitionBuilder<MemoryStorage> {
    PartitionBuilder::new()
        .with_config(test_config())
        .with_log(log)
        .with_state(state)
        .with_processors(processors())
        .with_appliers(appliers())
}

/// A standalone partition over `storage` and `backend`, ready to process
pub async fn start_partition(
    storage: &MemoryStorage,
    backend: &MemoryStateBackend,
) -> Partition<MemoryStorage> {
    let partition = builder(open_log(storage).await, open_state(backend))
        .build()
        .await
        .unwrap();
    partition
        .processor()
        .wait_for_phase(Phase::Processing, Duration::from_secs(5))
        .await
        .unwrap();
    partition
}

pub fn counter<R: StateRead + ?Sized>(state: &R, key: i64) -> Option<i64> {
    COUNTERS.get(state, &key).unwrap()
}

pub fn counter_count<R: StateRead + ?Sized>(state: &R) -> usize {
    COUNTERS.count(state).unwrap()
}

pub fn create(value: i64) -> Record {
    Record::command(COUNTER, "CREATE", json!({ "value": value }))
}

pub fn increment(key: i64) -> Record {
    Record::command(COUNTER, "INCREMENT", json!({})).with_key(key)
}

pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

/// Keeps every exported record and acknowledges it, after failing the
/// first `failures` attempts.
pub struct CollectingExporter {
    id: String,
    pub records: Arc<Mutex<Vec<Record>>>,
    failures: Arc<AtomicUsize>,
    controller: Option<ExporterController>,
}

impl CollectingExporter {
    pub fn new(id: &str, failures: usize) -> Self {
        Self {
            id: id.to_string(),
            records: Arc::default(),
            failures: Arc::new(AtomicUsize::new(failures)),
            controller: None,
        }
    }

    pub fn positions(records: &Arc<Mutex<Vec<Record>>>) -> Vec<i64> {
        records
            .lock()
            .unwrap()
            .iter()
            .map(|record| record.position)
            .collect()
    }
}

#[async_trait]
impl Exporter for CollectingExporter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&mut self, controller: ExporterController) -> Result<(), ExporterError> {
        self.controller = Some(controller);
        Ok(())
    }

    async fn export(&mut self, record: &Record) -> Result<(), ExporterError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ExporterError("sink unavailable".to_string()));
        }

        if let Some(controller) = &self.controller {
            controller
                .acknowledge(record.position)
                .map_err(|e| ExporterError(e.to_string()))?;
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
