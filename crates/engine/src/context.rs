//! What a command processor sees and writes while processing one command.

use conductor_state::{KeyGenerator, StateRead};

use crate::batch::RecordBatch;
use crate::config::StreamProcessorConfig;
use crate::processor::ProcessingError;
use crate::record::{Intent, RECORD_VERSION, Record, RecordType, RejectionType, ValueType};
use crate::response::{CommandResponse, StagedResponse};

/// Error a post-commit task may fail with
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Side effect run once the batch is durable and applied.
///
/// Returning `Ok(false)` asks for another attempt later; an error is
/// logged and the task is dropped.
pub type PostCommitTask = Box<dyn FnMut() -> Result<bool, TaskError> + Send>;

/// Everything one processing step produced
pub(crate) struct ProcessingOutcome {
    pub(crate) records: Vec<Record>,
    pub(crate) response: Option<StagedResponse>,
    pub(crate) post_commit: Vec<PostCommitTask>,
}

/// Read-only state plus the writers of one processing step.
///
/// Nothing written here is visible until the engine has appended the batch
/// and applied its events.
pub struct ProcessingContext<'a> {
    command: &'a Record,
    state: &'a dyn StateRead,
    keys: KeyGenerator,
    batch: RecordBatch,
    response: Option<CommandResponse>,
    post_commit: Vec<PostCommitTask>,
}

impl<'a> ProcessingContext<'a> {
    pub(crate) fn new(
        command: &'a Record,
        state: &'a dyn StateRead,
        keys: KeyGenerator,
        config: &StreamProcessorConfig,
    ) -> Self {
        Self {
            command,
            state,
            keys,
            batch: RecordBatch::new(config.max_batch_bytes, config.max_batch_records),
            response: None,
            post_commit: Vec::new(),
        }
    }

    /// Current state of the partition
    pub fn state(&self) -> &'a dyn StateRead {
        self.state
    }

    /// Partition the command is processed on
    pub fn partition_id(&self) -> u32 {
        self.keys.partition_id()
    }

    /// A fresh key for a new entity
    pub fn next_key(&mut self) -> Result<i64, ProcessingError> {
        Ok(self.keys.next_key()?)
    }

    fn follow_up(
        &self,
        record_type: RecordType,
        key: i64,
        value_type: ValueType,
        intent: Intent,
        record_version: u16,
        value: serde_json::Value,
    ) -> Record {
        Record {
            position: conductor_storage::NO_POSITION,
            source_record_position: self.command.position,
            key,
            timestamp: self.command.timestamp,
            partition_id: self.partition_id(),
            record_type,
            value_type,
            intent,
            record_version,
            rejection_type: None,
            rejection_reason: None,
            request_id: None,
            request_stream_id: None,
            value,
        }
    }

    /// Write an event about the command's value type
    pub fn append_follow_up_event(
        &mut self,
        key: i64,
        intent: impl Into<Intent>,
        value: serde_json::Value,
    ) -> Result<(), ProcessingError> {
        let value_type = self.command.value_type.clone();
        self.append_versioned_event(key, value_type, intent, RECORD_VERSION, value)
    }

    /// Write an event of any value type, applied by the applier of `version`
    pub fn append_versioned_event(
        &mut self,
        key: i64,
        value_type: impl Into<ValueType>,
        intent: impl Into<Intent>,
        version: u16,
        value: serde_json::Value,
    ) -> Result<(), ProcessingError> {
        let record = self.follow_up(
            RecordType::Event,
            key,
            value_type.into(),
            intent.into(),
            version,
            value,
        );
        self.batch.append(record)
    }

    /// Write a command that is processed after this one
    pub fn append_follow_up_command(
        &mut self,
        key: i64,
        value_type: impl Into<ValueType>,
        intent: impl Into<Intent>,
        value: serde_json::Value,
    ) -> Result<(), ProcessingError> {
        let record = self.follow_up(
            RecordType::Command,
            key,
            value_type.into(),
            intent.into(),
            RECORD_VERSION,
            value,
        );
        self.batch.append(record)
    }

    /// Refuse the command and tell the client why.
    pub fn append_rejection(
        &mut self,
        intent: impl Into<Intent>,
        value: serde_json::Value,
        rejection_type: RejectionType,
        reason: impl Into<String>,
    ) -> Result<(), ProcessingError> {
        let reason = reason.into();
        let mut record = self.follow_up(
            RecordType::CommandRejection,
            self.command.key,
            self.command.value_type.clone(),
            intent.into(),
            RECORD_VERSION,
            value,
        );
        record.rejection_type = Some(rejection_type);
        record.rejection_reason = Some(reason.clone());

        self.response = Some(CommandResponse {
            key: record.key,
            record_type: RecordType::CommandRejection,
            value_type: record.value_type.clone(),
            intent: record.intent.clone(),
            value: record.value.clone(),
            rejection_type: Some(rejection_type),
            rejection_reason: Some(reason),
        });
        self.batch.append(record)
    }

    /// Refuse the command as it was submitted
    pub fn reject(
        &mut self,
        rejection_type: RejectionType,
        reason: impl Into<String>,
    ) -> Result<(), ProcessingError> {
        let intent = self.command.intent.clone();
        let value = self.command.value.clone();
        self.append_rejection(intent, value, rejection_type, reason)
    }

    /// Answer the client. A later response replaces an earlier one.
    pub fn append_response(
        &mut self,
        key: i64,
        intent: impl Into<Intent>,
        value: serde_json::Value,
    ) {
        self.response = Some(CommandResponse {
            key,
            record_type: RecordType::Event,
            value_type: self.command.value_type.clone(),
            intent: intent.into(),
            value,
            rejection_type: None,
            rejection_reason: None,
        });
    }

    /// Run `task` after the batch is durable and applied
    pub fn append_post_commit_task(
        &mut self,
        task: impl FnMut() -> Result<bool, TaskError> + Send + 'static,
    ) {
        self.post_commit.push(Box::new(task));
    }

    /// Number of records written so far
    pub fn written(&self) -> usize {
        self.batch.len()
    }

    pub(crate) fn finish(self) -> ProcessingOutcome {
        let response = self
            .response
            .and_then(|response| StagedResponse::for_command(self.command, response));

        ProcessingOutcome {
            records: self.batch.into_records(),
            response,
            post_commit: self.post_commit,
        }
    }
}
