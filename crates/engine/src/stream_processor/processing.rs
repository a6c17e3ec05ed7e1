//! Command processing of the leader.

use conductor_state::KeyGenerator;
use conductor_storage::StorageAdaptor;
use tracing::{debug, trace, warn};

use super::StreamProcessor;
use crate::context::{PostCommitTask, ProcessingContext, ProcessingOutcome};
use crate::error::{EngineResult, Error, ErrorKind};
use crate::processor::ProcessingError;
use crate::record::{Record, RejectionType};

impl<S: StorageAdaptor> StreamProcessor<S> {
    async fn next_record(&mut self) -> EngineResult<Option<Record>> {
        if let Some(record) = self.buffered.pop_front() {
            return Ok(Some(record));
        }
        match self.read_block().await? {
            Some(records) => {
                self.buffered.extend(records);
                Ok(self.buffered.pop_front())
            }
            None => Ok(None),
        }
    }

    /// Handle the next committed record. Returns whether one was available.
    pub(super) async fn process_next(&mut self) -> EngineResult<bool> {
        let Some(record) = self.next_record().await? else {
            return Ok(false);
        };

        if record.is_command() && record.position > self.position.last_processed_position {
            self.process_command(record).await?;
        } else if record.is_follow_up() && record.position > self.position.last_written_position {
            // written by an earlier leader after the last replayed block
            self.apply_with_retry(std::slice::from_ref(&record), None)
                .await?;
        }
        Ok(true)
    }

    async fn process_command(&mut self, command: Record) -> EngineResult<()> {
        let mut schedule = self.retry_schedule();
        loop {
            let outcome = match self.run_processor(&command) {
                Ok(outcome) => outcome,
                Err(e) if e.is_transient() => {
                    self.backoff(&mut schedule, &e.into()).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match self.write_outcome(&command, outcome).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_leader() => return self.become_follower("log stream refused write").await,
                Err(e) if e.is_transient() => self.backoff(&mut schedule, &e).await?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Run the processor of `command` against current state.
    ///
    /// Commands without a processor are rejected. A non-transient failure
    /// gets one more pass through the processor's error hook with a fresh
    /// context.
    fn run_processor(&self, command: &Record) -> Result<ProcessingOutcome, ProcessingError> {
        let keys = KeyGenerator::load(self.partition_id, &self.state)?;

        let Some(processor) = self.processors.get(&command.value_type, &command.intent) else {
            debug!(
                position = command.position,
                value_type = %command.value_type,
                intent = %command.intent,
                "No processor for command"
            );
            let mut ctx = ProcessingContext::new(command, &self.state, keys, &self.config);
            ctx.reject(
                RejectionType::Unimplemented,
                format!(
                    "No processor for {} {}",
                    command.value_type, command.intent
                ),
            )?;
            return Ok(ctx.finish());
        };

        let mut ctx = ProcessingContext::new(command, &self.state, keys.clone(), &self.config);
        match processor.process(command, &mut ctx) {
            Ok(()) => Ok(ctx.finish()),
            Err(e) if e.is_transient() => Err(e),
            Err(e @ ProcessingError::Fatal(_)) => Err(e),
            Err(e) => {
                warn!(position = command.position, "Processing failed: {}", e);
                let mut ctx = ProcessingContext::new(command, &self.state, keys, &self.config);
                processor
                    .on_processing_error(command, &e, &mut ctx)
                    .map_err(|hook| {
                        ProcessingError::Fatal(format!("Error handling of '{e}' failed: {hook}"))
                    })?;
                Ok(ctx.finish())
            }
        }
    }

    /// Write the outcome of `command`, apply it and run its side effects
    async fn write_outcome(
        &mut self,
        command: &Record,
        outcome: ProcessingOutcome,
    ) -> EngineResult<()> {
        let ProcessingOutcome {
            records,
            response,
            post_commit,
        } = outcome;

        if records.is_empty() {
            self.apply_with_retry(&[], Some(command.position)).await?;
        } else {
            let (address, written) = tokio::select! {
                _ = self.token.cancelled() => {
                    return Err(Error::shutdown("Stream processor closed while writing"));
                }
                written = self.log_stream.write_batch(records) => written?,
            };
            trace!(
                position = command.position,
                lowest = address.lowest_position,
                highest = address.highest_position,
                "Wrote follow-up records"
            );
            self.apply_with_retry(&written, Some(command.position))
                .await?;
        }

        if let Some(staged) = response {
            self.responses.complete(staged);
        }
        self.run_post_commit(post_commit).await
    }

    async fn run_post_commit(&mut self, tasks: Vec<PostCommitTask>) -> EngineResult<()> {
        for mut task in tasks {
            let mut schedule = self.retry_schedule();
            loop {
                match task() {
                    Ok(true) => break,
                    Ok(false) => {
                        let e = Error::with_context(
                            ErrorKind::Transient,
                            "Post-commit task asked to retry",
                        );
                        self.backoff(&mut schedule, &e).await?;
                    }
                    Err(e) => {
                        warn!(partition_id = self.partition_id, "Post-commit task failed: {}", e);
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
