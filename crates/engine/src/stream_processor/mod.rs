//! The stream processor: replays committed events into state and turns
//! commands into follow-up records.
//!
//! A single task owns the log reader, the state store and the log stream of
//! a partition. Followers only replay. Leaders first replay up to their
//! initial entry, then process every command after the last processed one.
//! Each processed command ends in exactly one state transaction that also
//! carries the updated [`ProcessingPosition`].

mod handle;
mod processing;

pub use handle::{Phase, StreamProcessorHandle};

use std::collections::VecDeque;

use conductor_raft::{RaftStatus, Role};
use conductor_state::{ProcessingPosition, StateStore};
use conductor_storage::{BlockLog, LogReader, Position, StorageAdaptor};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::applier::EventApplierRegistry;
use crate::backoff::RetrySchedule;
use crate::config::StreamProcessorConfig;
use crate::error::{EngineResult, Error, ErrorKind};
use crate::log_stream::LogStream;
use crate::processor::ProcessorRegistry;
use crate::record::{Record, decode_records};
use crate::response::ResponseRegistry;
use handle::Control;

/// Position of the first record of a partition
const FIRST_POSITION: Position = 1;

/// Everything a stream processor is built from
pub(crate) struct StreamProcessorParts<S> {
    pub(crate) partition_id: u32,
    pub(crate) log: BlockLog<S>,
    pub(crate) state: StateStore,
    pub(crate) processors: ProcessorRegistry,
    pub(crate) appliers: EventApplierRegistry,
    pub(crate) log_stream: LogStream,
    pub(crate) responses: ResponseRegistry,
    pub(crate) config: StreamProcessorConfig,
    /// Raft status updates; `None` runs the partition standalone
    pub(crate) leadership: Option<watch::Receiver<RaftStatus>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Replay,
    Process,
}

enum Wake {
    Shutdown,
    Control(Control),
    Commit,
    Leadership,
}

struct StreamProcessor<S> {
    partition_id: u32,
    log: BlockLog<S>,
    reader: LogReader<S>,
    buffered: VecDeque<Record>,
    state: StateStore,
    processors: ProcessorRegistry,
    appliers: EventApplierRegistry,
    log_stream: LogStream,
    responses: ResponseRegistry,
    config: StreamProcessorConfig,
    leadership: Option<watch::Receiver<RaftStatus>>,
    mode: Mode,
    paused: bool,
    /// Initial index of a leadership that still has to catch up
    pending_leadership: Option<u64>,
    /// Initial index of the leadership being processed under
    leading: Option<u64>,
    position: ProcessingPosition,
    phase_tx: watch::Sender<Phase>,
    positions_tx: watch::Sender<ProcessingPosition>,
    controls: mpsc::Receiver<Control>,
    token: CancellationToken,
}

/// Start the stream processor task of a partition
pub(crate) fn spawn<S: StorageAdaptor>(
    parts: StreamProcessorParts<S>,
) -> EngineResult<StreamProcessorHandle> {
    let position = ProcessingPosition::load(&parts.state)?;
    let mut reader = parts.log.new_reader();
    reader.seek(position.replay_start())?;

    let (phase_tx, phase_rx) = watch::channel(Phase::Initializing);
    let (positions_tx, positions_rx) = watch::channel(position);
    let (controls_tx, controls_rx) = mpsc::channel(8);
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();

    let processor = StreamProcessor {
        partition_id: parts.partition_id,
        log: parts.log,
        reader,
        buffered: VecDeque::new(),
        state: parts.state,
        processors: parts.processors,
        appliers: parts.appliers,
        log_stream: parts.log_stream,
        responses: parts.responses,
        config: parts.config,
        leadership: parts.leadership,
        mode: Mode::Replay,
        paused: false,
        pending_leadership: None,
        leading: None,
        position,
        phase_tx,
        positions_tx,
        controls: controls_rx,
        token: token.clone(),
    };

    tracker.spawn(processor.run());
    tracker.close();

    Ok(StreamProcessorHandle::new(
        controls_tx,
        phase_rx,
        positions_rx,
        token,
        tracker,
    ))
}

impl<S: StorageAdaptor> StreamProcessor<S> {
    async fn run(mut self) {
        let result = self.run_loop().await;
        self.log_stream.disable().await;

        let phase = match result {
            Ok(()) => Phase::Closed,
            Err(e) if matches!(e.kind(), ErrorKind::Shutdown) => Phase::Closed,
            Err(e) => {
                error!(
                    partition_id = self.partition_id,
                    last_processed = self.position.last_processed_position,
                    "Stream processor failed: {}", e
                );
                Phase::Failed
            }
        };
        info!(partition_id = self.partition_id, %phase, "Stream processor stopped");
        self.phase_tx.send_replace(phase);
    }

    async fn run_loop(&mut self) -> EngineResult<()> {
        info!(
            partition_id = self.partition_id,
            replay_start = self.position.replay_start(),
            "Replaying log"
        );
        self.publish_phase();
        let mut commits = self.log.subscribe_commits();

        if self.leadership.is_none() {
            while self.replay_available().await? {}
            self.enter_processing(None).await?;
        } else {
            self.observe_leadership(true).await?;
        }

        loop {
            if self.token.is_cancelled() {
                return Ok(());
            }
            while let Ok(control) = self.controls.try_recv() {
                self.on_control(control);
            }
            self.observe_leadership(false).await?;

            if !self.paused {
                let progressed = match self.mode {
                    Mode::Replay => {
                        let replayed = self.replay_available().await?;
                        replayed || self.try_enter_processing().await?
                    }
                    Mode::Process => self.process_next().await?,
                };
                if progressed {
                    continue;
                }
            }

            let wake = tokio::select! {
                _ = self.token.cancelled() => Wake::Shutdown,
                control = self.controls.recv() => control.map_or(Wake::Shutdown, Wake::Control),
                changed = commits.changed() => {
                    if changed.is_ok() { Wake::Commit } else { Wake::Shutdown }
                }
                _ = leadership_changed(&mut self.leadership) => Wake::Leadership,
            };

            match wake {
                Wake::Shutdown => return Ok(()),
                Wake::Control(control) => self.on_control(control),
                Wake::Commit => {}
                Wake::Leadership => self.observe_leadership(true).await?,
            }
        }
    }

    fn on_control(&mut self, control: Control) {
        let ack = match control {
            Control::Pause(ack) => {
                self.paused = true;
                ack
            }
            Control::Resume(ack) => {
                self.paused = false;
                ack
            }
        };
        debug!(partition_id = self.partition_id, paused = self.paused, "Stream processor control");
        self.publish_phase();
        let _ = ack.send(());
    }

    fn publish_phase(&self) {
        let phase = match (self.paused, self.mode) {
            (true, _) => Phase::Suspended,
            (false, Mode::Replay) => Phase::Replaying,
            (false, Mode::Process) => Phase::Processing,
        };
        self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            *current = phase;
            true
        });
    }

    async fn observe_leadership(&mut self, force: bool) -> EngineResult<()> {
        let status = match self.leadership.as_mut() {
            Some(rx) if force || rx.has_changed().unwrap_or(false) => rx.borrow_and_update().clone(),
            _ => return Ok(()),
        };

        match (status.role, status.initial_index) {
            (Role::Leader, Some(initial)) => {
                if self.leading == Some(initial) || self.pending_leadership == Some(initial) {
                    return Ok(());
                }
                if self.mode == Mode::Process {
                    self.become_follower("leadership changed").await?;
                }
                info!(
                    partition_id = self.partition_id,
                    term = status.term,
                    initial_index = initial,
                    "Became leader, catching up before processing"
                );
                self.pending_leadership = Some(initial);
            }
            _ => {
                self.pending_leadership = None;
                if self.mode == Mode::Process {
                    self.become_follower("lost leadership").await?;
                }
            }
        }
        Ok(())
    }

    /// Switch to processing once everything up to the leader's initial
    /// entry is committed and replayed
    async fn try_enter_processing(&mut self) -> EngineResult<bool> {
        let Some(initial) = self.pending_leadership else {
            return Ok(false);
        };
        if self.log.commit_watermark().index < initial || self.reader.has_next() {
            return Ok(false);
        }

        self.pending_leadership = None;
        self.enter_processing(Some(initial)).await?;
        Ok(true)
    }

    async fn enter_processing(&mut self, initial: Option<u64>) -> EngineResult<()> {
        let last_position = self
            .log
            .last_application()
            .map_or(FIRST_POSITION - 1, |address| address.highest_position);
        self.log_stream.reset(last_position).await;

        self.reader.seek(self.position.last_processed_position + 1)?;
        self.buffered.clear();
        self.leading = initial;
        self.mode = Mode::Process;
        self.publish_phase();

        info!(
            partition_id = self.partition_id,
            last_processed = self.position.last_processed_position,
            next_position = last_position + 1,
            "Processing commands"
        );
        Ok(())
    }

    async fn become_follower(&mut self, reason: &str) -> EngineResult<()> {
        self.log_stream.disable().await;
        self.leading = None;
        self.reader.seek(self.position.replay_start())?;
        self.buffered.clear();
        self.mode = Mode::Replay;
        self.publish_phase();

        info!(partition_id = self.partition_id, reason, "Switched to replay");
        Ok(())
    }

    fn retry_schedule(&self) -> RetrySchedule {
        RetrySchedule::new(self.config.min_backoff, self.config.max_backoff)
    }

    /// Back off before another attempt; fails once the processor closes
    async fn backoff(&self, schedule: &mut RetrySchedule, error: &Error) -> EngineResult<()> {
        warn!(
            partition_id = self.partition_id,
            attempt = schedule.attempts() + 1,
            "Retrying after transient failure: {}", error
        );
        if schedule.wait(&self.token).await {
            Ok(())
        } else {
            Err(Error::shutdown("Stream processor closed while retrying"))
        }
    }

    /// Decoded records of the next committed block
    async fn read_block(&mut self) -> EngineResult<Option<Vec<Record>>> {
        let mut schedule = self.retry_schedule();
        loop {
            match self.reader.next().await {
                Ok(Some(block)) => return decode_records(&block).map(Some),
                Ok(None) => return Ok(None),
                Err(e) => {
                    let e = Error::from(e);
                    if !e.is_transient() {
                        return Err(e);
                    }
                    self.backoff(&mut schedule, &e).await?;
                }
            }
        }
    }

    /// Apply the next few committed blocks in one transaction.
    ///
    /// Returns whether anything was read.
    async fn replay_available(&mut self) -> EngineResult<bool> {
        let mut records = Vec::new();
        let mut blocks = 0;
        while blocks < self.config.replay_batch_size {
            match self.read_block().await? {
                Some(block) => {
                    records.extend(block);
                    blocks += 1;
                }
                None => break,
            }
        }
        if blocks == 0 {
            return Ok(false);
        }

        self.apply_with_retry(&records, None).await?;
        debug!(
            partition_id = self.partition_id,
            blocks,
            last_written = self.position.last_written_position,
            "Replayed blocks"
        );
        Ok(true)
    }

    async fn apply_with_retry(
        &mut self,
        records: &[Record],
        processed: Option<i64>,
    ) -> EngineResult<()> {
        let mut schedule = self.retry_schedule();
        loop {
            match self.apply_records(records, processed) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => self.backoff(&mut schedule, &e).await?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply `records` and move the marker in a single transaction.
    ///
    /// Follow-ups at or below the last written position are already in
    /// state and are skipped. `processed` marks a command as done even if
    /// it wrote nothing.
    fn apply_records(&mut self, records: &[Record], processed: Option<i64>) -> EngineResult<()> {
        let mut next = self.position;
        let mut txn = self.state.transaction();

        for record in records {
            if record.is_follow_up() && record.position <= next.last_written_position {
                continue;
            }
            self.appliers.apply(self.partition_id, record, &mut txn)?;
            if record.is_follow_up() {
                next.last_processed_position = next
                    .last_processed_position
                    .max(record.source_record_position);
                next.last_written_position = next.last_written_position.max(record.position);
            }
        }
        if let Some(position) = processed {
            next.last_processed_position = next.last_processed_position.max(position);
        }

        if next == self.position && txn.is_empty() {
            return Ok(());
        }
        next.store(&mut txn)?;
        txn.commit()?;

        self.position = next;
        self.positions_tx.send_replace(next);
        Ok(())
    }
}

async fn leadership_changed(leadership: &mut Option<watch::Receiver<RaftStatus>>) {
    match leadership {
        Some(rx) => {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}
