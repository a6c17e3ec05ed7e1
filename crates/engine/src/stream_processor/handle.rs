//! Control surface of a running stream processor.

use std::fmt;
use std::time::Duration;

use conductor_state::ProcessingPosition;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{EngineResult, Error};

/// Lifecycle phase of a stream processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Loading state
    Initializing,
    /// Applying committed events without processing commands
    Replaying,
    /// Processing commands
    Processing,
    /// Paused
    Suspended,
    /// Stopped on request
    Closed,
    /// Stopped on an unrecoverable error
    Failed,
}

impl Phase {
    /// Whether the processor has stopped for good
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Initializing => "initializing",
            Phase::Replaying => "replaying",
            Phase::Processing => "processing",
            Phase::Suspended => "suspended",
            Phase::Closed => "closed",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub(crate) enum Control {
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
}

/// Handle to a stream processor task. Clones share the task.
#[derive(Clone)]
pub struct StreamProcessorHandle {
    controls: mpsc::Sender<Control>,
    phase: watch::Receiver<Phase>,
    positions: watch::Receiver<ProcessingPosition>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl fmt::Debug for StreamProcessorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamProcessorHandle")
            .field("phase", &*self.phase.borrow())
            .field("position", &*self.positions.borrow())
            .finish()
    }
}

impl StreamProcessorHandle {
    pub(crate) fn new(
        controls: mpsc::Sender<Control>,
        phase: watch::Receiver<Phase>,
        positions: watch::Receiver<ProcessingPosition>,
        token: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            controls,
            phase,
            positions,
            token,
            tracker,
        }
    }

    async fn control(&self, make: fn(oneshot::Sender<()>) -> Control) -> EngineResult<()> {
        let (tx, rx) = oneshot::channel();
        self.controls
            .send(make(tx))
            .await
            .map_err(|_| Error::shutdown("Stream processor stopped"))?;
        rx.await
            .map_err(|_| Error::shutdown("Stream processor stopped"))
    }

    /// Stop taking new records until [`StreamProcessorHandle::resume`]
    pub async fn pause(&self) -> EngineResult<()> {
        self.control(Control::Pause).await
    }

    /// Continue after [`StreamProcessorHandle::pause`]
    pub async fn resume(&self) -> EngineResult<()> {
        self.control(Control::Resume).await
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Watch phase changes
    pub fn phase_changes(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    /// Current processing position
    pub fn position(&self) -> ProcessingPosition {
        *self.positions.borrow()
    }

    /// Watch processing position changes
    pub fn position_changes(&self) -> watch::Receiver<ProcessingPosition> {
        self.positions.clone()
    }

    /// Wait until the processor reaches `phase`.
    ///
    /// Fails if the processor stops in another phase or `timeout` passes.
    pub async fn wait_for_phase(&self, phase: Phase, timeout: Duration) -> EngineResult<()> {
        let mut rx = self.phase.clone();
        let reached = tokio::time::timeout(
            timeout,
            rx.wait_for(|current| *current == phase || current.is_terminal()),
        )
        .await
        .map_err(|_| Error::timeout(format!("Stream processor did not reach {phase}")))?
        .map(|current| *current)
        .map_err(|_| Error::shutdown("Stream processor stopped"))?;

        if reached == phase {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "Stream processor is {reached}, expected {phase}"
            )))
        }
    }

    /// Stop the processor and wait for it to exit
    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.wait().await;
    }
}
