//! Exporters: ship committed records out of the partition.
//!
//! Each exporter reads the committed log through its own [`RecordCursor`]
//! and acknowledges what it has shipped. The lowest acknowledged position
//! across exporters bounds log compaction.

mod cursor;
mod director;

pub use cursor::RecordCursor;
pub use director::ExporterDirector;

use std::sync::Arc;

use async_trait::async_trait;
use conductor_state::{ExporterPositions, StateStore};
use conductor_storage::Position;
use thiserror::Error;
use tracing::trace;

use crate::error::EngineResult;
use crate::record::Record;

/// An export attempt failed; the same record is offered again later.
#[derive(Debug, Error)]
#[error("Export failed: {0}")]
pub struct ExporterError(pub String);

/// Receives every committed record of a partition, in order.
#[async_trait]
pub trait Exporter: Send + 'static {
    /// Stable id under which the acknowledged position is stored
    fn id(&self) -> &str;

    /// Called once before the first record
    async fn open(&mut self, _controller: ExporterController) -> Result<(), ExporterError> {
        Ok(())
    }

    /// Ship one record. Records are never skipped: a failed record is
    /// retried until it succeeds.
    async fn export(&mut self, record: &Record) -> Result<(), ExporterError>;

    /// Called once when the partition closes
    async fn close(&mut self) {}
}

/// Lets an exporter persist how far it got.
#[derive(Debug, Clone)]
pub struct ExporterController {
    exporter_id: Arc<str>,
    state: StateStore,
}

impl ExporterController {
    pub(crate) fn new(exporter_id: &str, state: StateStore) -> Self {
        Self {
            exporter_id: exporter_id.into(),
            state,
        }
    }

    /// The exporter's id
    pub fn exporter_id(&self) -> &str {
        &self.exporter_id
    }

    /// Record that everything up to `position` is exported.
    ///
    /// Acknowledging a lower position than before has no effect.
    pub fn acknowledge(&self, position: Position) -> EngineResult<()> {
        let mut txn = self.state.transaction();
        ExporterPositions::acknowledge(&mut txn, &self.exporter_id, position)?;
        txn.commit()?;
        trace!(exporter = %self.exporter_id, position, "Acknowledged export");
        Ok(())
    }

    /// The last acknowledged position
    pub fn last_acknowledged(&self) -> EngineResult<Option<Position>> {
        Ok(ExporterPositions::get(&self.state, &self.exporter_id)?)
    }
}
