//! Conditions a partition may meet while starting.
//!
//! Anything that goes wrong during startup aborts it, unless the condition
//! is on the configured allow-list.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineResult, Error, ErrorKind};

/// A startup finding that is not necessarily an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StartupCondition {
    /// No snapshot was ever taken; state is rebuilt from the log alone
    MissingSnapshot,
    /// An exporter never acknowledged a position; it starts at the log's head
    MissingExporterPosition,
}

impl fmt::Display for StartupCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupCondition::MissingSnapshot => write!(f, "missing snapshot"),
            StartupCondition::MissingExporterPosition => write!(f, "missing exporter position"),
        }
    }
}

/// Conditions tolerated unless configured otherwise
pub const IGNORABLE_STARTUP_CONDITIONS: [StartupCondition; 2] = [
    StartupCondition::MissingSnapshot,
    StartupCondition::MissingExporterPosition,
];

/// Continue past `condition` if `allowed` lists it, abort otherwise.
pub(crate) fn tolerate(
    condition: StartupCondition,
    allowed: &[StartupCondition],
    detail: &str,
) -> EngineResult<()> {
    if allowed.contains(&condition) {
        info!(%condition, detail, "Tolerating startup condition");
        Ok(())
    } else {
        Err(Error::with_context(
            ErrorKind::InvalidState,
            format!("Startup aborted on {condition}: {detail}"),
        ))
    }
}
