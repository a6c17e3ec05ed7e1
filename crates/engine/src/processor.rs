//! Command processors and their registry.

use std::collections::HashMap;
use std::sync::Arc;

use conductor_state::StateError;
use thiserror::Error;

use crate::context::ProcessingContext;
use crate::record::{Intent, Record, RejectionType, ValueType};

/// Why a processor could not handle a command
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Retrying the same command later may succeed
    #[error("Transient processing failure: {0}")]
    Transient(String),

    /// The command cannot be processed; it gets rejected
    #[error("Processing failed: {0}")]
    Failed(String),

    /// The partition cannot continue
    #[error("Fatal processing failure: {0}")]
    Fatal(String),

    /// Reading state failed
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// The command produced more than one batch holds
    #[error("Record batch exceeds its limit: {0}")]
    BatchSizeExceeded(String),
}

impl ProcessingError {
    /// Whether the engine should retry the command
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessingError::Transient(_) => true,
            ProcessingError::State(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Handles the commands of one (value type, intent).
///
/// Processors must be deterministic: the same command against the same
/// state always writes the same records. They never retry themselves.
pub trait CommandProcessor: Send + Sync + 'static {
    /// Process `command`, writing follow-up records through `ctx`
    fn process(
        &self,
        command: &Record,
        ctx: &mut ProcessingContext<'_>,
    ) -> Result<(), ProcessingError>;

    /// Called with a fresh context after [`CommandProcessor::process`]
    /// failed with a non-transient error. A failure here is fatal.
    fn on_processing_error(
        &self,
        _command: &Record,
        error: &ProcessingError,
        ctx: &mut ProcessingContext<'_>,
    ) -> Result<(), ProcessingError> {
        let rejection_type = match error {
            ProcessingError::BatchSizeExceeded(_) => RejectionType::ExceededBatchRecordSize,
            _ => RejectionType::ProcessingError,
        };
        ctx.reject(rejection_type, error.to_string())
    }
}

/// Processors by (value type, intent), fixed once the partition starts.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<(ValueType, Intent), Arc<dyn CommandProcessor>>,
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.processors.keys()).finish()
    }
}

impl ProcessorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor`, replacing an earlier one for the same pair
    pub fn with_processor(
        mut self,
        value_type: impl Into<ValueType>,
        intent: impl Into<Intent>,
        processor: impl CommandProcessor,
    ) -> Self {
        self.processors
            .insert((value_type.into(), intent.into()), Arc::new(processor));
        self
    }

    /// Processor of a command
    pub fn get(&self, value_type: &ValueType, intent: &Intent) -> Option<&Arc<dyn CommandProcessor>> {
        self.processors.get(&(value_type.clone(), intent.clone()))
    }

    /// Number of registered processors
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Whether no processor is registered
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl CommandProcessor for Noop {
        fn process(
            &self,
            _command: &Record,
            _ctx: &mut ProcessingContext<'_>,
        ) -> Result<(), ProcessingError> {
            Ok(())
        }
    }

    #[test]
    fn test_lookup_by_value_type_and_intent() {
        let registry = ProcessorRegistry::new()
            .with_processor("JOB", "CREATE", Noop)
            .with_processor("JOB", "COMPLETE", Noop);

        assert_eq!(registry.len(), 2);
        assert!(registry.get(&"JOB".into(), &"CREATE".into()).is_some());
        assert!(registry.get(&"JOB".into(), &"FAIL".into()).is_none());
        assert!(registry.get(&"TIMER".into(), &"CREATE".into()).is_none());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProcessingError::Transient("busy".into()).is_transient());
        assert!(ProcessingError::State(StateError::Backend("io".into())).is_transient());
        assert!(!ProcessingError::Failed("bad".into()).is_transient());
        assert!(!ProcessingError::BatchSizeExceeded("big".into()).is_transient());
    }
}
