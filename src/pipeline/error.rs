//! Error types and reporting for pipeline stages.

use crate::collaborator::CollaboratorError;
use thiserror::Error;

/// Errors raised while a stage handles one item.
///
/// None of these stop the stage loop except `OutputClosed`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageError {
    /// The item could not be processed and was dropped.
    #[error("Malformed item dropped: {0}")]
    Malformed(String),
    /// The collaborator connection failed; the stage will reconnect once.
    #[error("Connection error: {0}")]
    Connection(String),
    /// The stage lost its collaborator and is running in fallback mode.
    #[error("Stage degraded: {0}")]
    Degraded(String),
    /// Work was abandoned because of termination or interruption.
    #[error("Cancelled")]
    Cancelled,
    /// The downstream queue is gone.
    #[error("Output queue closed")]
    OutputClosed,
}

impl StageError {
    /// Expected outcomes that are not failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StageError::Cancelled)
    }
}

impl From<CollaboratorError> for StageError {
    fn from(error: CollaboratorError) -> Self {
        match error {
            CollaboratorError::Protocol(msg) => StageError::Malformed(msg),
            other => StageError::Connection(other.to_string()),
        }
    }
}

/// Trait for reporting stage errors.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error from a stage.
    fn report(&self, stage: &str, error: &StageError);
}

/// Reporter that writes through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, stage: &str, error: &StageError) {
        match error {
            StageError::Cancelled => tracing::debug!(stage, "work cancelled"),
            // The transition into degraded mode is logged once by the stage itself.
            StageError::Degraded(reason) => tracing::debug!(stage, %reason, "item skipped"),
            StageError::Malformed(reason) => tracing::warn!(stage, %reason, "item dropped"),
            StageError::Connection(reason) => {
                tracing::warn!(stage, %reason, "collaborator connection error")
            }
            StageError::OutputClosed => tracing::debug!(stage, "output queue closed"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Reporter that collects `(stage, message)` pairs.
    #[derive(Default, Clone)]
    pub struct CollectingReporter {
        pub errors: Arc<Mutex<Vec<(String, StageError)>>>,
    }

    impl CollectingReporter {
        pub fn reported(&self) -> Vec<(String, StageError)> {
            self.errors.lock().unwrap().clone()
        }
    }

    impl ErrorReporter for CollectingReporter {
        fn report(&self, stage: &str, error: &StageError) {
            self.errors
                .lock()
                .unwrap()
                .push((stage.to_string(), error.clone()));
        }
    }
}
