//! Error types for the worker runtime

use drudge_interfaces::EngineError;
use thiserror::Error;

/// Errors that end a worker's run or one of its lifecycle operations.
///
/// Failures of individual jobs never surface here; they are reported to the
/// engine and the worker carries on.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to subscribe to worker notifications: {0}")]
    Subscribe(#[source] EngineError),

    #[error("Failed to reconnect {connection}: {source}")]
    Reconnect {
        connection: String,
        #[source]
        source: EngineError,
    },

    #[error("after_fork hook failed: {0}")]
    AfterFork(#[source] EngineError),

    #[error("Failed to deregister worker: {0}")]
    Deregister(#[source] EngineError),
}

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;
