//! Error types shared between the worker runtime and its collaborators

use thiserror::Error;

/// Errors reported by the queue engine or its connections
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The script handle is not present in the engine's script cache
    #[error("NOSCRIPT No matching script. Please use EVAL.")]
    NoScript,

    /// Runtime error raised by the engine while executing a command or script
    #[error("{0}")]
    Command(String),

    /// The job was completed, failed, cancelled or handed to another worker
    /// before this worker could report on it
    #[error("Job state already changed: {0}")]
    AlreadyChanged(String),

    /// Transient connectivity problem
    #[error("Connection error: {0}")]
    Connection(String),

    /// Subscribing to or reading from a notification channel failed
    #[error("Subscription error: {0}")]
    Subscription(String),
}

impl EngineError {
    /// Whether this error means another actor already took authoritative
    /// action on the job
    pub fn is_ownership_race(&self) -> bool {
        matches!(self, EngineError::AlreadyChanged(_))
    }
}

/// Errors raised while executing a job's hook chain
#[derive(Error, Debug)]
pub enum JobError {
    /// Ownership of the job was revoked while it was executing. This is a
    /// control condition, not a failure: the job is neither completed nor failed.
    #[error("Lock lost for job {0}")]
    LockLost(String),

    /// The payload (or a middleware around it) failed
    #[error("{source}")]
    Failed {
        /// Short classification used to group failures, e.g. `IoError`
        kind: String,
        #[source]
        source: anyhow::Error,
    },
}

impl JobError {
    /// Build a failure with an explicit classification
    pub fn failed(kind: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Failed {
            kind: kind.into(),
            source: source.into(),
        }
    }

    /// Classification of this error for failure grouping
    pub fn kind(&self) -> &str {
        match self {
            JobError::LockLost(_) => "LockLost",
            JobError::Failed { kind, .. } => kind,
        }
    }

    pub fn is_lock_lost(&self) -> bool {
        matches!(self, JobError::LockLost(_))
    }
}

impl From<anyhow::Error> for JobError {
    fn from(source: anyhow::Error) -> Self {
        Self::Failed {
            kind: "Error".to_string(),
            source,
        }
    }
}

impl From<EngineError> for JobError {
    fn from(err: EngineError) -> Self {
        let kind = match &err {
            EngineError::NoScript => "NoScript",
            EngineError::Command(_) => "CommandError",
            EngineError::AlreadyChanged(_) => "AlreadyChanged",
            EngineError::Connection(_) => "ConnectionError",
            EngineError::Subscription(_) => "SubscriptionError",
        };
        Self::failed(kind, err)
    }
}
