//! Job interface
//!
//! Jobs are owned by the queue engine. The worker runtime receives them from a
//! [`Reserver`](crate::Reserver), runs them and reports the outcome back, but
//! never constructs or destroys them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, JobError};

/// Shared handle to a reserved job
pub type JobRef = Arc<dyn Job>;

/// A unit of work handed out by the queue engine
#[async_trait]
pub trait Job: Send + Sync + fmt::Debug {
    /// Engine-assigned job identifier
    fn jid(&self) -> &str;

    /// Name of the job's type, used to group failures
    fn job_type(&self) -> &str;

    /// Human readable description for logs
    fn description(&self) -> String {
        format!("{} ({})", self.jid(), self.job_type())
    }

    /// Run the job's payload
    async fn perform(&self) -> Result<(), JobError>;

    /// Whether the payload already moved the job to another state
    /// (completed, failed, retried...) on its own
    fn state_changed(&self) -> bool;

    /// Report the job as completed
    async fn complete(&self) -> Result<(), EngineError>;

    /// Report the job as failed
    async fn fail(&self, failure: &Failure) -> Result<(), EngineError>;
}

/// Failure record reported to the engine for a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Failure group, e.g. `ImportJob:IoError`
    pub group: String,
    /// Error message
    pub message: String,
    /// Execution trace, one frame or cause per line
    pub trace: String,
}

impl Failure {
    pub fn new(group: impl Into<String>, message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            message: message.into(),
            trace: trace.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.group, self.message)
    }
}
