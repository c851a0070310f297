//! Turning job errors into failure reports

use drudge_interfaces::{Failure, Job, JobError};
use std::backtrace::BacktraceStatus;

/// Builds the [`Failure`] reported to the engine for a failed job
pub trait FailureFormatter: Send + Sync {
    fn format(&self, job: &dyn Job, error: &JobError, worker_name: &str) -> Failure;
}

/// Groups failures as `<job type>:<error kind>` and records the error's cause
/// chain, plus a backtrace when one was captured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFailureFormatter;

impl FailureFormatter for DefaultFailureFormatter {
    fn format(&self, job: &dyn Job, error: &JobError, worker_name: &str) -> Failure {
        let group = format!("{}:{}", job.job_type(), error.kind());
        let mut trace = Vec::new();

        if let JobError::Failed { source, .. } = error {
            for cause in source.chain().skip(1) {
                trace.push(format!("caused by: {}", cause));
            }

            let backtrace = source.backtrace();
            if backtrace.status() == BacktraceStatus::Captured {
                trace.push(backtrace.to_string());
            }
        }
        trace.push(format!("worker: {}", worker_name));

        Failure::new(group, error.to_string(), trace.join("\n"))
    }
}
