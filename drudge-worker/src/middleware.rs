//! Hook chain wrapped around job execution
//!
//! Middlewares are composed once, when the worker is built. Each one receives
//! the job and a [`Next`] continuation; the innermost continuation invokes the
//! job's payload.

use async_trait::async_trait;
use drudge_interfaces::{Connection, EngineError, JobError, JobRef};
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Wrap the execution of `job`. Call `next.run(job)` to continue the chain.
    async fn around_perform(&self, job: &JobRef, next: Next<'_>) -> Result<(), JobError>;

    /// Run in a freshly forked worker process before it starts working
    async fn after_fork(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Continuation to the rest of the chain
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
    pub async fn run(self, job: &JobRef) -> Result<(), JobError> {
        match self.remaining.split_first() {
            Some((middleware, rest)) => {
                middleware
                    .around_perform(job, Next { remaining: rest })
                    .await
            }
            None => job.perform().await,
        }
    }
}

/// Ordered middlewares, outermost first
#[derive(Clone)]
pub struct Chain {
    middlewares: Arc<[Arc<dyn Middleware>]>,
}

impl Chain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            middlewares: Arc::from(middlewares),
        }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Execute `job` through every middleware
    pub async fn perform(&self, job: &JobRef) -> Result<(), JobError> {
        Next {
            remaining: &self.middlewares,
        }
        .run(job)
        .await
    }

    /// Run every middleware's `after_fork` hook in order, stopping at the
    /// first failure
    pub async fn after_fork(&self) -> Result<(), EngineError> {
        for middleware in self.middlewares.iter() {
            debug!("Running after_fork for {}", middleware.name());
            middleware.after_fork().await?;
        }
        Ok(())
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Connections refreshed by [`ReconnectMiddleware`] for a job
pub type ConnectionSelector = Arc<dyn Fn(&JobRef) -> Vec<Arc<dyn Connection>> + Send + Sync>;

/// Re-establishes external connections before every job so a connection that
/// went stale between jobs does not fail the next one. A reconnect error
/// fails the job.
pub struct ReconnectMiddleware {
    select: ConnectionSelector,
}

impl ReconnectMiddleware {
    /// Reconnect the same connections before every job
    pub fn new(connections: Vec<Arc<dyn Connection>>) -> Self {
        Self::per_job(move |_| connections.clone())
    }

    /// Choose the connections to reconnect from the job itself
    pub fn per_job<F>(select: F) -> Self
    where
        F: Fn(&JobRef) -> Vec<Arc<dyn Connection>> + Send + Sync + 'static,
    {
        Self {
            select: Arc::new(select),
        }
    }
}

#[async_trait]
impl Middleware for ReconnectMiddleware {
    fn name(&self) -> &str {
        "reconnect"
    }

    async fn around_perform(&self, job: &JobRef, next: Next<'_>) -> Result<(), JobError> {
        for connection in (self.select)(job) {
            debug!("Reconnecting {} before {}", connection.name(), job.jid());
            connection.reconnect().await?;
        }
        next.run(job).await
    }
}
