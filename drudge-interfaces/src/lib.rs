//! # Drudge Interfaces
//!
//! Interfaces for the collaborators the drudge worker runtime consumes but
//! does not implement: jobs, reservation strategies, queue engine clients and
//! the engine's server-side script cache.
//!
//! ## Main Interfaces
//!
//! - [`Job`] - a reserved unit of work and its completion/failure reporting
//! - [`Reserver`] - picks the next job for a worker
//! - [`QueueClient`] - engine connection with worker notifications
//! - [`ScriptStore`] - content-addressed script cache on the engine

pub mod engine;
pub mod error;
pub mod job;
pub mod notification;

#[cfg(feature = "testing")]
pub mod testing;

// Re-export commonly used types
pub use engine::{
    content_hash, distinct_clients, Connection, MessageStream, QueueClient, Reserver, ScriptStore,
};
pub use error::{EngineError, JobError};
pub use job::{Failure, Job, JobRef};
pub use notification::{worker_channel, LockLossNotification, LOCK_LOST_EVENT, WORKER_CHANNEL_PREFIX};
