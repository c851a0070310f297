//! Queue engine interfaces
//!
//! The engine's job selection, locking and retry bookkeeping live on the
//! server side. The runtime only reaches it through these traits.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value as JsonValue;
use sha1::{Digest, Sha1};
use std::sync::Arc;

use crate::error::EngineError;
use crate::job::JobRef;

/// Stream of raw messages published on a notification channel
pub type MessageStream = BoxStream<'static, String>;

/// An external connection that must be re-established after a fork and may be
/// refreshed between jobs
#[async_trait]
pub trait Connection: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Drop any live connection state and connect again
    async fn reconnect(&self) -> Result<(), EngineError>;
}

/// Client for one queue engine
#[async_trait]
pub trait QueueClient: Connection {
    /// Identity of the worker using this client
    fn worker_name(&self) -> &str;

    /// Subscribe to a notification channel
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, EngineError>;

    /// Remove the given workers from the engine's worker registry
    async fn deregister_workers(&self, worker_names: &[String]) -> Result<(), EngineError>;
}

/// Pluggable policy choosing which job a worker should attempt next
#[async_trait]
pub trait Reserver: Send + Sync {
    /// Reserve the next job, if any is available
    async fn reserve(&self) -> Result<Option<JobRef>, EngineError>;

    /// Description used in process titles and logs
    fn description(&self) -> String;

    /// Engine clients used by this reserver. May contain the same client more
    /// than once (e.g. one per queue).
    fn clients(&self) -> Vec<Arc<dyn QueueClient>>;
}

/// Server-side script cache of the engine
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Register script source and return its content-hash handle
    async fn script_load(&self, source: &str) -> Result<String, EngineError>;

    /// Invoke a registered script by handle
    async fn eval_sha(&self, sha: &str, args: &[String]) -> Result<JsonValue, EngineError>;
}

/// SHA-1 content hash of script source, as the engine computes it
pub fn content_hash(source: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// De-duplicate clients by identity, keeping first-seen order
pub fn distinct_clients(clients: Vec<Arc<dyn QueueClient>>) -> Vec<Arc<dyn QueueClient>> {
    let mut seen: Vec<*const ()> = Vec::with_capacity(clients.len());
    let mut distinct = Vec::with_capacity(clients.len());

    for client in clients {
        let ptr = Arc::as_ptr(&client) as *const ();
        if !seen.contains(&ptr) {
            seen.push(ptr);
            distinct.push(client);
        }
    }

    distinct
}
