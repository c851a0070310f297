//! In-memory engine fakes for tests
//!
//! Enabled with the `testing` feature. These stand in for a live queue engine
//! so the worker and supervisor can be exercised without network access.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

use crate::engine::{content_hash, Connection, MessageStream, QueueClient, Reserver, ScriptStore};
use crate::error::{EngineError, JobError};
use crate::job::{Failure, Job, JobRef};

/// Handler evaluating a script in [`MemoryScriptStore`]
pub type ScriptHandler =
    Arc<dyn Fn(&str, &[String]) -> Result<JsonValue, EngineError> + Send + Sync>;

/// Script cache keyed by SHA-1, like the engine's
pub struct MemoryScriptStore {
    scripts: Mutex<HashMap<String, String>>,
    handler: ScriptHandler,
    evict_on_call: AtomicBool,
    loads: AtomicUsize,
    evals: AtomicUsize,
}

impl MemoryScriptStore {
    /// Store whose scripts echo their arguments back
    pub fn new() -> Self {
        Self::with_handler(|_source, args| Ok(json!({ "args": args })))
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str, &[String]) -> Result<JsonValue, EngineError> + Send + Sync + 'static,
    {
        Self {
            scripts: Mutex::new(HashMap::new()),
            handler: Arc::new(handler),
            evict_on_call: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
            evals: AtomicUsize::new(0),
        }
    }

    /// Register a script without counting it as a load
    pub fn preload(&self, source: &str) -> String {
        let sha = content_hash(source);
        self.scripts.lock().insert(sha.clone(), source.to_string());
        sha
    }

    /// Drop every cached script
    pub fn flush(&self) {
        self.scripts.lock().clear();
    }

    /// Flush the cache before every invocation, simulating persistent eviction
    pub fn evict_on_every_call(&self, enabled: bool) {
        self.evict_on_call.store(enabled, Ordering::SeqCst);
    }

    pub fn contains(&self, sha: &str) -> bool {
        self.scripts.lock().contains_key(sha)
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn eval_count(&self) -> usize {
        self.evals.load(Ordering::SeqCst)
    }
}

impl Default for MemoryScriptStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptStore for MemoryScriptStore {
    async fn script_load(&self, source: &str) -> Result<String, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.preload(source))
    }

    async fn eval_sha(&self, sha: &str, args: &[String]) -> Result<JsonValue, EngineError> {
        self.evals.fetch_add(1, Ordering::SeqCst);
        if self.evict_on_call.load(Ordering::SeqCst) {
            self.flush();
        }

        let source = self.scripts.lock().get(sha).cloned();
        match source {
            Some(source) => (self.handler)(&source, args),
            None => Err(EngineError::NoScript),
        }
    }
}

/// Engine client with in-process pub/sub channels
pub struct MemoryClient {
    name: String,
    worker_name: String,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    reconnects: AtomicUsize,
    fail_reconnect: AtomicBool,
    deregistered: Mutex<Vec<String>>,
}

impl MemoryClient {
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            name: "memory".to_string(),
            worker_name: worker_name.into(),
            channels: Mutex::new(HashMap::new()),
            reconnects: AtomicUsize::new(0),
            fail_reconnect: AtomicBool::new(false),
            deregistered: Mutex::new(Vec::new()),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    /// Publish a message, returning the number of subscribers that received it
    pub fn publish(&self, channel: &str, message: impl Into<String>) -> usize {
        self.sender(channel).send(message.into()).unwrap_or(0)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Wait until at least one subscriber listens on `channel`
    pub async fn wait_for_subscriber(&self, channel: &str) {
        while self.subscriber_count(channel) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn fail_reconnects(&self, enabled: bool) {
        self.fail_reconnect.store(enabled, Ordering::SeqCst);
    }

    pub fn deregistered(&self) -> Vec<String> {
        self.deregistered.lock().clone()
    }
}

#[async_trait]
impl Connection for MemoryClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reconnect(&self) -> Result<(), EngineError> {
        if self.fail_reconnect.load(Ordering::SeqCst) {
            return Err(EngineError::Connection("connection refused".to_string()));
        }
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl QueueClient for MemoryClient {
    fn worker_name(&self) -> &str {
        &self.worker_name
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, EngineError> {
        let receiver = self.sender(channel).subscribe();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn deregister_workers(&self, worker_names: &[String]) -> Result<(), EngineError> {
        self.deregistered.lock().extend(worker_names.iter().cloned());
        Ok(())
    }
}

/// Reserver handing out queued jobs in order
pub struct QueueReserver {
    jobs: Mutex<VecDeque<JobRef>>,
    pending_failures: AtomicUsize,
    reserves: AtomicUsize,
    clients: Vec<Arc<dyn QueueClient>>,
}

impl QueueReserver {
    pub fn new(clients: Vec<Arc<dyn QueueClient>>) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            pending_failures: AtomicUsize::new(0),
            reserves: AtomicUsize::new(0),
            clients,
        }
    }

    pub fn push(&self, job: JobRef) {
        self.jobs.lock().push_back(job);
    }

    /// Make the next `count` reservations fail with a connection error
    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn reserve_count(&self) -> usize {
        self.reserves.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.jobs.lock().len()
    }
}

#[async_trait]
impl Reserver for QueueReserver {
    async fn reserve(&self) -> Result<Option<JobRef>, EngineError> {
        self.reserves.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EngineError::Connection("connection reset by peer".to_string()));
        }

        Ok(self.jobs.lock().pop_front())
    }

    fn description(&self) -> String {
        "memory queue".to_string()
    }

    fn clients(&self) -> Vec<Arc<dyn QueueClient>> {
        self.clients.clone()
    }
}

/// Scripted payload behaviour of a [`TestJob`]
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail { kind: String, message: String },
    Sleep(Duration),
    /// Holds its thread without yielding to the runtime
    Block(Duration),
    /// Never finishes on its own
    Hang,
    /// Completes itself from inside the payload
    SelfComplete,
}

/// Job with scripted behaviour that records what the runtime did with it
#[derive(Debug)]
pub struct TestJob {
    jid: String,
    job_type: String,
    behavior: Behavior,
    state_changed: AtomicBool,
    completions: AtomicUsize,
    failures: Mutex<Vec<Failure>>,
    complete_error: Mutex<Option<EngineError>>,
    fail_error: Mutex<Option<EngineError>>,
    performs: AtomicUsize,
    started: Notify,
}

impl TestJob {
    pub fn new(jid: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            job_type: "TestJob".to_string(),
            behavior: Behavior::Succeed,
            state_changed: AtomicBool::new(false),
            completions: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
            complete_error: Mutex::new(None),
            fail_error: Mutex::new(None),
            performs: AtomicUsize::new(0),
            started: Notify::new(),
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn failing(self, kind: &str, message: &str) -> Self {
        self.with_behavior(Behavior::Fail {
            kind: kind.to_string(),
            message: message.to_string(),
        })
    }

    /// Make `complete` report an error instead of succeeding
    pub fn reject_complete(self, error: EngineError) -> Self {
        *self.complete_error.lock() = Some(error);
        self
    }

    /// Make `fail` report an error instead of succeeding
    pub fn reject_fail(self, error: EngineError) -> Self {
        *self.fail_error.lock() = Some(error);
        self
    }

    pub fn into_ref(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.completions() > 0
    }

    pub fn failures(&self) -> Vec<Failure> {
        self.failures.lock().clone()
    }

    pub fn perform_count(&self) -> usize {
        self.performs.load(Ordering::SeqCst)
    }

    /// Wait until the payload has started running
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }
}

#[async_trait]
impl Job for TestJob {
    fn jid(&self) -> &str {
        &self.jid
    }

    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn perform(&self) -> Result<(), JobError> {
        self.performs.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();

        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail { kind, message } => {
                Err(JobError::failed(kind.clone(), anyhow::anyhow!(message.clone())))
            }
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
            Behavior::Block(duration) => {
                std::thread::sleep(*duration);
                Ok(())
            }
            Behavior::Hang => {
                futures::future::pending::<()>().await;
                Ok(())
            }
            Behavior::SelfComplete => {
                self.complete().await?;
                self.state_changed.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn state_changed(&self) -> bool {
        self.state_changed.load(Ordering::SeqCst)
    }

    async fn complete(&self) -> Result<(), EngineError> {
        if let Some(err) = self.complete_error.lock().clone() {
            return Err(err);
        }
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fail(&self, failure: &Failure) -> Result<(), EngineError> {
        if let Some(err) = self.fail_error.lock().clone() {
            return Err(err);
        }
        self.failures.lock().push(failure.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_eviction() {
        let store = MemoryScriptStore::new();
        let sha = store.preload("return 1");
        assert!(store.contains(&sha));

        store.flush();
        let result = store.eval_sha(&sha, &[]).await;
        assert_eq!(result, Err(EngineError::NoScript));
        assert_eq!(store.eval_count(), 1);
        assert_eq!(store.load_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_reserver_transient_failures() {
        let reserver = QueueReserver::new(vec![]);
        reserver.push(TestJob::new("a").into_ref());
        reserver.fail_next(1);

        assert!(reserver.reserve().await.is_err());
        let job = reserver.reserve().await.unwrap().unwrap();
        assert_eq!(job.jid(), "a");
        assert!(reserver.reserve().await.unwrap().is_none());
        assert_eq!(reserver.reserve_count(), 3);
    }

    #[tokio::test]
    async fn test_memory_client_pubsub() {
        let client = MemoryClient::new("w1");
        let mut stream = client.subscribe("ql:w:w1").await.unwrap();
        assert_eq!(client.subscriber_count("ql:w:w1"), 1);

        assert_eq!(client.publish("ql:w:w1", "hello"), 1);
        assert_eq!(stream.next().await.as_deref(), Some("hello"));

        drop(stream);
        assert_eq!(client.subscriber_count("ql:w:w1"), 0);
    }
}
