//! End-to-end worker runs against an in-memory engine whose queue operations
//! are engine-resident scripts

use anyhow::Result;
use async_trait::async_trait;
use drudge_config::{ConfigLoader, WorkerConfig};
use drudge_interfaces::testing::{MemoryClient, MemoryScriptStore, QueueReserver};
use drudge_interfaces::{EngineError, Failure, Job, JobError, JobRef, QueueClient};
use drudge_script::{ScriptError, ScriptGateway};
use drudge_worker::{Middleware, Next, RunOutcome, Worker, WorkerBuilder};
use parking_lot::Mutex;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const HEARTBEAT: &str = "-- heartbeat\nreturn redis.call('hset', KEYS[1])";
const COMPLETE: &str = "-- complete\nreturn 'complete'";
const FAIL: &str = "-- fail\nreturn 'failed'";

/// What the engine scripts were asked to do
#[derive(Default)]
struct EngineLog {
    completed: Mutex<Vec<String>>,
    failed: Mutex<Vec<(String, String, String)>>,
}

fn engine(log: &Arc<EngineLog>) -> Arc<MemoryScriptStore> {
    let log = log.clone();
    Arc::new(MemoryScriptStore::with_handler(move |source, args| {
        let jid = args.first().cloned().unwrap_or_default();
        match source {
            HEARTBEAT if jid.starts_with("locked") => Err(EngineError::Command(format!(
                "ERR Error running script (call to f_5d2c): @user_script:42: Job {} is not currently running",
                jid
            ))),
            HEARTBEAT => Ok(json!(jid)),
            COMPLETE => {
                log.completed.lock().push(jid);
                Ok(json!("complete"))
            }
            FAIL => {
                log.failed
                    .lock()
                    .push((jid, args[1].clone(), args[2].clone()));
                Ok(json!("failed"))
            }
            other => Err(EngineError::Command(format!("unknown script {}", other))),
        }
    }))
}

#[derive(Debug)]
struct Scripts {
    heartbeat: ScriptGateway,
    complete: ScriptGateway,
    fail: ScriptGateway,
}

impl Scripts {
    fn new(store: &Arc<MemoryScriptStore>) -> Arc<Self> {
        Arc::new(Self {
            heartbeat: ScriptGateway::new("heartbeat", store.clone(), HEARTBEAT),
            complete: ScriptGateway::new("complete", store.clone(), COMPLETE),
            fail: ScriptGateway::new("fail", store.clone(), FAIL),
        })
    }
}

fn engine_error(err: ScriptError) -> EngineError {
    match err {
        ScriptError::Runtime(message) => EngineError::Command(message),
        ScriptError::Engine(err) => err,
    }
}

/// Job whose every engine interaction goes through a script
#[derive(Debug)]
struct ScriptJob {
    jid: String,
    scripts: Arc<Scripts>,
}

impl ScriptJob {
    fn new(jid: &str, scripts: &Arc<Scripts>) -> Arc<Self> {
        Arc::new(Self {
            jid: jid.to_string(),
            scripts: scripts.clone(),
        })
    }
}

#[async_trait]
impl Job for ScriptJob {
    fn jid(&self) -> &str {
        &self.jid
    }

    fn job_type(&self) -> &str {
        "ScriptJob"
    }

    async fn perform(&self) -> Result<(), JobError> {
        self.scripts
            .heartbeat
            .call(&[self.jid.as_str()])
            .await
            .map_err(|e| JobError::failed("ScriptError", e))?;
        Ok(())
    }

    fn state_changed(&self) -> bool {
        false
    }

    async fn complete(&self) -> Result<(), EngineError> {
        self.scripts
            .complete
            .call(&[self.jid.as_str()])
            .await
            .map_err(engine_error)?;
        Ok(())
    }

    async fn fail(&self, failure: &Failure) -> Result<(), EngineError> {
        let args = [self.jid.as_str(), failure.group.as_str(), failure.message.as_str()];
        self.scripts.fail.call(&args).await.map_err(engine_error)?;
        Ok(())
    }
}

/// Records the jobs it wraps
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Middleware for Recorder {
    async fn around_perform(&self, job: &JobRef, next: Next<'_>) -> Result<(), JobError> {
        self.seen.lock().push(job.jid().to_string());
        next.run(job).await
    }
}

fn reserver(client: &Arc<MemoryClient>) -> Arc<QueueReserver> {
    let clients: Vec<Arc<dyn QueueClient>> = vec![client.clone()];
    Arc::new(QueueReserver::new(clients))
}

fn builder(reserver: &Arc<QueueReserver>) -> WorkerBuilder {
    let config = WorkerConfig {
        interval: Duration::from_millis(10),
        register_signal_handlers: false,
        ..WorkerConfig::default()
    };
    WorkerBuilder::new(reserver.clone()).config(config)
}

async fn wait_until(condition: impl Fn() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn run_until(worker: Worker, condition: impl Fn() -> bool) -> Result<RunOutcome> {
    let worker = Arc::new(worker);
    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    tokio::time::timeout(Duration::from_secs(10), wait_until(condition)).await?;
    worker.shutdown(true);
    Ok(runner.await??)
}

#[tokio::test]
async fn test_jobs_complete_through_engine_scripts() -> Result<()> {
    drudge_logging::init_simple_tracing("debug")?;

    let log = Arc::new(EngineLog::default());
    let store = engine(&log);
    let scripts = Scripts::new(&store);

    let client = Arc::new(MemoryClient::new("pipeline-1"));
    let reserver = reserver(&client);
    reserver.push(ScriptJob::new("a", &scripts));
    reserver.push(ScriptJob::new("b", &scripts));

    let recorder = Arc::new(Recorder::default());
    let worker = builder(&reserver).middleware(recorder.clone()).build();
    assert_eq!(worker.name(), "pipeline-1");

    let outcome = run_until(worker, || log.completed.lock().len() == 2).await?;

    assert_eq!(outcome, RunOutcome::Drained);
    assert_eq!(*log.completed.lock(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(*recorder.seen.lock(), vec!["a".to_string(), "b".to_string()]);
    assert!(log.failed.lock().is_empty());

    // The engine started empty, so each script used was loaded exactly once
    assert_eq!(store.load_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_engine_cache_flush_is_transparent() -> Result<()> {
    let log = Arc::new(EngineLog::default());
    let store = engine(&log);
    let scripts = Scripts::new(&store);
    scripts.heartbeat.load().await?;
    scripts.complete.load().await?;

    let client = Arc::new(MemoryClient::new("pipeline-2"));
    let reserver = reserver(&client);
    reserver.push(ScriptJob::new("a", &scripts));

    // Engine restarted after the scripts were loaded
    store.flush();

    let worker = builder(&reserver).build();
    let outcome = run_until(worker, || log.completed.lock().len() == 1).await?;

    assert_eq!(outcome, RunOutcome::Drained);
    assert_eq!(store.load_count(), 4);
    Ok(())
}

#[tokio::test]
async fn test_script_runtime_error_fails_job() -> Result<()> {
    let log = Arc::new(EngineLog::default());
    let store = engine(&log);
    let scripts = Scripts::new(&store);

    let client = Arc::new(MemoryClient::new("pipeline-3"));
    let reserver = reserver(&client);
    reserver.push(ScriptJob::new("locked-1", &scripts));

    let worker = builder(&reserver).build();
    let outcome = run_until(worker, || !log.failed.lock().is_empty()).await?;

    assert_eq!(outcome, RunOutcome::Drained);
    assert!(log.completed.lock().is_empty());

    let failed = log.failed.lock().clone();
    assert_eq!(
        failed,
        vec![(
            "locked-1".to_string(),
            "ScriptJob:ScriptError".to_string(),
            "Job locked-1 is not currently running".to_string(),
        )]
    );
    Ok(())
}

#[tokio::test]
async fn test_worker_from_config_file() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(
        file,
        "worker:\n  interval: 25ms\n  register_signal_handlers: false\nlogging:\n  level: debug"
    )?;

    let config = ConfigLoader::with_prefix("DRUDGE_PIPELINE_TEST").from_file(file.path())?;
    assert_eq!(config.worker.interval, Duration::from_millis(25));

    let log = Arc::new(EngineLog::default());
    let scripts = Scripts::new(&engine(&log));
    let client = Arc::new(MemoryClient::new("pipeline-4"));
    let reserver = reserver(&client);
    reserver.push(ScriptJob::new("a", &scripts));

    let worker = WorkerBuilder::new(reserver.clone())
        .config(config.worker)
        .build();
    assert!(!worker.config().register_signal_handlers);

    let outcome = run_until(worker, || log.completed.lock().len() == 1).await?;
    assert_eq!(outcome, RunOutcome::Drained);
    Ok(())
}
