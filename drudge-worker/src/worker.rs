//! Job worker: reservation loop, execution and outcome reporting

use drudge_config::WorkerConfig;
use drudge_interfaces::{distinct_clients, Job, JobError, JobRef, QueueClient, Reserver};
use futures::{Stream, StreamExt};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::current::CurrentJob;
use crate::error::{WorkerError, WorkerResult};
use crate::failure::{DefaultFailureFormatter, FailureFormatter};
use crate::listener::{LockLossListener, LockLostHandler};
use crate::middleware::{Chain, Middleware};
use crate::procline::Procline;
use crate::signals::{self, ControlSignal};
use crate::state::{DiagnosticHandler, RunOutcome, RunState, WorkerControl};

/// Signals a running worker reacts to
pub const WORKER_SIGNALS: [ControlSignal; 6] = [
    ControlSignal::Term,
    ControlSignal::Int,
    ControlSignal::Quit,
    ControlSignal::Hup,
    ControlSignal::Usr2,
    ControlSignal::Cont,
];

/// Configures and builds [`Worker`]s. Cloneable so a supervisor can build a
/// fresh worker in every child process.
#[derive(Clone)]
pub struct WorkerBuilder {
    reserver: Arc<dyn Reserver>,
    config: WorkerConfig,
    middlewares: Vec<Arc<dyn Middleware>>,
    on_lock_lost: Option<LockLostHandler>,
    on_diagnostic: Option<DiagnosticHandler>,
    failure_formatter: Arc<dyn FailureFormatter>,
}

impl WorkerBuilder {
    pub fn new(reserver: Arc<dyn Reserver>) -> Self {
        Self {
            reserver,
            config: WorkerConfig::default(),
            middlewares: Vec::new(),
            on_lock_lost: None,
            on_diagnostic: None,
            failure_formatter: Arc::new(DefaultFailureFormatter),
        }
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sleep between polls when idle or paused
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Append a middleware. The first one added is the outermost.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Replace the lock-loss callback. The default shuts the worker down
    /// gracefully once the revoked job has been abandoned.
    pub fn on_lock_lost<F>(mut self, handler: F) -> Self
    where
        F: Fn(&JobRef, &WorkerControl) + Send + Sync + 'static,
    {
        self.on_lock_lost = Some(Arc::new(handler));
        self
    }

    /// Callback run when a diagnostic dump is requested
    pub fn on_diagnostic<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_diagnostic = Some(Arc::new(handler));
        self
    }

    pub fn failure_formatter(mut self, formatter: Arc<dyn FailureFormatter>) -> Self {
        self.failure_formatter = formatter;
        self
    }

    pub fn worker_config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn build(self) -> Worker {
        let clients = distinct_clients(self.reserver.clients());
        let name = clients
            .first()
            .map(|client| client.worker_name().to_string())
            .unwrap_or_else(default_worker_name);
        let control = WorkerControl::new(
            self.reserver.description(),
            self.on_diagnostic,
            Procline::new(),
        );
        let on_lock_lost: LockLostHandler = match self.on_lock_lost {
            Some(handler) => handler,
            None => Arc::new(|_: &JobRef, control: &WorkerControl| control.shutdown(true)),
        };

        Worker {
            name,
            reserver: self.reserver,
            config: self.config,
            chain: Chain::new(self.middlewares),
            control,
            current: Arc::new(CurrentJob::new()),
            on_lock_lost,
            failure_formatter: self.failure_formatter,
            clients,
        }
    }
}

/// Reserves jobs one at a time and executes them through the middleware chain
pub struct Worker {
    name: String,
    reserver: Arc<dyn Reserver>,
    config: WorkerConfig,
    chain: Chain,
    control: WorkerControl,
    current: Arc<CurrentJob>,
    on_lock_lost: LockLostHandler,
    failure_formatter: Arc<dyn FailureFormatter>,
    clients: Vec<Arc<dyn QueueClient>>,
}

impl Worker {
    pub fn builder(reserver: Arc<dyn Reserver>) -> WorkerBuilder {
        WorkerBuilder::new(reserver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    pub fn state(&self) -> RunState {
        self.control.state()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn shutdown(&self, graceful: bool) {
        self.control.shutdown(graceful);
    }

    /// The job being executed right now, if any
    pub fn current_job(&self) -> Option<JobRef> {
        self.current.get()
    }

    pub fn procline(&self) -> String {
        self.control.procline().get()
    }

    /// Distinct engine clients of the reserver
    pub fn clients(&self) -> &[Arc<dyn QueueClient>] {
        &self.clients
    }

    /// Re-establish every engine connection, as needed after a fork
    pub async fn reconnect_clients(&self) -> WorkerResult<()> {
        for client in &self.clients {
            client
                .reconnect()
                .await
                .map_err(|source| WorkerError::Reconnect {
                    connection: client.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Run every middleware's post-fork hook
    pub async fn after_fork(&self) -> WorkerResult<()> {
        self.chain.after_fork().await.map_err(WorkerError::AfterFork)
    }

    /// Remove this worker from every engine's worker registry
    pub async fn deregister(&self) -> WorkerResult<()> {
        for client in &self.clients {
            let names = [client.worker_name().to_string()];
            client
                .deregister_workers(&names)
                .await
                .map_err(WorkerError::Deregister)?;
            info!("Deregistered worker {}", names[0]);
        }
        Ok(())
    }

    /// Run until the job source is drained by a shutdown request.
    ///
    /// An immediate stop returns [`RunOutcome::Terminated`]; the caller is
    /// expected to exit the process with its code without further work.
    pub async fn run(&self) -> WorkerResult<RunOutcome> {
        let span = info_span!("worker", pid = std::process::id(), name = %self.name);
        self.run_loop().instrument(span).await
    }

    async fn run_loop(&self) -> WorkerResult<RunOutcome> {
        let _signal_pump = if self.config.register_signal_handlers {
            signals::install(&WORKER_SIGNALS);
            Some(SignalPump(self.spawn_signal_pump()))
        } else {
            None
        };

        let listener = LockLossListener::start(
            &self.clients,
            self.current.clone(),
            self.control.clone(),
            self.on_lock_lost.clone(),
        )
        .await?;

        info!("Starting worker on {}", self.reserver.description());

        let halted = self.control.halted().clone();
        let jobs = self.jobs();
        tokio::pin!(jobs);

        loop {
            let next = tokio::select! {
                biased;
                _ = halted.cancelled() => None,
                job = jobs.next() => job,
            };

            match next {
                Some(job) => self.perform(job).await,
                None => break,
            }
        }

        self.current.clear();
        listener.stop().await;

        let outcome = match self.control.exit_code() {
            Some(exit_code) => RunOutcome::Terminated { exit_code },
            None => RunOutcome::Drained,
        };
        info!("Worker stopped: {:?}", outcome);
        Ok(outcome)
    }

    /// Lazily produced jobs. The current-job slot is set for each yielded job
    /// and cleared when the next one is requested. The stream ends once a
    /// shutdown is requested.
    pub fn jobs(&self) -> impl Stream<Item = JobRef> + '_ {
        futures::stream::unfold(false, move |resumed| async move {
            if resumed {
                self.current.clear();
                if self.control.state().is_shutting_down() {
                    return None;
                }
            }

            let job = self.next_job().await?;
            self.current.set(job.clone());
            Some((job, true))
        })
    }

    /// Poll the reserver until a job is available or a shutdown is requested
    pub async fn next_job(&self) -> Option<JobRef> {
        let mut state = self.control.subscribe();

        loop {
            match self.control.state() {
                RunState::ShuttingDownGraceful | RunState::ShuttingDownImmediate => return None,
                RunState::Paused => {
                    debug!("Paused, not reserving");
                    self.idle(&mut state).await;
                }
                RunState::Running => {
                    let reserved = match self.reserver.reserve().await {
                        Ok(job) => job,
                        Err(e) => {
                            error!("Error reserving job: {}", e);
                            None
                        }
                    };

                    match reserved {
                        Some(job) => return Some(job),
                        None if self.config.interval.is_zero() => tokio::task::yield_now().await,
                        None => {
                            self.control
                                .procline()
                                .set(&format!("Waiting for {}", self.reserver.description()));
                            debug!("Sleeping for {:?}", self.config.interval);
                            self.idle(&mut state).await;
                        }
                    }
                }
            }
        }
    }

    /// Sleep the poll interval, waking early on a state transition
    async fn idle(&self, state: &mut watch::Receiver<RunState>) {
        let interval = self.config.interval;
        if interval.is_zero() {
            // Nothing to sleep for; wait for the pause to be lifted instead
            let _ = state.changed().await;
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = state.changed() => {}
        }
    }

    /// Execute one job and report its outcome to the engine.
    ///
    /// Errors raised by the job are reported as failures and never escape.
    /// A job whose lock is lost mid-execution is abandoned without being
    /// completed or failed.
    pub async fn perform(&self, job: JobRef) {
        let _timer = JobTimer {
            job: &job,
            started: Instant::now(),
        };
        let lost = self.current.lost_token(&job).unwrap_or_default();
        let halted = self.control.halted().clone();
        self.control
            .procline()
            .set(&format!("Processing {}", job.description()));

        // The hook chain runs on its own task so an immediate stop is observed
        // even while the payload holds a runtime thread
        let chain = self.chain.clone();
        let task_job = job.clone();
        let mut execution =
            tokio::spawn(async move { chain.perform(&task_job).await }.in_current_span());

        let outcome = tokio::select! {
            biased;
            _ = halted.cancelled() => {
                execution.abort();
                warn!("Abandoning job {} for immediate shutdown", job.jid());
                return;
            }
            _ = lost.cancelled() => {
                execution.abort();
                Err(JobError::LockLost(job.jid().to_string()))
            }
            joined = &mut execution => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(JobError::failed(
                    "Panic",
                    anyhow::anyhow!(panic_message(e.into_panic().as_ref())),
                )),
                Err(e) => Err(JobError::failed("Cancelled", anyhow::anyhow!(e))),
            },
        };

        // A stop or lock loss raised while the payload was finishing wins
        // over its result
        if halted.is_cancelled() {
            warn!("Abandoning job {} for immediate shutdown", job.jid());
            return;
        }
        let outcome = if lost.is_cancelled() {
            Err(JobError::LockLost(job.jid().to_string()))
        } else {
            outcome
        };

        match outcome {
            Ok(()) => self.try_complete(&job).await,
            Err(JobError::LockLost(jid)) => {
                warn!("Lock lost for job {}, abandoning it", jid);
            }
            Err(error) => self.try_fail(&job, &error).await,
        }
    }

    async fn try_complete(&self, job: &JobRef) {
        if job.state_changed() {
            debug!("Job {} already changed state, not completing", job.jid());
            return;
        }

        match job.complete().await {
            Ok(()) => debug!("Completed job {}", job.jid()),
            Err(e) if e.is_ownership_race() => {
                warn!("Failed to complete {}: {}", job.description(), e);
            }
            Err(e) => error!("Failed to complete {}: {}", job.description(), e),
        }
    }

    async fn try_fail(&self, job: &JobRef, error: &JobError) {
        let failure = self.failure_formatter.format(job.as_ref(), error, &self.name);
        error!(
            group = %failure.group,
            "Got {} failure from {}: {}",
            failure.group,
            job.description(),
            failure.message
        );

        match job.fail(&failure).await {
            Ok(()) => {}
            Err(e) if e.is_ownership_race() => {
                warn!("Failed to fail {}: {}", job.description(), e);
            }
            Err(e) => error!("Failed to fail {}: {}", job.description(), e),
        }
    }

    fn spawn_signal_pump(&self) -> JoinHandle<()> {
        let control = self.control.clone();
        let period = self.config.signal_poll_interval.max(Duration::from_millis(1));

        let pump = async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                for signal in signals::drain() {
                    info!("Received {}", signal);
                    control.handle_signal(signal);
                }
            }
        };
        tokio::spawn(pump.in_current_span())
    }
}

/// Logs how long a job took when dropped, however execution ended
struct JobTimer<'a> {
    job: &'a JobRef,
    started: Instant,
}

impl Drop for JobTimer<'_> {
    fn drop(&mut self) {
        info!(
            "Job {} took {:.3} seconds",
            self.job.description(),
            self.started.elapsed().as_secs_f64()
        );
    }
}

/// Signal handlers stay installed for as long as this lives
struct SignalPump(JoinHandle<()>);

impl Drop for SignalPump {
    fn drop(&mut self) {
        self.0.abort();
        signals::reset();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}

fn default_worker_name() -> String {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use drudge_interfaces::testing::{Behavior, MemoryClient, QueueReserver, TestJob};
    use drudge_interfaces::{EngineError, Failure, LockLossNotification};

    fn reserver_with(clients: &[&Arc<MemoryClient>]) -> Arc<QueueReserver> {
        let clients = clients
            .iter()
            .map(|client| Arc::clone(client) as Arc<dyn QueueClient>)
            .collect();
        Arc::new(QueueReserver::new(clients))
    }

    fn builder(reserver: &Arc<QueueReserver>, interval: Duration) -> WorkerBuilder {
        let config = WorkerConfig {
            interval,
            register_signal_handlers: false,
            ..WorkerConfig::default()
        };
        WorkerBuilder::new(reserver.clone()).config(config)
    }

    fn spawn_run(worker: &Arc<Worker>) -> JoinHandle<WorkerResult<RunOutcome>> {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Formatted log output collected by a thread-local subscriber
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock())
                .lines()
                .map(str::to_string)
                .collect()
        }

        fn line_containing(&self, needle: &str) -> String {
            self.lines()
                .into_iter()
                .find(|line| line.contains(needle))
                .unwrap_or_else(|| panic!("no log line contains {:?}: {:#?}", needle, self.lines()))
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    #[derive(Debug)]
    struct PanickingJob;

    #[async_trait]
    impl Job for PanickingJob {
        fn jid(&self) -> &str {
            "boom"
        }

        fn job_type(&self) -> &str {
            "PanickingJob"
        }

        async fn perform(&self) -> Result<(), JobError> {
            panic!("index out of bounds");
        }

        fn state_changed(&self) -> bool {
            false
        }

        async fn complete(&self) -> Result<(), EngineError> {
            panic!("a panicked job must not be completed");
        }

        async fn fail(&self, failure: &Failure) -> Result<(), EngineError> {
            assert_eq!(failure.group, "PanickingJob:Panic");
            assert_eq!(failure.message, "index out of bounds");
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_jobs_in_reservation_order() {
        let reserver = reserver_with(&[]);
        let first = TestJob::new("a").into_ref();
        let second = TestJob::new("b").into_ref();
        reserver.push(first.clone());
        reserver.push(second.clone());

        let worker = Arc::new(builder(&reserver, Duration::from_secs(1)).build());
        let handle = spawn_run(&worker);

        wait_until(|| second.is_completed()).await;
        assert!(first.is_completed());
        assert!(worker.current_job().is_none());

        worker.shutdown(true);
        assert_eq!(handle.await.unwrap().unwrap(), RunOutcome::Drained);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservation_errors_are_not_fatal() {
        let reserver = reserver_with(&[]);
        let job = TestJob::new("a").into_ref();
        reserver.push(job.clone());
        reserver.fail_next(2);

        let worker = Arc::new(builder(&reserver, Duration::from_secs(1)).build());
        let handle = spawn_run(&worker);

        wait_until(|| job.is_completed()).await;
        assert_eq!(reserver.reserve_count(), 3);

        worker.shutdown(true);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_interval_sleeps_between_polls() {
        let reserver = reserver_with(&[]);
        let worker = Arc::new(builder(&reserver, Duration::from_secs(5)).build());
        let handle = spawn_run(&worker);

        // Polls at 0s, 5s and 10s
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(reserver.reserve_count(), 3);
        assert!(worker.procline().contains("Waiting for memory queue"));

        worker.shutdown(true);
        assert_eq!(handle.await.unwrap().unwrap(), RunOutcome::Drained);
        assert_eq!(reserver.reserve_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_polls_without_sleeping() {
        let reserver = reserver_with(&[]);
        let worker = Arc::new(builder(&reserver, Duration::ZERO).build());
        let started = tokio::time::Instant::now();
        let handle = spawn_run(&worker);

        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert!(reserver.reserve_count() > 10);
        assert_eq!(tokio::time::Instant::now(), started);

        worker.shutdown(true);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_worker_does_not_reserve() {
        let reserver = reserver_with(&[]);
        let job = TestJob::new("a").into_ref();
        reserver.push(job.clone());

        let worker = Arc::new(builder(&reserver, Duration::from_secs(1)).build());
        worker.pause();
        let handle = spawn_run(&worker);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(reserver.reserve_count(), 0);
        assert!(worker.procline().contains("Paused -- memory queue"));

        worker.resume();
        wait_until(|| job.is_completed()).await;

        worker.shutdown(true);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_shutdown_finishes_current_job() {
        let reserver = reserver_with(&[]);
        let job = TestJob::new("a")
            .with_behavior(Behavior::Sleep(Duration::from_secs(5)))
            .into_ref();
        reserver.push(job.clone());
        reserver.push(TestJob::new("b").into_ref());

        let worker = Arc::new(builder(&reserver, Duration::from_secs(1)).build());
        let handle = spawn_run(&worker);

        job.wait_started().await;
        worker.shutdown(true);

        assert_eq!(handle.await.unwrap().unwrap(), RunOutcome::Drained);
        assert!(job.is_completed());
        assert_eq!(reserver.remaining(), 1);
        assert_eq!(reserver.reserve_count(), 1);
    }

    #[tokio::test]
    async fn test_immediate_shutdown_abandons_current_job() {
        let reserver = reserver_with(&[]);
        let job = TestJob::new("a").with_behavior(Behavior::Hang).into_ref();
        reserver.push(job.clone());

        let worker = Arc::new(builder(&reserver, Duration::from_secs(1)).build());
        let handle = spawn_run(&worker);

        job.wait_started().await;
        worker.shutdown(false);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Terminated { exit_code: 1 });
        assert!(!job.is_completed());
        assert!(job.failures().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_immediate_shutdown_does_not_wait_for_blocking_job() {
        let reserver = reserver_with(&[]);
        let job = TestJob::new("a")
            .with_behavior(Behavior::Block(Duration::from_millis(1500)))
            .into_ref();
        reserver.push(job.clone());

        let worker = Arc::new(builder(&reserver, Duration::from_secs(1)).build());
        let started = Instant::now();
        let handle = spawn_run(&worker);

        job.wait_started().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        worker.shutdown(false);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Terminated { exit_code: 1 });
        assert!(started.elapsed() < Duration::from_millis(1200));

        // The payload finishing afterwards reports nothing
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!job.is_completed());
        assert!(job.failures().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_before_run_reserves_nothing() {
        let reserver = reserver_with(&[]);
        reserver.push(TestJob::new("a").into_ref());

        let worker = builder(&reserver, Duration::from_secs(1)).build();
        worker.shutdown(true);

        assert_eq!(worker.run().await.unwrap(), RunOutcome::Drained);
        assert_eq!(reserver.reserve_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_job_is_reported() {
        let reserver = reserver_with(&[]);
        let worker = builder(&reserver, Duration::ZERO).build();
        let job = TestJob::new("a").failing("ValueError", "bad input").into_ref();
        let (logs, _guard) = capture_logs();

        worker.perform(job.clone()).await;

        let reported = logs.line_containing("Got TestJob:ValueError failure");
        assert!(reported.contains("ERROR"));
        assert!(reported.contains("bad input"));
        assert!(reported.contains("group=TestJob:ValueError"));

        assert!(!job.is_completed());
        let failures = job.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].group, "TestJob:ValueError");
        assert_eq!(failures[0].message, "bad input");
        assert!(failures[0].trace.contains(worker.name()));
    }

    #[tokio::test]
    async fn test_panicking_job_is_failed() {
        let reserver = reserver_with(&[]);
        let worker = builder(&reserver, Duration::ZERO).build();

        // Assertions live in PanickingJob::fail
        worker.perform(Arc::new(PanickingJob)).await;
    }

    #[tokio::test]
    async fn test_ownership_races_are_contained() {
        let reserver = reserver_with(&[]);
        let worker = builder(&reserver, Duration::ZERO).build();
        let (logs, _guard) = capture_logs();

        let failing = TestJob::new("a")
            .failing("ValueError", "bad input")
            .reject_fail(EngineError::AlreadyChanged("a".to_string()))
            .into_ref();
        worker.perform(failing.clone()).await;
        assert!(failing.failures().is_empty());

        let succeeding = TestJob::new("b")
            .reject_complete(EngineError::AlreadyChanged("b".to_string()))
            .into_ref();
        worker.perform(succeeding.clone()).await;
        assert!(!succeeding.is_completed());
        assert_eq!(succeeding.perform_count(), 1);

        // Races are logged as warnings, not errors
        let failed = logs.line_containing("Failed to fail");
        assert!(failed.contains("WARN"));
        assert!(failed.contains("already changed"));
        let completed = logs.line_containing("Failed to complete");
        assert!(completed.contains("WARN"));
    }

    #[tokio::test]
    async fn test_self_completed_job_is_not_completed_again() {
        let reserver = reserver_with(&[]);
        let worker = builder(&reserver, Duration::ZERO).build();
        let job = TestJob::new("a").with_behavior(Behavior::SelfComplete).into_ref();

        worker.perform(job.clone()).await;
        assert_eq!(job.completions(), 1);
    }

    #[tokio::test]
    async fn test_lock_loss_abandons_job_and_stops_gracefully() {
        let client = Arc::new(MemoryClient::new("w1"));
        let reserver = reserver_with(&[&client]);
        let job = TestJob::new("abc").with_behavior(Behavior::Hang).into_ref();
        reserver.push(job.clone());

        let worker = Arc::new(builder(&reserver, Duration::from_millis(10)).build());
        assert_eq!(worker.name(), "w1");
        let handle = spawn_run(&worker);

        job.wait_started().await;
        client.wait_for_subscriber("ql:w:w1").await;
        client.publish("ql:w:w1", LockLossNotification::lock_lost("abc").to_json());

        assert_eq!(handle.await.unwrap().unwrap(), RunOutcome::Drained);
        assert!(!job.is_completed());
        assert!(job.failures().is_empty());
        assert_eq!(client.subscriber_count("ql:w:w1"), 0);
    }

    #[tokio::test]
    async fn test_lock_loss_for_other_job_is_ignored() {
        let client = Arc::new(MemoryClient::new("w1"));
        let reserver = reserver_with(&[&client]);
        let job = TestJob::new("abc").with_behavior(Behavior::Hang).into_ref();
        reserver.push(job.clone());

        let worker = Arc::new(builder(&reserver, Duration::from_millis(10)).build());
        let handle = spawn_run(&worker);

        job.wait_started().await;
        client.wait_for_subscriber("ql:w:w1").await;
        client.publish("ql:w:w1", LockLossNotification::lock_lost("xyz").to_json());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(worker.state(), RunState::Running);
        let current = worker.current_job().map(|job| job.jid().to_string());
        assert_eq!(current.as_deref(), Some("abc"));

        worker.shutdown(false);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_custom_lock_loss_handler() {
        let client = Arc::new(MemoryClient::new("w1"));
        let reserver = reserver_with(&[&client]);
        let job = TestJob::new("abc").with_behavior(Behavior::Hang).into_ref();
        reserver.push(job.clone());

        let worker = Arc::new(
            builder(&reserver, Duration::from_millis(10))
                .on_lock_lost(|_, control| control.terminate(11))
                .build(),
        );
        let handle = spawn_run(&worker);

        job.wait_started().await;
        client.wait_for_subscriber("ql:w:w1").await;
        client.publish("ql:w:w1", LockLossNotification::lock_lost("abc").to_json());

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Terminated { exit_code: 11 });
    }

    #[tokio::test]
    async fn test_client_operations_use_distinct_clients() {
        let client = Arc::new(MemoryClient::new("w1"));
        let reserver = reserver_with(&[&client, &client]);
        let worker = builder(&reserver, Duration::ZERO).build();
        assert_eq!(worker.clients().len(), 1);

        worker.reconnect_clients().await.unwrap();
        assert_eq!(client.reconnect_count(), 1);

        worker.deregister().await.unwrap();
        assert_eq!(client.deregistered(), vec!["w1".to_string()]);
    }

    #[tokio::test]
    async fn test_reconnect_failure_is_reported() {
        let client = Arc::new(MemoryClient::new("w1"));
        client.fail_reconnects(true);
        let reserver = reserver_with(&[&client]);
        let worker = builder(&reserver, Duration::ZERO).build();

        let err = worker.reconnect_clients().await.unwrap_err();
        assert!(matches!(err, WorkerError::Reconnect { ref connection, .. } if connection == "memory"));
    }

    #[test]
    fn test_default_name_without_clients() {
        let reserver = reserver_with(&[]);
        let worker = builder(&reserver, Duration::ZERO).build();
        assert!(worker.name().ends_with(&format!("-{}", std::process::id())));
    }
}
