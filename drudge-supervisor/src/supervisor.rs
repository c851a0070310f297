//! Worker pool supervisor

use drudge_config::{SupervisorConfig, Validatable};
use drudge_worker::{signals, ControlSignal, DiagnosticHandler, WorkerBuilder};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::child::run_child;
use crate::error::{SupervisorError, SupervisorResult};
use crate::process::ProcessControl;
use crate::slots::{Slot, SlotTable};

/// Signals the supervisor handles
pub const SUPERVISOR_SIGNALS: [ControlSignal; 7] = ControlSignal::ALL;

/// Keeps `num_workers` worker processes alive until told to shut down.
///
/// | Signal          | Reaction                                        |
/// |-----------------|-------------------------------------------------|
/// | TERM, INT, QUIT | forward to children, wait for them, stop        |
/// | USR1            | send TERM to children; they are replaced        |
/// | USR2, CONT      | forward to children (pause, resume)             |
/// | HUP             | diagnostic dump                                 |
///
/// The supervisor loop is synchronous and must not run inside an async
/// runtime, since children are forked from it.
pub struct Supervisor {
    inner: Arc<Inner>,
}

/// Cloneable handle for controlling a running [`Supervisor`] from other
/// threads
#[derive(Clone)]
pub struct SupervisorHandle {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    builder: WorkerBuilder,
    process: Arc<dyn ProcessControl>,
    slots: Mutex<SlotTable>,
    shutting_down: AtomicBool,
    draining: AtomicUsize,
    requests: Mutex<Vec<ControlSignal>>,
    diagnostic: Mutex<Option<DiagnosticHandler>>,
}

impl Supervisor {
    /// Supervisor forking real child processes
    #[cfg(unix)]
    pub fn new(config: SupervisorConfig, builder: WorkerBuilder) -> Self {
        Self::with_process_control(config, builder, Arc::new(crate::process::ForkProcesses))
    }

    pub fn with_process_control(
        config: SupervisorConfig,
        builder: WorkerBuilder,
        process: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                builder,
                process,
                slots: Mutex::new(SlotTable::new()),
                shutting_down: AtomicBool::new(false),
                draining: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                diagnostic: Mutex::new(None),
            }),
        }
    }

    /// Callback run on a diagnostic dump (HUP)
    pub fn on_diagnostic<F>(self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.diagnostic.lock() = Some(Arc::new(handler));
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            inner: self.inner.clone(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Start the pool and supervise it until a shutdown completes
    pub fn run(&self) -> SupervisorResult<()> {
        self.inner.config.validate()?;
        signals::install(&SUPERVISOR_SIGNALS);
        self.start();

        let reap_interval = self.inner.config.reap_interval;
        let mut shutdown_threads: Vec<JoinHandle<()>> = Vec::new();

        loop {
            let mut pending = signals::drain();
            pending.extend(self.inner.requests.lock().drain(..));
            for signal in pending {
                if let Some(thread) = self.dispatch(signal) {
                    shutdown_threads.push(thread);
                }
            }

            if self.inner.is_shutting_down() {
                let (finished, running): (Vec<_>, Vec<_>) =
                    shutdown_threads.into_iter().partition(|thread| thread.is_finished());
                for thread in finished {
                    if thread.join().is_err() {
                        error!("Shutdown thread panicked");
                    }
                }
                shutdown_threads = running;

                if shutdown_threads.is_empty() && self.inner.draining.load(Ordering::SeqCst) == 0 {
                    break;
                }
                thread::sleep(reap_interval);
            } else if !self.reap_once() {
                thread::sleep(reap_interval);
            }
        }

        signals::reset();
        info!("Supervisor stopped");
        Ok(())
    }

    /// Spawn one child per slot, each with a random startup delay
    pub fn start(&self) {
        let config = &self.inner.config;
        debug!("Starting to run with {} workers", config.num_workers);

        let mut slots = self.inner.slots.lock();
        for worker_id in 0..config.num_workers {
            let stagger = startup_stagger(config.max_startup_interval);
            self.inner
                .spawn_slot(&mut slots, Slot::new(worker_id), stagger, None);
        }
    }

    /// Reap at most one exited child, replacing it unless shutting down.
    /// Returns whether a child was reaped.
    pub fn reap_once(&self) -> bool {
        self.inner.reap_once()
    }

    pub fn children(&self) -> Vec<i32> {
        self.inner.children()
    }

    pub fn stop(&self, signal: ControlSignal) {
        self.inner.stop(signal);
    }

    pub fn stop_and_wait(&self, signal: ControlSignal) {
        self.inner.stop_and_wait(signal);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// React to one signal. Shutdown signals return the thread draining the
    /// pool.
    fn dispatch(&self, signal: ControlSignal) -> Option<JoinHandle<()>> {
        info!("Supervisor received {}", signal);

        match signal {
            ControlSignal::Term | ControlSignal::Int | ControlSignal::Quit => {
                if self.inner.is_shutting_down() {
                    // Already draining; pass the new signal on so it can escalate
                    self.inner.stop(signal);
                    return None;
                }
                self.inner.shutting_down.store(true, Ordering::SeqCst);

                let inner = self.inner.clone();
                let spawned = thread::Builder::new()
                    .name("drudge-shutdown".to_string())
                    .spawn(move || inner.stop_and_wait(signal));
                match spawned {
                    Ok(thread) => Some(thread),
                    Err(e) => {
                        error!("Failed to start shutdown thread: {}", e);
                        self.inner.stop_and_wait(signal);
                        None
                    }
                }
            }
            ControlSignal::Usr1 => {
                self.inner.stop(ControlSignal::Term);
                None
            }
            ControlSignal::Usr2 | ControlSignal::Cont => {
                self.inner.stop(signal);
                None
            }
            ControlSignal::Hup => {
                self.inner.dump_diagnostics();
                None
            }
        }
    }
}

impl SupervisorHandle {
    /// Pids of the live children
    pub fn children(&self) -> Vec<i32> {
        self.inner.children()
    }

    /// Send `signal` to every child
    pub fn stop(&self, signal: ControlSignal) {
        self.inner.stop(signal);
    }

    /// Shut down, send `signal` to every child and wait for them to exit
    pub fn stop_and_wait(&self, signal: ControlSignal) {
        self.inner.stop_and_wait(signal);
    }

    /// Ask the running supervisor loop to shut down, letting children finish
    /// their current job when `graceful`
    pub fn shutdown(&self, graceful: bool) {
        let signal = if graceful {
            ControlSignal::Quit
        } else {
            ControlSignal::Term
        };
        self.inner.requests.lock().push(signal);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }
}

impl Inner {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn children(&self) -> Vec<i32> {
        self.slots.lock().pids()
    }

    fn spawn_slot(
        &self,
        slots: &mut SlotTable,
        slot: Slot,
        stagger: Duration,
        replacing: Option<i32>,
    ) {
        let worker_id = slot.worker_id;
        let entry = || run_child(&self.builder, worker_id, stagger);

        match self.process.spawn(&entry) {
            Ok(pid) => {
                match replacing {
                    Some(old) => info!("Spawned worker {} to replace {}", pid, old),
                    None => info!("Spawned worker {}", pid),
                }
                slots.insert(pid, slot);
            }
            Err(source) => {
                error!("{}", SupervisorError::Spawn { worker_id, source });
                slots.vacate(slot);
            }
        }
    }

    fn reap_once(&self) -> bool {
        let mut slots = self.slots.lock();

        if !self.is_shutting_down() {
            for slot in slots.take_vacant() {
                self.spawn_slot(&mut slots, slot, Duration::ZERO, None);
            }
        }
        if slots.is_empty() {
            return false;
        }

        let exit = match self.process.try_wait_any() {
            Ok(Some(exit)) => exit,
            Ok(None) => return false,
            Err(e) => {
                error!("{}", SupervisorError::Wait(e));
                return false;
            }
        };

        if exit.status.success() {
            info!("Worker process {} died with {}", exit.pid, exit.status);
        } else {
            warn!("Worker process {} died with {}", exit.pid, exit.status);
        }

        let Some(slot) = slots.remove(exit.pid) else {
            warn!("Reaped unknown child {}", exit.pid);
            return true;
        };
        if self.is_shutting_down() {
            debug!("Not replacing {} during shutdown", exit.pid);
            return true;
        }

        self.spawn_slot(&mut slots, slot, Duration::ZERO, Some(exit.pid));
        true
    }

    fn stop(&self, signal: ControlSignal) {
        let slots = self.slots.lock();
        warn!("Sending {} to children", signal);

        for pid in slots.pids() {
            if let Err(source) = self.process.signal(pid, signal) {
                error!("{}", SupervisorError::Signal { pid, signal, source });
            }
        }
    }

    fn stop_and_wait(&self, signal: ControlSignal) {
        let _draining = DrainGuard::new(&self.draining);
        self.shutting_down.store(true, Ordering::SeqCst);
        self.stop(signal);

        warn!("Waiting for child processes");
        let deadline = Instant::now() + self.config.shutdown_timeout;

        loop {
            {
                let mut slots = self.slots.lock();
                if slots.is_empty() {
                    break;
                }

                match self.process.try_wait_any() {
                    Ok(Some(exit)) => {
                        warn!("Child {} stopped with {}", exit.pid, exit.status);
                        slots.remove(exit.pid);
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("{}", SupervisorError::Wait(e));
                        break;
                    }
                }
            }

            if Instant::now() >= deadline {
                warn!(
                    "Children still running after {:?}",
                    self.config.shutdown_timeout
                );
                break;
            }
            thread::sleep(self.config.reap_interval);
        }

        let mut slots = self.slots.lock();
        for pid in slots.pids() {
            warn!("Could not wait for child {}", pid);
        }
        slots.clear();
        warn!("All children have stopped");
    }

    fn dump_diagnostics(&self) {
        let children = self.children();
        info!(children = ?children, "Diagnostic dump requested");
        if let Some(diagnostic) = self.diagnostic.lock().clone() {
            diagnostic();
        }
    }
}

/// Counts a shutdown drain in progress for as long as it lives
struct DrainGuard<'a>(&'a AtomicUsize);

impl<'a> DrainGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Random delay in `[0, max)`, zero when staggering is disabled
fn startup_stagger(max: Duration) -> Duration {
    if max.is_zero() {
        Duration::ZERO
    } else {
        rand::thread_rng().gen_range(Duration::ZERO..max)
    }
}
