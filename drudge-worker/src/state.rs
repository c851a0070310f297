//! Worker run state and the control surface used by signals and callbacks

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::procline::Procline;
use crate::signals::ControlSignal;

/// Exit status of a worker stopped immediately by TERM or INT
pub const IMMEDIATE_EXIT_CODE: i32 = 1;

/// Callback run when a diagnostic dump is requested (HUP)
pub type DiagnosticHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    /// Finish the current job, then stop
    ShuttingDownGraceful,
    /// Abandon the current job and stop now
    ShuttingDownImmediate,
}

impl RunState {
    pub fn is_shutting_down(self) -> bool {
        matches!(
            self,
            RunState::ShuttingDownGraceful | RunState::ShuttingDownImmediate
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::ShuttingDownGraceful => "shutting down (graceful)",
            RunState::ShuttingDownImmediate => "shutting down (immediate)",
        };
        f.write_str(name)
    }
}

/// How a worker's run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The job source was exhausted or a graceful shutdown completed
    Drained,
    /// Stopped immediately; the process should exit with `exit_code`
    /// without doing any further work
    Terminated { exit_code: i32 },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Drained => 0,
            RunOutcome::Terminated { exit_code } => *exit_code,
        }
    }
}

/// Cloneable handle controlling one worker.
///
/// All transitions are plain memory updates, so the handle may be used from
/// signal-draining tasks, lock-loss callbacks or other threads.
#[derive(Clone)]
pub struct WorkerControl {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    state: watch::Sender<RunState>,
    halt: CancellationToken,
    exit_code: AtomicI32,
    diagnostic: Option<DiagnosticHandler>,
    procline: Procline,
    reserver_description: String,
}

impl WorkerControl {
    pub(crate) fn new(
        reserver_description: String,
        diagnostic: Option<DiagnosticHandler>,
        procline: Procline,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Running);
        Self {
            inner: Arc::new(ControlInner {
                state,
                halt: CancellationToken::new(),
                exit_code: AtomicI32::new(0),
                diagnostic,
                procline,
                reserver_description,
            }),
        }
    }

    pub fn state(&self) -> RunState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.inner.state.subscribe()
    }

    /// Stop reserving new jobs until resumed. Ignored once shutting down.
    pub fn pause(&self) {
        let paused = self.transition(|state| match state {
            RunState::Running => Some(RunState::Paused),
            _ => None,
        });

        if paused {
            info!("Pausing worker");
            self.inner
                .procline
                .set(&format!("Paused -- {}", self.inner.reserver_description));
        }
    }

    /// Resume reservation after a pause. Ignored once shutting down.
    pub fn resume(&self) {
        let resumed = self.transition(|state| match state {
            RunState::Paused => Some(RunState::Running),
            _ => None,
        });

        if resumed {
            info!("Resuming worker");
        }
    }

    /// Request a stop. A graceful stop lets the current job finish; an
    /// immediate one abandons it and ends with [`IMMEDIATE_EXIT_CODE`].
    pub fn shutdown(&self, graceful: bool) {
        if !graceful {
            self.terminate(IMMEDIATE_EXIT_CODE);
            return;
        }

        let changed = self.transition(|state| match state {
            RunState::Running | RunState::Paused => Some(RunState::ShuttingDownGraceful),
            _ => None,
        });

        if changed {
            info!("Shutting down after the current job");
        }
    }

    /// Stop immediately, abandoning the current job, and end the run with
    /// the given exit code. The first exit code recorded wins.
    pub fn terminate(&self, exit_code: i32) {
        let changed = self.transition(|state| match state {
            RunState::ShuttingDownImmediate => None,
            _ => Some(RunState::ShuttingDownImmediate),
        });

        if changed {
            warn!("Stopping immediately with exit code {}", exit_code);
            self.inner.exit_code.store(exit_code, Ordering::SeqCst);
        }
        self.inner.halt.cancel();
    }

    /// Exit code of an immediate stop, if one was requested
    pub fn exit_code(&self) -> Option<i32> {
        match self.state() {
            RunState::ShuttingDownImmediate => Some(self.inner.exit_code.load(Ordering::SeqCst)),
            _ => None,
        }
    }

    /// Log the worker's state and run the diagnostic callback, if any
    pub fn dump_diagnostics(&self) {
        info!(
            state = %self.state(),
            procline = %self.inner.procline.get(),
            "Diagnostic dump requested"
        );
        if let Some(diagnostic) = &self.inner.diagnostic {
            diagnostic();
        }
    }

    /// Apply the worker's reaction to an OS signal
    pub fn handle_signal(&self, signal: ControlSignal) {
        debug!("Handling {}", signal);
        match signal {
            ControlSignal::Term | ControlSignal::Int => self.shutdown(false),
            ControlSignal::Quit => self.shutdown(true),
            ControlSignal::Usr2 => self.pause(),
            ControlSignal::Cont => self.resume(),
            ControlSignal::Hup => self.dump_diagnostics(),
            ControlSignal::Usr1 => debug!("Ignoring {} in worker", signal),
        }
    }

    pub fn procline(&self) -> &Procline {
        &self.inner.procline
    }

    pub(crate) fn halted(&self) -> &CancellationToken {
        &self.inner.halt
    }

    fn transition(&self, next: impl FnOnce(RunState) -> Option<RunState>) -> bool {
        self.inner.state.send_if_modified(|state| match next(*state) {
            Some(new_state) => {
                *state = new_state;
                true
            }
            None => false,
        })
    }
}

impl fmt::Debug for WorkerControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerControl")
            .field("state", &self.state())
            .finish()
    }
}
