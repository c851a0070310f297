//! Child process control
//!
//! [`ProcessControl`] is the seam between the supervisor's bookkeeping and the
//! operating system. [`ForkProcesses`] is the real implementation; tests drive
//! the supervisor with scripted fakes.

use drudge_worker::ControlSignal;
use std::fmt;
use std::io;

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited with a status code
    Code(i32),
    /// Killed by the given signal number
    Signaled(i32),
}

impl ExitStatus {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Code(code) => Some(*code),
            ExitStatus::Signaled(_) => None,
        }
    }

    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "status {}", code),
            ExitStatus::Signaled(signal) => write!(f, "signal {}", signal),
        }
    }
}

/// A reaped child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: i32,
    pub status: ExitStatus,
}

pub trait ProcessControl: Send + Sync {
    /// Start a child process that runs `entry` and exits with its return
    /// value. Returns the child's pid in the parent.
    fn spawn(&self, entry: &dyn Fn() -> i32) -> io::Result<i32>;

    /// Reap one exited child without blocking
    fn try_wait_any(&self) -> io::Result<Option<ChildExit>>;

    /// Deliver a signal to a child. A child that no longer exists is not an
    /// error.
    fn signal(&self, pid: i32, signal: ControlSignal) -> io::Result<()>;
}

/// Child processes created with `fork(2)`.
///
/// Forking is only sound while the parent runs no async runtime, so the
/// supervisor loop is synchronous and every child builds its own runtime.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkProcesses;

#[cfg(unix)]
impl ProcessControl for ForkProcesses {
    fn spawn(&self, entry: &dyn Fn() -> i32) -> io::Result<i32> {
        use nix::unistd::{fork, ForkResult};

        // SAFETY: the child runs `entry` and exits without returning here
        match unsafe { fork() }? {
            ForkResult::Parent { child } => Ok(child.as_raw()),
            ForkResult::Child => {
                let code = entry();
                std::process::exit(code)
            }
        }
    }

    fn try_wait_any(&self) -> io::Result<Option<ChildExit>> {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
        use nix::unistd::Pid;

        let exit = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::Exited(pid, code) => Some(ChildExit {
                pid: pid.as_raw(),
                status: ExitStatus::Code(code),
            }),
            WaitStatus::Signaled(pid, signal, _) => Some(ChildExit {
                pid: pid.as_raw(),
                status: ExitStatus::Signaled(signal as i32),
            }),
            _ => None,
        };
        Ok(exit)
    }

    fn signal(&self, pid: i32, signal: ControlSignal) -> io::Result<()> {
        match drudge_worker::signals::send(pid, signal) {
            Err(e) if e.raw_os_error() == Some(nix::libc::ESRCH) => Ok(()),
            other => other,
        }
    }
}
