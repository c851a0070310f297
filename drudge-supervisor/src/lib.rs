//! # Drudge Supervisor
//!
//! Keeps a fixed-size pool of worker processes alive. Each child is forked
//! from the supervisor, re-establishes its engine connections and runs a
//! [`Worker`](drudge_worker::Worker) until told to stop. Children that exit
//! are reaped and replaced in the same slot; shutdown forwards the stop
//! signal and waits a bounded time for the pool to drain.

pub mod child;
pub mod error;
pub mod process;
pub mod slots;
pub mod supervisor;

pub use child::{run_child, LOCK_LOST_EXIT_CODE, STARTUP_FAILURE_EXIT_CODE};
pub use error::{SupervisorError, SupervisorResult};
#[cfg(unix)]
pub use process::ForkProcesses;
pub use process::{ChildExit, ExitStatus, ProcessControl};
pub use slots::{Slot, SlotTable};
pub use supervisor::{Supervisor, SupervisorHandle, SUPERVISOR_SIGNALS};
