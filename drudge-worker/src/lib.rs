//! # Drudge Worker
//!
//! A single-process job worker. It reserves one job at a time from a
//! pluggable [`Reserver`](drudge_interfaces::Reserver), runs it through a
//! middleware chain and reports completion or failure back to the engine.
//!
//! Lifecycle control is signal driven:
//!
//! | Signal     | Reaction                                   |
//! |------------|--------------------------------------------|
//! | TERM, INT  | stop immediately, abandoning the current job |
//! | QUIT       | finish the current job, then stop          |
//! | USR2       | pause reservation                          |
//! | CONT       | resume reservation                         |
//! | HUP        | diagnostic dump                            |
//!
//! While a job runs, the worker listens on its own notification channel and
//! abandons the job if the engine reports that its lock was lost.

pub mod current;
pub mod error;
pub mod failure;
pub mod listener;
pub mod middleware;
pub mod procline;
pub mod signals;
pub mod state;
pub mod worker;

pub use error::{WorkerError, WorkerResult};
pub use failure::{DefaultFailureFormatter, FailureFormatter};
pub use listener::LockLostHandler;
pub use middleware::{Chain, Middleware, Next, ReconnectMiddleware};
pub use procline::Procline;
pub use signals::ControlSignal;
pub use state::{DiagnosticHandler, RunOutcome, RunState, WorkerControl, IMMEDIATE_EXIT_CODE};
pub use worker::{Worker, WorkerBuilder, WORKER_SIGNALS};
