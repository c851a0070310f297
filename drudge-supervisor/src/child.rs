//! Entry point of a forked worker process

use drudge_interfaces::JobRef;
use drudge_worker::{signals, WorkerBuilder, WorkerControl};
use std::time::Duration;
use tracing::{error, info, warn};

/// Exit status of a child whose job lock was lost
pub const LOCK_LOST_EXIT_CODE: i32 = 11;

/// Exit status of a child that could not start working
pub const STARTUP_FAILURE_EXIT_CODE: i32 = 1;

const CHILD_RUNTIME_THREADS: usize = 2;

/// Run one worker inside a freshly forked child and return its exit status.
///
/// The child forgets signals meant for the parent, sleeps its startup
/// stagger, re-establishes every engine connection inherited across the
/// fork, runs the middlewares' `after_fork` hooks and then works until told
/// to stop. Losing a job's lock ends the child with [`LOCK_LOST_EXIT_CODE`].
pub fn run_child(builder: &WorkerBuilder, worker_id: usize, stagger: Duration) -> i32 {
    signals::reset();

    if !stagger.is_zero() {
        info!("Worker {} starting in {:?}", worker_id, stagger);
        std::thread::sleep(stagger);
    }

    // Two threads so the signal pump keeps running beside a payload that
    // blocks its thread
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(CHILD_RUNTIME_THREADS)
        .thread_name(format!("drudge-worker-{}", worker_id))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime for worker {}: {}", worker_id, e);
            return STARTUP_FAILURE_EXIT_CODE;
        }
    };

    let worker = builder
        .clone()
        .on_lock_lost(|job: &JobRef, control: &WorkerControl| {
            warn!("Lost lock for {}, exiting", job.description());
            control.terminate(LOCK_LOST_EXIT_CODE);
        })
        .build();

    let exit_code = runtime.block_on(async move {
        if let Err(e) = worker.reconnect_clients().await {
            error!("Worker {} could not reconnect: {}", worker_id, e);
            return STARTUP_FAILURE_EXIT_CODE;
        }
        if let Err(e) = worker.after_fork().await {
            error!("Worker {} failed after fork: {}", worker_id, e);
            return STARTUP_FAILURE_EXIT_CODE;
        }

        match worker.run().await {
            Ok(outcome) => outcome.exit_code(),
            Err(e) => {
                error!("Worker {} failed: {}", worker_id, e);
                STARTUP_FAILURE_EXIT_CODE
            }
        }
    });

    // An abandoned payload may still hold a runtime thread
    runtime.shutdown_background();
    exit_code
}
