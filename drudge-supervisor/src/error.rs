//! Error types for process supervision

use drudge_config::ConfigError;
use drudge_worker::ControlSignal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid supervisor configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn worker for slot {worker_id}: {source}")]
    Spawn {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for child processes: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Failed to send {signal} to child {pid}: {source}")]
    Signal {
        pid: i32,
        signal: ControlSignal,
        #[source]
        source: std::io::Error,
    },
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
