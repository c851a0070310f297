//! Worker process configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_nonzero_duration, Validatable};

/// Configuration of a single worker's reservation loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How long to sleep when paused or when no job is available. Zero means
    /// poll again immediately.
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,

    /// Whether the worker installs OS signal handlers when it runs
    #[serde(default = "default_true")]
    pub register_signal_handlers: bool,

    /// How often pending OS signals are turned into state transitions
    #[serde(with = "humantime_serde", default = "default_signal_poll_interval")]
    pub signal_poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            register_signal_handlers: true,
            signal_poll_interval: default_signal_poll_interval(),
        }
    }
}

impl Validatable for WorkerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_nonzero_duration(
            self.signal_poll_interval,
            "signal_poll_interval",
            self.domain_name(),
        )
    }

    fn domain_name(&self) -> &'static str {
        "worker"
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_signal_poll_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_true() -> bool {
    true
}
