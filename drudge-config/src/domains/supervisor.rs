//! Process supervisor configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_nonzero_duration, validate_positive, Validatable};

/// Configuration of the worker process pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Number of worker processes to keep alive
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Upper bound of the random delay before a freshly started child begins
    /// working. Zero disables staggering.
    #[serde(with = "humantime_serde", default = "default_max_startup_interval")]
    pub max_startup_interval: Duration,

    /// How long shutdown waits for children before giving up on them
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    /// Pause between non-blocking wait attempts
    #[serde(with = "humantime_serde", default = "default_reap_interval")]
    pub reap_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            max_startup_interval: default_max_startup_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            reap_interval: default_reap_interval(),
        }
    }
}

impl Validatable for SupervisorConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.num_workers, "num_workers", self.domain_name())?;
        validate_nonzero_duration(self.reap_interval, "reap_interval", self.domain_name())?;
        validate_nonzero_duration(self.shutdown_timeout, "shutdown_timeout", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "supervisor"
    }
}

fn default_num_workers() -> usize {
    1
}

fn default_max_startup_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_reap_interval() -> Duration {
    Duration::from_millis(10)
}
