//! Domain-specific configuration modules

pub mod logging;
pub mod supervisor;
pub mod worker;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct DrudgeConfig {
    /// Single worker process configuration
    #[serde(default)]
    pub worker: worker::WorkerConfig,

    /// Process pool configuration
    #[serde(default)]
    pub supervisor: supervisor::SupervisorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl DrudgeConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.worker.validate()?;
        self.supervisor.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = DrudgeConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
