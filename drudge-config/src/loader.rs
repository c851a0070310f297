//! Configuration loading and environment variable handling

use crate::domains::DrudgeConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "DRUDGE".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<DrudgeConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: DrudgeConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<DrudgeConfig> {
        let mut config = DrudgeConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<DrudgeConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut DrudgeConfig) -> ConfigResult<()> {
        self.apply_worker_overrides(&mut config.worker)?;
        self.apply_supervisor_overrides(&mut config.supervisor)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    fn apply_worker_overrides(
        &self,
        config: &mut crate::domains::worker::WorkerConfig,
    ) -> ConfigResult<()> {
        if let Some(interval) = self.get_duration("INTERVAL")? {
            config.interval = interval;
        }

        Ok(())
    }

    fn apply_supervisor_overrides(
        &self,
        config: &mut crate::domains::supervisor::SupervisorConfig,
    ) -> ConfigResult<()> {
        if let Ok(num_workers) = self.get_env_var("NUM_WORKERS") {
            config.num_workers = num_workers
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid NUM_WORKERS: {}", e)))?;
        }

        if let Some(interval) = self.get_duration("MAX_STARTUP_INTERVAL")? {
            config.max_startup_interval = interval;
        }

        if let Some(timeout) = self.get_duration("SHUTDOWN_TIMEOUT")? {
            config.shutdown_timeout = timeout;
        }

        Ok(())
    }

    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = crate::domains::logging::LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Read a human-readable duration ("5s", "250ms") from the environment
    fn get_duration(&self, name: &str) -> ConfigResult<Option<Duration>> {
        match self.get_env_var(name) {
            Ok(value) => humantime_serde::re::humantime::parse_duration(&value)
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e))),
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
