//! Domain-driven configuration for the drudge worker runtime
//!
//! Configuration is split by functional domain (worker, supervisor, logging),
//! each with defaults, validation and environment variable overrides.

pub mod domains;
pub mod error;
pub mod loader;
pub mod validation;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    supervisor::SupervisorConfig,
    worker::WorkerConfig,
    DrudgeConfig,
};
