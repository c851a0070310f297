use anyhow::Result;
use drudge_config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Build the event filter. A valid `RUST_LOG` overrides the configured
/// level; `warn` is used when neither parses.
pub fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Initialize logging from configuration
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(&config.level.to_string());

    let result = match config.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_current_span(true)
            .try_init(),
    };

    // Use try_init to avoid panic if global subscriber already set
    if result.is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    if tracing_subscriber::fmt()
        .with_env_filter(build_filter(log_level))
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}
