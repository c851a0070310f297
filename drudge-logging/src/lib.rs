//! Logging initialization for drudge processes
//!
//! Workers and the supervisor log through `tracing`. This crate installs the
//! global subscriber from a [`LoggingConfig`].

pub mod init;

pub use drudge_config::LoggingConfig;
pub use init::{build_filter, init_logging, init_simple_tracing};
