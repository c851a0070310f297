//! Script invocation errors

use drudge_interfaces::EngineError;
use thiserror::Error;

pub type ScriptResult<T> = Result<T, ScriptError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// The script raised an error; carries the script's own one-line diagnostic
    #[error("{0}")]
    Runtime(String),

    /// Any other engine error, passed through unchanged
    #[error(transparent)]
    Engine(#[from] EngineError),
}
