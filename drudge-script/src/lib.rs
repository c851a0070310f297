//! Engine-resident script invocation
//!
//! Atomic queue operations live on the engine as scripts addressed by the
//! SHA-1 of their source. [`ScriptGateway`] calls them by handle and recovers
//! from the engine having dropped the script from its cache.

pub mod error;
pub mod gateway;

pub use error::{ScriptError, ScriptResult};
pub use drudge_interfaces::content_hash;
pub use gateway::{strip_comment_lines, ScriptGateway};
