//! Script gateway with transparent reload on cache misses

use drudge_interfaces::{content_hash, EngineError, ScriptStore};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ScriptError, ScriptResult};

/// Diagnostic embedded in an engine-side script error, after its file:line prefix
static RUNTIME_ERROR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)user_script:\d+:\s*(\w+.+$)").unwrap());

/// Full-line comments in script source
static COMMENT_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*--.*$\n?").unwrap());

/// Remove full-line comments from script source
pub fn strip_comment_lines(source: &str) -> String {
    COMMENT_LINES.replace_all(source, "").into_owned()
}

/// Invokes one named script on the engine by its content hash
pub struct ScriptGateway {
    name: String,
    store: Arc<dyn ScriptStore>,
    source: String,
    sha: RwLock<String>,
}

impl ScriptGateway {
    pub fn new(name: impl Into<String>, store: Arc<dyn ScriptStore>, source: impl Into<String>) -> Self {
        let source = source.into();
        let sha = content_hash(&source);

        Self {
            name: name.into(),
            store,
            source,
            sha: RwLock::new(sha),
        }
    }

    /// Gateway for a custom script that builds on a shared helper library.
    ///
    /// The library source is prepended so the plugin can call its routines.
    /// Full-line comments are stripped from the plugin source only. The
    /// combined source is built once here and reused for every load.
    pub fn with_plugin(
        name: impl Into<String>,
        store: Arc<dyn ScriptStore>,
        library_source: &str,
        plugin_source: &str,
    ) -> Self {
        let combined = [library_source, strip_comment_lines(plugin_source).as_str()].join("\n\n");
        Self::new(name, store, combined)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source submitted to the engine on load
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Currently active content-hash handle
    pub fn sha(&self) -> String {
        self.sha.read().clone()
    }

    /// Submit the source to the engine and adopt the returned handle.
    /// Safe to call repeatedly.
    pub async fn load(&self) -> ScriptResult<String> {
        let sha = self.store.script_load(&self.source).await?;

        let expected = content_hash(&self.source);
        if sha != expected {
            warn!(
                "Engine returned handle {} for script {}, expected {}",
                sha, self.name, expected
            );
        }

        debug!("Loaded script {} as {}", self.name, sha);
        *self.sha.write() = sha.clone();
        Ok(sha)
    }

    /// Invoke the script with the given arguments.
    ///
    /// If the engine no longer has the script cached, it is loaded again and
    /// the call retried exactly once. A second miss is returned as an error.
    pub async fn call<S: AsRef<str>>(&self, args: &[S]) -> ScriptResult<JsonValue> {
        let args: Vec<String> = args.iter().map(|arg| arg.as_ref().to_string()).collect();

        let result = match self.invoke(&args).await {
            Err(EngineError::NoScript) => {
                debug!("Script {} missing from engine cache, reloading", self.name);
                self.load().await?;
                self.invoke(&args).await
            }
            other => other,
        };

        result.map_err(translate_engine_error)
    }

    async fn invoke(&self, args: &[String]) -> Result<JsonValue, EngineError> {
        let sha = self.sha();
        self.store.eval_sha(&sha, args).await
    }
}

impl std::fmt::Debug for ScriptGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptGateway")
            .field("name", &self.name)
            .field("sha", &self.sha())
            .finish()
    }
}

fn translate_engine_error(err: EngineError) -> ScriptError {
    if let EngineError::Command(message) = &err {
        if let Some(captures) = RUNTIME_ERROR.captures(message) {
            return ScriptError::Runtime(captures[1].to_string());
        }
    }
    ScriptError::Engine(err)
}
