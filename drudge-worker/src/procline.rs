//! Process title bookkeeping

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Human readable status line of the current process.
///
/// The latest line is always kept in memory. On Linux the kernel's task name
/// is also updated, which the OS truncates to 15 bytes.
#[derive(Debug, Clone, Default)]
pub struct Procline {
    current: Arc<Mutex<String>>,
}

impl Procline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status, stamped with the package version and current time
    pub fn set(&self, status: &str) {
        let line = format!(
            "drudge-{}: {} at {}",
            VERSION,
            status,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        apply_os_title(&line);
        debug!("{}", line);
        *self.current.lock() = line;
    }

    pub fn get(&self) -> String {
        self.current.lock().clone()
    }
}

#[cfg(target_os = "linux")]
fn apply_os_title(line: &str) {
    if let Ok(name) = std::ffi::CString::new(line) {
        if let Err(e) = nix::sys::prctl::set_name(&name) {
            debug!("Could not set process name: {}", e);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_os_title(_line: &str) {}
