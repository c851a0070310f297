//! Worker notification channel messages

use serde::{Deserialize, Serialize};

/// Event name the engine publishes when it revokes a worker's lock on a job
pub const LOCK_LOST_EVENT: &str = "lock_lost";

/// Prefix of the per-worker notification channel
pub const WORKER_CHANNEL_PREFIX: &str = "ql:w:";

/// Name of the notification channel for a worker identity
pub fn worker_channel(worker_name: &str) -> String {
    format!("{}{}", WORKER_CHANNEL_PREFIX, worker_name)
}

/// Message published on a worker's notification channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLossNotification {
    pub event: String,
    #[serde(default)]
    pub jid: Option<String>,
}

impl LockLossNotification {
    pub fn lock_lost(jid: impl Into<String>) -> Self {
        Self {
            event: LOCK_LOST_EVENT.to_string(),
            jid: Some(jid.into()),
        }
    }

    /// Decode a raw channel message. Messages that are not JSON objects of
    /// the expected shape yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// Whether this notification revokes the lock on `jid`
    pub fn is_lock_lost_for(&self, jid: &str) -> bool {
        self.event == LOCK_LOST_EVENT && self.jid.as_deref() == Some(jid)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
