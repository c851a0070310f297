//! Lock-loss notifications
//!
//! While a worker runs, one task per distinct engine client listens on the
//! worker's own channel. A `lock_lost` event naming the executing job revokes
//! it and runs the worker's lock-loss callback. Everything else is ignored.

use drudge_interfaces::{worker_channel, JobRef, LockLossNotification, QueueClient};
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::current::CurrentJob;
use crate::error::{WorkerError, WorkerResult};
use crate::state::WorkerControl;

/// Callback run when the executing job's lock is lost
pub type LockLostHandler = Arc<dyn Fn(&JobRef, &WorkerControl) + Send + Sync>;

/// Running subscriptions. Dropping the listener aborts them.
pub(crate) struct LockLossListener {
    tasks: Vec<JoinHandle<()>>,
}

impl LockLossListener {
    pub(crate) async fn start(
        clients: &[Arc<dyn QueueClient>],
        current: Arc<CurrentJob>,
        control: WorkerControl,
        on_lost: LockLostHandler,
    ) -> WorkerResult<Self> {
        let mut listener = Self { tasks: Vec::with_capacity(clients.len()) };

        for client in clients {
            let channel = worker_channel(client.worker_name());
            let mut messages = client
                .subscribe(&channel)
                .await
                .map_err(WorkerError::Subscribe)?;
            debug!("Listening for lock loss on {}", channel);

            let current = current.clone();
            let control = control.clone();
            let on_lost = on_lost.clone();
            let task = async move {
                while let Some(message) = messages.next().await {
                    handle_message(&message, &current, &control, &on_lost);
                }
                debug!("Notification channel {} closed", channel);
            };
            listener.tasks.push(tokio::spawn(task.in_current_span()));
        }

        Ok(listener)
    }

    /// Tear down every subscription and wait for the tasks to finish
    pub(crate) async fn stop(mut self) {
        for task in std::mem::take(&mut self.tasks) {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for LockLossListener {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Act on one raw notification. Returns whether the current job was revoked.
pub(crate) fn handle_message(
    raw: &str,
    current: &CurrentJob,
    control: &WorkerControl,
    on_lost: &LockLostHandler,
) -> bool {
    let Some(notification) = LockLossNotification::parse(raw) else {
        debug!("Ignoring malformed notification: {}", raw);
        return false;
    };
    let Some(jid) = notification.jid.as_deref() else {
        return false;
    };
    if !notification.is_lock_lost_for(jid) {
        debug!("Ignoring {} notification", notification.event);
        return false;
    }

    current.revoke_if_current(jid, |job| {
        warn!("Lost lock for job {}", job.description());
        on_lost(job, control);
    })
}
