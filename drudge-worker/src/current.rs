//! Slot holding the job a worker is executing

use drudge_interfaces::JobRef;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

struct Held {
    job: JobRef,
    lost: CancellationToken,
}

/// The job currently executing, if any.
///
/// Set immediately before the hook chain runs and cleared right after. The
/// lock-loss listener reads it concurrently; the comparison with an incoming
/// notification and the resulting revocation happen under the same lock.
#[derive(Default)]
pub struct CurrentJob {
    slot: Mutex<Option<Held>>,
}

impl CurrentJob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `job` as executing, returning the token cancelled if its lock is lost
    pub fn set(&self, job: JobRef) -> CancellationToken {
        let lost = CancellationToken::new();
        *self.slot.lock() = Some(Held {
            job,
            lost: lost.clone(),
        });
        lost
    }

    pub fn clear(&self) {
        self.slot.lock().take();
    }

    pub fn get(&self) -> Option<JobRef> {
        self.slot.lock().as_ref().map(|held| held.job.clone())
    }

    pub fn jid(&self) -> Option<String> {
        self.slot.lock().as_ref().map(|held| held.job.jid().to_string())
    }

    /// Lock-loss token for `job` if it is the current job
    pub fn lost_token(&self, job: &JobRef) -> Option<CancellationToken> {
        self.slot
            .lock()
            .as_ref()
            .filter(|held| held.job.jid() == job.jid())
            .map(|held| held.lost.clone())
    }

    /// If the current job has identifier `jid`, cancel its lock-loss token and
    /// run `on_lost` while still holding the slot. Returns whether it matched.
    pub fn revoke_if_current(&self, jid: &str, on_lost: impl FnOnce(&JobRef)) -> bool {
        let slot = self.slot.lock();
        match slot.as_ref() {
            Some(held) if held.job.jid() == jid => {
                held.lost.cancel();
                on_lost(&held.job);
                true
            }
            _ => false,
        }
    }
}
