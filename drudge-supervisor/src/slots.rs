//! Pool slot bookkeeping

use std::collections::HashMap;
use std::path::PathBuf;

/// One position in the worker pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub worker_id: usize,
    /// Working directory reserved for the slot's process, if any
    pub sandbox: Option<PathBuf>,
}

impl Slot {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            sandbox: None,
        }
    }
}

/// Live slots keyed by child pid, plus slots whose child could not be spawned
/// and that are waiting for another attempt
#[derive(Debug, Default)]
pub struct SlotTable {
    live: HashMap<i32, Slot>,
    vacant: Vec<Slot>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pid: i32, slot: Slot) {
        self.live.insert(pid, slot);
    }

    pub fn remove(&mut self, pid: i32) -> Option<Slot> {
        self.live.remove(&pid)
    }

    pub fn get(&self, pid: i32) -> Option<&Slot> {
        self.live.get(&pid)
    }

    /// Park a slot until a child can be spawned for it
    pub fn vacate(&mut self, slot: Slot) {
        self.vacant.push(slot);
    }

    pub fn take_vacant(&mut self) -> Vec<Slot> {
        std::mem::take(&mut self.vacant)
    }

    pub fn vacant_len(&self) -> usize {
        self.vacant.len()
    }

    /// Live child pids in ascending order
    pub fn pids(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self.live.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Forget every slot, live or vacant
    pub fn clear(&mut self) {
        self.live.clear();
        self.vacant.clear();
    }
}
