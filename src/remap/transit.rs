//! Per-server drain bookkeeping on a router
//!
//! Before a router acknowledges `Intermediate` for a server it must have
//! heard back from every parity revert it sent and seen every normal
//! request touching the server complete.

use std::collections::HashSet;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct PendingNormal {
    request_ids: HashSet<u32>,
    completed: bool,
}

#[derive(Debug, Default)]
pub struct StateTransitInfo {
    parity_revert: Mutex<u32>,
    pending_normal: Mutex<PendingNormal>,
}

impl StateTransitInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self) -> u32 {
        let mut counter = self.parity_revert.lock();
        *counter += 1;
        *counter
    }

    /// Returns the remaining count; never goes below zero
    pub fn decrement_counter(&self) -> u32 {
        let mut counter = self.parity_revert.lock();
        *counter = counter.saturating_sub(1);
        *counter
    }

    pub fn counter(&self) -> u32 {
        *self.parity_revert.lock()
    }

    pub fn add_pending_request(&self, parent_request_id: u32) {
        self.pending_normal.lock().request_ids.insert(parent_request_id);
    }

    /// Forget a completed request; `true` if it was tracked and was the last one
    pub fn remove_pending_request(&self, parent_request_id: u32) -> bool {
        let mut pending = self.pending_normal.lock();
        pending.request_ids.remove(&parent_request_id) && pending.request_ids.is_empty()
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending_normal.lock().request_ids.len()
    }

    /// Start a drain round; forgets requests of an earlier round
    pub fn unset_completed(&self) {
        let mut pending = self.pending_normal.lock();
        pending.request_ids.clear();
        pending.completed = false;
    }

    pub fn set_completed(&self) {
        self.pending_normal.lock().completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.pending_normal.lock().completed
    }

    /// Record the requests found by a scan in one step, marking the round
    /// complete when there are none
    pub fn gather<I: IntoIterator<Item = u32>>(&self, parent_request_ids: I) -> usize {
        let mut pending = self.pending_normal.lock();
        pending.request_ids.extend(parent_request_ids);
        if pending.request_ids.is_empty() {
            pending.completed = true;
        }
        pending.request_ids.len()
    }
}
