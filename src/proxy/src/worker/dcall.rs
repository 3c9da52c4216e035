use crate::worker::pollable::WorkerId;
use crate::worker::Worker;

use hashbrown::{HashMap, HashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Identifies one delayed call. The worker id occupies the top 16 bits so
/// an id names its owning worker.
pub type DCId = u64;

/// Identity of an object owning delayed calls (a session, a monitor).
/// Owners cancel their calls during teardown; suspend/resume detaches and
/// reattaches all of an owner's calls at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Callable(u64);

static NEXT_CALLABLE_ID: AtomicU64 = AtomicU64::new(1);

impl Default for Callable {
    fn default() -> Self {
        Self::new()
    }
}

impl Callable {
    pub fn new() -> Self {
        Callable(NEXT_CALLABLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Why a delayed-call closure is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    Execute,
    Cancel,
}

pub(crate) type DCallFn = Box<dyn FnMut(CallAction, &mut Worker) -> bool>;

pub(crate) struct DCall {
    pub id: DCId,
    pub owner: Callable,
    pub at_ms: i64,
    pub interval_ms: i64,
    pub f: DCallFn,
}

/// The delayed-call table of one worker: id-indexed for cancellation,
/// time-ordered for dispatch, owner-indexed for suspension, plus a side
/// store for suspended calls the timer must not see.
#[derive(Default)]
pub(crate) struct DelayedCalls {
    by_id: HashMap<DCId, DCall>,
    // (due, seq): equal due-times fire in insertion order
    by_time: BTreeMap<(i64, u64), DCId>,
    seq_of: HashMap<DCId, u64>,
    by_owner: HashMap<Callable, HashSet<DCId>>,
    suspended: HashMap<Callable, Vec<DCall>>,
    suspended_owners: HashSet<Callable>,
    next_seq: u64,
    prev_id: u64,
}

impl DelayedCalls {
    pub fn new(worker_id: WorkerId) -> Self {
        DelayedCalls {
            // The 16 most significant bits of an id are the low bits of
            // the worker id.
            prev_id: (worker_id as u64 & 0xffff) << 48,
            ..Default::default()
        }
    }

    pub fn next_id(&mut self) -> DCId {
        self.prev_id += 1;
        self.prev_id
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn next_due_ms(&self) -> Option<i64> {
        self.by_time.keys().next().map(|(at, _)| *at)
    }

    pub fn owner_suspended(&self, owner: Callable) -> bool {
        self.suspended_owners.contains(&owner)
    }

    pub fn add(&mut self, call: DCall) -> DCId {
        let id = call.id;
        self.by_owner.entry(call.owner).or_default().insert(id);
        if self.suspended_owners.contains(&call.owner) {
            // attached once the owner resumes
            self.suspended.entry(call.owner).or_default().push(call);
        } else {
            self.attach(call);
        }
        id
    }

    fn attach(&mut self, call: DCall) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_time.insert((call.at_ms, seq), call.id);
        self.seq_of.insert(call.id, seq);
        self.by_id.insert(call.id, call);
    }

    fn detach(&mut self, id: DCId) -> Option<DCall> {
        let call = self.by_id.remove(&id)?;
        if let Some(seq) = self.seq_of.remove(&id) {
            self.by_time.remove(&(call.at_ms, seq));
        }
        Some(call)
    }

    /// Remove a call entirely. Returns it so the caller can decide whether
    /// to invoke the CANCEL action.
    pub fn remove(&mut self, id: DCId) -> Option<DCall> {
        if let Some(call) = self.detach(id) {
            if let Some(ids) = self.by_owner.get_mut(&call.owner) {
                ids.remove(&id);
            }
            return Some(call);
        }
        // May be parked in the suspended store.
        let owner = self.suspended.iter().find_map(|(owner, calls)| {
            calls.iter().any(|c| c.id == id).then_some(*owner)
        })?;
        let calls = self.suspended.get_mut(&owner)?;
        let pos = calls.iter().position(|c| c.id == id)?;
        let call = calls.remove(pos);
        if let Some(ids) = self.by_owner.get_mut(&owner) {
            ids.remove(&id);
        }
        Some(call)
    }

    pub fn owner_ids(&self, owner: Callable) -> Vec<DCId> {
        self.by_owner
            .get(&owner)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Detach all of an owner's calls from the timer without cancelling
    /// them.
    pub fn suspend_owner(&mut self, owner: Callable) {
        debug_assert!(!self.suspended_owners.contains(&owner));
        self.suspended_owners.insert(owner);
        for id in self.owner_ids(owner) {
            if let Some(call) = self.detach(id) {
                self.suspended.entry(owner).or_default().push(call);
            }
        }
    }

    pub fn resume_owner(&mut self, owner: Callable) {
        if !self.suspended_owners.remove(&owner) {
            warn!("Resuming delayed calls of an owner that was not suspended.");
            return;
        }
        for call in self.suspended.remove(&owner).unwrap_or_default() {
            self.attach(call);
        }
    }

    /// Pop the next call due at or before `now_ms`.
    pub fn pop_due(&mut self, now_ms: i64) -> Option<DCall> {
        let (&(at, seq), &id) = self.by_time.iter().next()?;
        if at > now_ms {
            return None;
        }
        self.by_time.remove(&(at, seq));
        self.seq_of.remove(&id);
        let call = self.by_id.remove(&id)?;
        if let Some(ids) = self.by_owner.get_mut(&call.owner) {
            ids.remove(&id);
        }
        Some(call)
    }

    /// Reinsert a repeating call at its next interval.
    pub fn rearm(&mut self, mut call: DCall, now_ms: i64) {
        call.at_ms = now_ms + call.interval_ms;
        self.by_owner.entry(call.owner).or_default().insert(call.id);
        if self.suspended_owners.contains(&call.owner) {
            self.suspended.entry(call.owner).or_default().push(call);
        } else {
            self.attach(call);
        }
    }

    /// Drain every call, for worker teardown.
    pub fn drain_all(&mut self) -> Vec<DCall> {
        let mut calls: Vec<DCall> = Vec::with_capacity(self.by_id.len());
        let ids: Vec<DCId> = self.by_id.keys().copied().collect();
        for id in ids {
            if let Some(call) = self.detach(id) {
                calls.push(call);
            }
        }
        for (_, mut parked) in self.suspended.drain() {
            calls.append(&mut parked);
        }
        self.by_owner.clear();
        self.suspended_owners.clear();
        calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: DCId, owner: Callable, at_ms: i64) -> DCall {
        DCall {
            id,
            owner,
            at_ms,
            interval_ms: 100,
            f: Box::new(|_, _| false),
        }
    }

    #[test]
    fn due_order_is_time_then_insertion() {
        let mut dcalls = DelayedCalls::new(1);
        let owner = Callable::new();
        let a = dcalls.next_id();
        let b = dcalls.next_id();
        let c = dcalls.next_id();
        dcalls.add(call(a, owner, 50));
        dcalls.add(call(b, owner, 10));
        dcalls.add(call(c, owner, 10));

        assert_eq!(dcalls.pop_due(100).unwrap().id, b);
        assert_eq!(dcalls.pop_due(100).unwrap().id, c);
        assert_eq!(dcalls.pop_due(100).unwrap().id, a);
        assert!(dcalls.pop_due(100).is_none());
    }

    #[test]
    fn not_due_stays_put() {
        let mut dcalls = DelayedCalls::new(1);
        let owner = Callable::new();
        let a = dcalls.next_id();
        dcalls.add(call(a, owner, 500));
        assert!(dcalls.pop_due(100).is_none());
        assert_eq!(dcalls.next_due_ms(), Some(500));
    }

    #[test]
    fn ids_carry_worker_bits() {
        let mut dcalls = DelayedCalls::new(3);
        let id = dcalls.next_id();
        assert_eq!(id >> 48, 3);
    }

    #[test]
    fn suspend_hides_from_timer_resume_restores() {
        let mut dcalls = DelayedCalls::new(1);
        let owner = Callable::new();
        let a = dcalls.next_id();
        dcalls.add(call(a, owner, 10));

        dcalls.suspend_owner(owner);
        assert!(dcalls.pop_due(100).is_none());
        assert!(dcalls.next_due_ms().is_none());

        dcalls.resume_owner(owner);
        assert_eq!(dcalls.pop_due(100).unwrap().id, a);
    }

    #[test]
    fn remove_finds_suspended_calls() {
        let mut dcalls = DelayedCalls::new(1);
        let owner = Callable::new();
        let a = dcalls.next_id();
        dcalls.add(call(a, owner, 10));
        dcalls.suspend_owner(owner);
        assert!(dcalls.remove(a).is_some());
        dcalls.resume_owner(owner);
        assert!(dcalls.pop_due(100).is_none());
    }
}
