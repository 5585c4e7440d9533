//! Owned Wait Queues - Priority-inheriting variant
//!
//! A wait queue with an owner thread that inherits the priority of its
//! waiters. Distinct from [`WaitQueue`] at the type level: the plain wake
//! operations are not reachable here, because every wake on an owned queue
//! must also rewrite ownership and re-propagate inherited priority.

use alloc::sync::Arc;

use crate::kern::thread::{Interruptible, ResourceOwnership, Signals, Thread};
use crate::kern::wait_queue::WaitQueue;
use crate::types::{Deadline, Status};

/// Wait queue whose waiters donate priority to an owning thread
pub struct OwnedWaitQueue {
    queue: WaitQueue,
    owner: spin::Mutex<Option<Arc<Thread>>>,
}

impl Default for OwnedWaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnedWaitQueue {
    pub fn new() -> Self {
        Self {
            queue: WaitQueue::new(),
            owner: spin::Mutex::new(None),
        }
    }

    pub fn owner(&self) -> Option<Arc<Thread>> {
        self.owner.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn count(&self) -> usize {
        self.queue.count()
    }

    /// Set the owner and recompute its inherited priority; the previous
    /// owner's donation is revoked
    pub fn assign_owner(&self, owner: Option<Arc<Thread>>) {
        let previous = {
            let mut slot = self.owner.lock();
            core::mem::replace(&mut *slot, owner)
        };
        if let Some(previous) = previous {
            previous.sched_state().inherited_priority = None;
        }
        self.update_priority();
    }

    /// Block the calling thread, atomically naming `owner` as the thread
    /// being waited on. The donation happens between enqueue and sleep.
    pub fn block_and_assign_owner(
        &self,
        deadline: Deadline,
        owner: Option<Arc<Thread>>,
        signal_mask: Signals,
        interruptible: Interruptible,
    ) -> Status {
        self.queue.block_etc_hooked(
            deadline,
            signal_mask,
            ResourceOwnership::Normal,
            interruptible,
            || {
                let current = crate::kern::sched::current_thread();
                let donated = current.sched_state().effective_priority();
                let mut slot = self.owner.lock();
                *slot = owner;
                if let Some(owner) = slot.as_ref() {
                    let mut ss = owner.sched_state();
                    if ss.inherited_priority.is_none_or(|p| p < donated) {
                        ss.inherited_priority = Some(donated);
                    }
                }
                None
            },
        )
    }

    /// Wake the best waiter, transferring ownership to it. The outgoing
    /// owner's donation is revoked either way.
    pub fn wake_and_transfer_owner(&self, status: Status) -> bool {
        let woken = self.queue.wake_one_internal(status);
        match woken {
            Some(thread) => {
                self.assign_owner(Some(thread));
                true
            }
            None => {
                self.assign_owner(None);
                false
            }
        }
    }

    /// Recompute the owner's inherited priority from the remaining waiters
    pub fn update_priority(&self) {
        let waiter_max = {
            let guard = self.queue.collection().lock();
            guard
                .iter()
                .map(|t| t.sched_state().effective_priority())
                .max()
        };
        let owner = self.owner.lock().clone();
        if let Some(owner) = owner {
            owner.sched_state().inherited_priority = waiter_max;
            log::trace!(
                "owned wait queue: owner {:?} inherits {:?}",
                owner.id(),
                waiter_max
            );
        }
    }

    /// Re-splice a waiter whose effective priority changed and propagate
    /// the queue's new aggregate priority to the owner
    pub fn priority_changed(&self, thread: &Arc<Thread>, old_priority: i32) -> bool {
        let requeued = self.queue.priority_changed(thread, old_priority);
        if requeued {
            self.update_priority();
        }
        requeued
    }
}
