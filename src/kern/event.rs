//! Events - Sticky signal rendezvous
//!
//! A one-shot signal built on [`WaitQueue`]: once signaled it stays
//! signaled (waiters return immediately with the stored status) until
//! explicitly reset. The signaled check is interposed between enqueue and
//! sleep, so a signal can never slip between a waiter's test and its block.

use crate::kern::thread::{Interruptible, ResourceOwnership, Signals};
use crate::kern::wait_queue::WaitQueue;
use crate::types::{Deadline, Status};

struct EventState {
    signaled: bool,
    status: Status,
}

/// Sticky signal with a stored completion status
pub struct Event {
    state: spin::Mutex<EventState>,
    queue: WaitQueue,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Self {
            state: spin::Mutex::new(EventState {
                signaled: false,
                status: Status::Ok,
            }),
            queue: WaitQueue::new(),
        }
    }

    /// Block until signaled; interruptible by kill/suspend
    pub fn wait(&self) -> Status {
        self.wait_deadline(Deadline::INFINITE)
    }

    /// Block until signaled or `deadline` expires
    pub fn wait_deadline(&self, deadline: Deadline) -> Status {
        {
            let s = self.state.lock();
            if s.signaled {
                return s.status;
            }
        }
        self.queue.block_etc_hooked(
            deadline,
            Signals::empty(),
            ResourceOwnership::Normal,
            Interruptible::Yes,
            || {
                let s = self.state.lock();
                s.signaled.then_some(s.status)
            },
        )
    }

    /// Signal the event, waking every waiter with `status`
    pub fn signal(&self, status: Status) -> usize {
        {
            let mut s = self.state.lock();
            s.signaled = true;
            s.status = status;
        }
        self.queue.wake_all(status)
    }

    /// Reset to unsignaled for reuse
    pub fn unsignal(&self) {
        let mut s = self.state.lock();
        s.signaled = false;
        s.status = Status::Ok;
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }
}
