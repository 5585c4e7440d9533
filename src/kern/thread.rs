//! Thread Management
//!
//! Threads are opaque handles to this core: it only reads their scheduling
//! state, drives the blocked/running transitions, and keeps the wait
//! bookkeeping that ties a blocked thread to the one wait queue holding it.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::kern::sched::SchedulerState;
use crate::kern::timer::TimerId;
use crate::kern::wait_queue::{SortKey, WaitQueueCore};
use crate::types::{SchedDuration, SchedTime, Status, ThreadId};

// ============================================================================
// Thread State
// ============================================================================

/// Thread lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadState {
    /// Running or runnable
    Running = 0,
    /// Blocked in a wait queue
    Blocked = 1,
    /// Blocked in a wait queue while holding a read lock
    BlockedReadLock = 2,
    /// Suspended
    Suspended = 3,
    /// Terminated
    Dead = 4,
}

impl ThreadState {
    fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Blocked,
            2 => Self::BlockedReadLock,
            3 => Self::Suspended,
            _ => Self::Dead,
        }
    }

    pub fn is_blocked(self) -> bool {
        matches!(self, Self::Blocked | Self::BlockedReadLock)
    }
}

bitflags! {
    /// Pending asynchronous thread signals
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Signals: u32 {
        const KILL = 1 << 0;
        const SUSPEND = 1 << 1;
    }
}

impl Signals {
    /// Map the highest-precedence pending signal to a block status
    pub fn to_status(self) -> Status {
        if self.contains(Signals::KILL) {
            Status::Killed
        } else {
            Status::Retry
        }
    }
}

/// Whether a block may be interrupted by pending signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruptible {
    No,
    Yes,
}

/// Why the blocking thread holds the resource it is blocking under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOwnership {
    /// Normal block
    Normal,
    /// Blocked while a reader; matters to priority-inheritance bookkeeping
    Reader,
}

// ============================================================================
// Wait State
// ============================================================================

/// Per-thread wait bookkeeping, mutated only by the wait queue that holds
/// the thread and only under that queue's lock.
#[derive(Debug)]
pub struct WaitState {
    /// Back-reference to the owning queue while blocked
    pub(crate) blocking_queue: Option<Weak<WaitQueueCore>>,
    /// Sort key cached at insert; `None` outside the queue (double-insert
    /// and stale-read canary)
    pub(crate) sort_key: Option<SortKey>,
    /// Relative deadline cached at insert for deadline threads
    pub(crate) rel_deadline: Option<SchedDuration>,
    /// Resume status delivered by the waker
    pub(crate) blocked_status: Status,
    pub(crate) interruptible: Interruptible,
    /// Timeout armed for the current block, if any
    pub(crate) armed_timeout: Option<TimerId>,
}

impl Default for WaitState {
    fn default() -> Self {
        Self {
            blocking_queue: None,
            sort_key: None,
            rel_deadline: None,
            blocked_status: Status::Ok,
            interruptible: Interruptible::No,
            armed_timeout: None,
        }
    }
}

// ============================================================================
// Thread
// ============================================================================

/// A kernel thread handle
pub struct Thread {
    id: ThreadId,
    name: heapless::String<32>,
    state: AtomicU32,
    signals: AtomicU32,
    sched: spin::Mutex<SchedulerState>,
    wait: spin::Mutex<WaitState>,
}

impl Thread {
    pub fn new(name: &str, sched: SchedulerState) -> Arc<Self> {
        let mut thread_name = heapless::String::new();
        for c in name.chars() {
            if thread_name.push(c).is_err() {
                break;
            }
        }
        Arc::new(Self {
            id: ThreadId::new(),
            name: thread_name,
            state: AtomicU32::new(ThreadState::Running as u32),
            signals: AtomicU32::new(0),
            sched: spin::Mutex::new(sched),
            wait: spin::Mutex::new(WaitState::default()),
        })
    }

    /// Create a fair-discipline thread
    pub fn new_fair(name: &str, weight: u64, start_time: SchedTime) -> Arc<Self> {
        Self::new(name, SchedulerState::fair(weight, start_time))
    }

    /// Create a deadline-discipline thread
    pub fn new_deadline(name: &str, start_time: SchedTime, finish_time: SchedTime) -> Arc<Self> {
        Self::new(name, SchedulerState::deadline(start_time, finish_time))
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn is_blocked(&self) -> bool {
        self.state().is_blocked()
    }

    pub fn sched_state(&self) -> spin::MutexGuard<'_, SchedulerState> {
        self.sched.lock()
    }

    pub(crate) fn wait_state(&self) -> spin::MutexGuard<'_, WaitState> {
        self.wait.lock()
    }

    /// Resume status stored by the most recent wake
    pub fn blocked_status(&self) -> Status {
        self.wait.lock().blocked_status
    }

    // === Signals ===

    pub fn send_signal(&self, signal: Signals) {
        self.signals.fetch_or(signal.bits(), Ordering::AcqRel);
    }

    pub fn clear_signals(&self, signals: Signals) {
        self.signals.fetch_and(!signals.bits(), Ordering::AcqRel);
    }

    pub fn pending_signals(&self) -> Signals {
        Signals::from_bits_truncate(self.signals.load(Ordering::Acquire))
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
