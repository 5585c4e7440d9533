//! Kern subsystem - Core blocking primitives
//!
//! Contains the spin locks, thread model, timers, and wait queues the rest
//! of the kernel blocks on.

pub mod event;
pub mod lock;
pub mod owned_wait_queue;
pub mod sched;
pub mod thread;
pub mod timer;
pub mod wait_queue;

pub use event::Event;
pub use lock::{spinlocks_held, SpinLock, SpinLockGuard};
pub use owned_wait_queue::OwnedWaitQueue;
pub use sched::{Discipline, Scheduler, SchedulerState, DEFAULT_TARGET_LATENCY};
pub use thread::{Interruptible, ResourceOwnership, Signals, Thread, ThreadState};
pub use timer::{monotonic_now, timer_tick};
pub use wait_queue::{SortKey, WaitQueue, WaitQueueCollection};

/// Initialize the kern subsystem
pub fn init() {
    log::debug!("kern: blocking primitives ready");
}
