//! Scheduler Interface
//!
//! The run-queue scheduler is an external collaborator: this module defines
//! the narrow seam the blocking core consumes (suspend the current thread,
//! make one or many threads runnable again) plus the per-thread scheduling
//! state the wait-queue sort key is derived from. Selection policy lives
//! entirely on the other side of the trait.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Once;

use crate::kern::thread::Thread;
use crate::types::{SchedDuration, SchedTime};

/// Target latency used to derive a fair thread's virtual finish time
pub const DEFAULT_TARGET_LATENCY: SchedDuration = SchedDuration::from_millis(16);

// ============================================================================
// Scheduling State
// ============================================================================

/// Scheduling class of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Weighted fair scheduling, ordered by virtual time
    Fair,
    /// Deadline scheduling, ordered by absolute deadline
    Deadline,
}

/// Per-thread scheduler state consumed by the wait-queue ordering
#[derive(Debug, Clone)]
pub struct SchedulerState {
    pub discipline: Discipline,
    /// Start of the current activation period
    pub start_time: SchedTime,
    /// Virtual or absolute finish time, per discipline
    pub finish_time: SchedTime,
    /// Fair-discipline weight, >= 1
    pub weight: u64,
    pub base_priority: i32,
    /// Priority donated by a priority-inheritance chain, if any
    pub inherited_priority: Option<i32>,
}

impl SchedulerState {
    pub fn fair(weight: u64, start_time: SchedTime) -> Self {
        Self {
            discipline: Discipline::Fair,
            start_time,
            finish_time: start_time,
            weight: weight.max(1),
            base_priority: 16,
            inherited_priority: None,
        }
    }

    pub fn deadline(start_time: SchedTime, finish_time: SchedTime) -> Self {
        Self {
            discipline: Discipline::Deadline,
            start_time,
            finish_time,
            weight: 1,
            base_priority: 16,
            inherited_priority: None,
        }
    }

    /// Relative deadline of one activation period
    pub fn relative_deadline(&self) -> SchedDuration {
        self.finish_time - self.start_time
    }

    pub fn effective_priority(&self) -> i32 {
        match self.inherited_priority {
            Some(p) => p.max(self.base_priority),
            None => self.base_priority,
        }
    }
}

// ============================================================================
// Scheduler Seam
// ============================================================================

/// The blocking core's view of the scheduler.
///
/// `block_current` suspends the calling thread and returns only after a
/// matching `unblock` has made it runnable and it has been rescheduled.
/// An `unblock` that races ahead of `block_current` must not be lost.
pub trait Scheduler: Send + Sync {
    /// The thread executing on the current CPU
    fn current_thread(&self) -> Arc<Thread>;

    /// Suspend the calling thread until it is unblocked
    fn block_current(&self, thread: &Arc<Thread>);

    /// Make a thread runnable again
    fn unblock(&self, thread: Arc<Thread>);

    /// Make a batch of threads runnable again
    fn unblock_batch(&self, threads: Vec<Arc<Thread>>) {
        for thread in threads {
            self.unblock(thread);
        }
    }
}

static SCHEDULER: Once<Arc<dyn Scheduler>> = Once::new();

/// Install the scheduler implementation; first call wins
pub fn install(scheduler: Arc<dyn Scheduler>) {
    SCHEDULER.call_once(|| scheduler);
}

/// Get the installed scheduler
pub fn scheduler() -> &'static Arc<dyn Scheduler> {
    SCHEDULER.get().expect("Scheduler not installed")
}

/// The thread executing on the current CPU
pub fn current_thread() -> Arc<Thread> {
    scheduler().current_thread()
}

// ============================================================================
// Test Harness
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sched_state_fair() {
        let s = SchedulerState::fair(0, SchedTime::from_nanos(100));
        assert_eq!(s.weight, 1);
        assert_eq!(s.discipline, Discipline::Fair);
        assert_eq!(s.effective_priority(), 16);
    }

    #[test]
    fn test_sched_state_deadline() {
        let s = SchedulerState::deadline(
            SchedTime::from_nanos(100),
            SchedTime::from_nanos(400),
        );
        assert_eq!(s.relative_deadline().nanos(), 300);
    }

    #[test]
    fn test_inherited_priority() {
        let mut s = SchedulerState::fair(2, SchedTime::ZERO);
        s.inherited_priority = Some(25);
        assert_eq!(s.effective_priority(), 25);
        s.inherited_priority = Some(3);
        assert_eq!(s.effective_priority(), 16);
    }

    #[test]
    fn test_block_unblock_roundtrip() {
        let sched = test_support::init();
        let thread = test_support::adopt_new("sched-roundtrip");
        // Unblock first: the permit must not be lost when block follows.
        sched.unblock(thread.clone());
        sched.block_current(&thread);
    }
}
