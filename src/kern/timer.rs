//! Kernel Timers - Monotonic time and block timeouts
//!
//! Provides the monotonic tick source and the timeout queue backing
//! `WaitQueue` deadlines. Expiry races against the natural wake path: the
//! handler takes the owning queue's lock with `try_lock` and re-arms when
//! it loses, so whichever side wins performs the unblock exactly once.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::kern::lock::SpinLock;
use crate::kern::thread::Thread;
use crate::kern::wait_queue::{self, TimeoutOutcome};
use crate::types::{SchedDuration, SchedTime};

/// Identifier for an armed block timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerId {
    pub(crate) deadline: SchedTime,
    seq: u64,
}

static MONOTONIC_NANOS: AtomicI64 = AtomicI64::new(0);
static TIMER_SEQ: AtomicU64 = AtomicU64::new(1);

static TIMEOUTS: SpinLock<BTreeMap<TimerId, Arc<Thread>>> = SpinLock::new(BTreeMap::new());

/// Current monotonic time
pub fn monotonic_now() -> SchedTime {
    SchedTime::from_nanos(MONOTONIC_NANOS.load(Ordering::Acquire))
}

/// Advance the monotonic clock (timer interrupt / test driver)
pub fn advance(dur: SchedDuration) -> SchedTime {
    let now = MONOTONIC_NANOS.fetch_add(dur.nanos(), Ordering::AcqRel) + dur.nanos();
    SchedTime::from_nanos(now)
}

/// Arm a timeout that will force-wake `thread` with `TimedOut` at `deadline`.
///
/// Called with the thread's wait-queue lock held, after the thread has been
/// inserted; records the armed id in the thread's wait state so a stale
/// expiry can never fire across a later block.
pub(crate) fn arm_block_timeout(deadline: SchedTime, thread: &Arc<Thread>) -> TimerId {
    let id = TimerId {
        deadline,
        seq: TIMER_SEQ.fetch_add(1, Ordering::Relaxed),
    };
    thread.wait_state().armed_timeout = Some(id);
    TIMEOUTS.lock().insert(id, thread.clone());
    id
}

/// Disarm a block timeout; no-op if it already fired
pub(crate) fn cancel_block_timeout(id: TimerId, thread: &Arc<Thread>) {
    TIMEOUTS.lock().remove(&id);
    let mut ws = thread.wait_state();
    if ws.armed_timeout == Some(id) {
        ws.armed_timeout = None;
    }
}

/// Fire every timeout whose deadline is at or before `now`.
///
/// A handler that loses the lock race re-arms the entry and stops; the next
/// tick retries.
pub fn process_timeouts(now: SchedTime) {
    loop {
        let expired = {
            let mut queue = TIMEOUTS.lock();
            let next = queue.first_key_value().map(|(&id, _)| id);
            match next {
                Some(id) if id.deadline <= now => {
                    let thread = queue.remove(&id).expect("timeout entry vanished");
                    Some((id, thread))
                }
                _ => None,
            }
        };
        let Some((id, thread)) = expired else {
            break;
        };
        if wait_queue::timeout_thread(&thread, id) == TimeoutOutcome::Contended {
            TIMEOUTS.lock().insert(id, thread);
            break;
        }
    }
}

/// Timer interrupt body: advance the clock and fire expired timeouts
pub fn timer_tick(dur: SchedDuration) {
    let now = advance(dur);
    process_timeouts(now);
}

/// Number of armed block timeouts
pub fn pending_timeouts() -> usize {
    TIMEOUTS.lock().len()
}
