//! Wait Queues - Thread blocking and wakeup
//!
//! The blocking rendezvous underneath every sleeping primitive in the
//! kernel. Blocked threads are held in an ordered collection whose key
//! unifies the two scheduling disciplines: deadline threads sort by
//! absolute deadline ahead of every fair thread, fair threads sort by
//! virtual time, and a separate minimum-relative-deadline index resolves
//! the case where every deadline has already lapsed.
//!
//! A thread is a member of at most one collection at a time, tracked by a
//! back-reference in its wait state; all membership changes happen under
//! the owning queue's spin lock.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt::Write as _;
use core::ops::Bound;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::kern::lock::{self, SpinLock};
use crate::kern::sched::{self, Discipline, DEFAULT_TARGET_LATENCY};
use crate::kern::thread::{Interruptible, ResourceOwnership, Thread, ThreadState};
use crate::kern::timer::{self, TimerId};
use crate::types::{Deadline, SchedDuration, SchedTime, Status, ThreadId};

// ============================================================================
// Sort Key
// ============================================================================

/// Ordering key for blocked threads.
///
/// Variant order is load-bearing: every `Deadline` key sorts ahead of every
/// `Fair` key, so a fair thread is only at the front of a collection that
/// holds no deadline threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SortKey {
    /// Absolute deadline of a deadline-discipline thread
    Deadline(SchedTime),
    /// Virtual finish time of a fair-discipline thread
    Fair(SchedTime),
}

fn sort_key_for(thread: &Thread) -> (SortKey, Option<SchedDuration>) {
    let ss = thread.sched_state();
    match ss.discipline {
        Discipline::Fair => (
            SortKey::Fair(ss.start_time + DEFAULT_TARGET_LATENCY / ss.weight),
            None,
        ),
        Discipline::Deadline => (
            SortKey::Deadline(ss.finish_time),
            Some(ss.relative_deadline()),
        ),
    }
}

// ============================================================================
// Wait Queue Collection
// ============================================================================

/// Ordered collection of blocked threads
#[derive(Default)]
pub struct WaitQueueCollection {
    tree: BTreeMap<(SortKey, ThreadId), Arc<Thread>>,
    /// Deadline threads re-indexed by relative deadline, for the
    /// all-deadlines-expired fallback
    rel_deadlines: BTreeMap<(SchedDuration, ThreadId), Arc<Thread>>,
}

impl WaitQueueCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a thread, computing and caching its sort key
    pub fn insert(&mut self, thread: &Arc<Thread>) {
        let (key, rel) = sort_key_for(thread);
        {
            let mut ws = thread.wait_state();
            debug_assert!(
                ws.sort_key.is_none(),
                "double insert of thread {:?} into wait collection",
                thread.id()
            );
            ws.sort_key = Some(key);
            ws.rel_deadline = rel;
        }
        self.tree.insert((key, thread.id()), thread.clone());
        if let Some(rd) = rel {
            self.rel_deadlines.insert((rd, thread.id()), thread.clone());
        }
    }

    /// Remove a thread, clearing its cached key
    pub fn remove(&mut self, thread: &Arc<Thread>) -> bool {
        let (key, rel) = {
            let mut ws = thread.wait_state();
            (ws.sort_key.take(), ws.rel_deadline.take())
        };
        let Some(key) = key else {
            return false;
        };
        let removed = self.tree.remove(&(key, thread.id())).is_some();
        if let Some(rd) = rel {
            self.rel_deadlines.remove(&(rd, thread.id()));
        }
        removed
    }

    /// Select the best thread to wake at time `now`.
    ///
    /// Deadline threads with unexpired deadlines win in deadline order;
    /// when every deadline has lapsed the globally minimal relative
    /// deadline wins; fair threads are chosen only when no deadline thread
    /// is present. Never returns `None` on a non-empty collection.
    pub fn peek(&self, now: SchedTime) -> Option<Arc<Thread>> {
        let ((front_key, _), front) = self.tree.first_key_value()?;
        match *front_key {
            SortKey::Fair(_) => Some(front.clone()),
            SortKey::Deadline(d) if d > now => Some(front.clone()),
            SortKey::Deadline(_) => {
                let probe = (SortKey::Deadline(now), ThreadId::MAX);
                if let Some(((key, _), thread)) = self
                    .tree
                    .range((Bound::Excluded(probe), Bound::Unbounded))
                    .next()
                {
                    if matches!(key, SortKey::Deadline(_)) {
                        return Some(thread.clone());
                    }
                }
                self.rel_deadlines.first_key_value().map(|(_, t)| t.clone())
            }
        }
    }

    pub fn count(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Thread>> {
        self.tree.values()
    }
}

// ============================================================================
// Wait Queue
// ============================================================================

/// Shared core of a wait queue; threads hold weak back-references to it
pub struct WaitQueueCore {
    id: u64,
    pub(crate) collection: SpinLock<WaitQueueCollection>,
}

impl WaitQueueCore {
    fn holds(&self, thread: &Thread) -> bool {
        thread
            .wait_state()
            .blocking_queue
            .as_ref()
            .is_some_and(|w| core::ptr::eq(Weak::as_ptr(w), self))
    }
}

/// Outcome of a timeout expiry attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// The timeout won the race and unblocked the thread
    Fired,
    /// The thread was already woken, moved, or re-blocked
    Lost,
    /// The owning queue's lock was contended; retry later
    Contended,
}

/// The blocking/waking rendezvous
pub struct WaitQueue {
    core: Arc<WaitQueueCore>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub fn new() -> Self {
        static QUEUE_IDS: AtomicU64 = AtomicU64::new(1);
        Self {
            core: Arc::new(WaitQueueCore {
                id: QUEUE_IDS.fetch_add(1, Ordering::Relaxed),
                collection: SpinLock::new(WaitQueueCollection::new()),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.core.collection.lock().is_empty()
    }

    pub fn count(&self) -> usize {
        self.core.collection.lock().count()
    }

    // === Blocking ===

    /// Block the calling thread on this queue.
    ///
    /// Contract: the caller holds no counting spin lock (the queue's own
    /// lock, taken here, must be the only one held while the thread goes to
    /// sleep). A deadline in the past returns `TimedOut` without blocking;
    /// if interruptible, a pending signal outside `signal_mask` resolves
    /// immediately without enqueuing. Otherwise the thread is inserted,
    /// a timeout is armed for finite deadlines, and the scheduler suspends
    /// it until a waker delivers a resume status.
    pub fn block_etc(
        &self,
        deadline: Deadline,
        signal_mask: crate::kern::thread::Signals,
        ownership: ResourceOwnership,
        interruptible: Interruptible,
    ) -> Status {
        self.block_etc_hooked(deadline, signal_mask, ownership, interruptible, || None)
    }

    /// `block_etc` with an `about_to_sleep` hook run under the queue lock
    /// after the thread is enqueued and before the CPU is surrendered.
    /// Returning `Some(status)` aborts the block and dequeues immediately.
    pub(crate) fn block_etc_hooked(
        &self,
        deadline: Deadline,
        signal_mask: crate::kern::thread::Signals,
        ownership: ResourceOwnership,
        interruptible: Interruptible,
        about_to_sleep: impl FnOnce() -> Option<Status>,
    ) -> Status {
        let current = sched::current_thread();
        let mut guard = self.core.collection.lock();
        debug_assert_eq!(
            lock::spinlocks_held(),
            1,
            "block with extra spinlocks held"
        );

        let now = timer::monotonic_now();
        if deadline.is_past(now) {
            return Status::TimedOut;
        }
        if interruptible == Interruptible::Yes {
            let pending = current.pending_signals().difference(signal_mask);
            if !pending.is_empty() {
                return pending.to_status();
            }
        }

        current.set_state(match ownership {
            ResourceOwnership::Normal => ThreadState::Blocked,
            ResourceOwnership::Reader => ThreadState::BlockedReadLock,
        });
        guard.insert(&current);
        {
            let mut ws = current.wait_state();
            ws.blocking_queue = Some(Arc::downgrade(&self.core));
            ws.blocked_status = Status::Ok;
            ws.interruptible = interruptible;
        }

        if let Some(status) = about_to_sleep() {
            guard.remove(&current);
            current.wait_state().blocking_queue = None;
            current.set_state(ThreadState::Running);
            return status;
        }

        let timer_id = if deadline.is_infinite() {
            None
        } else {
            Some(timer::arm_block_timeout(deadline.when(), &current))
        };
        drop(guard);

        sched::scheduler().block_current(&current);

        if let Some(id) = timer_id {
            timer::cancel_block_timeout(id, &current);
        }
        current.blocked_status()
    }

    // === Waking ===

    fn ready_for_wake(thread: &Arc<Thread>, status: Status) {
        {
            let mut ws = thread.wait_state();
            ws.blocking_queue = None;
            ws.blocked_status = status;
        }
        thread.set_state(ThreadState::Running);
    }

    /// Wake the best thread per [`WaitQueueCollection::peek`]
    pub fn wake_one(&self, status: Status) -> bool {
        self.wake_one_internal(status).is_some()
    }

    pub(crate) fn wake_one_internal(&self, status: Status) -> Option<Arc<Thread>> {
        let woken = {
            let mut guard = self.core.collection.lock();
            let now = timer::monotonic_now();
            match guard.peek(now) {
                Some(thread) => {
                    guard.remove(&thread);
                    Self::ready_for_wake(&thread, status);
                    Some(thread)
                }
                None => None,
            }
        };
        if let Some(thread) = &woken {
            sched::scheduler().unblock(thread.clone());
        }
        woken
    }

    pub(crate) fn collection(&self) -> &SpinLock<WaitQueueCollection> {
        &self.core.collection
    }

    /// Wake every thread, in repeated-peek order, as one scheduler batch
    pub fn wake_all(&self, status: Status) -> usize {
        let batch = {
            let mut guard = self.core.collection.lock();
            let now = timer::monotonic_now();
            let mut batch = Vec::with_capacity(guard.count());
            while let Some(thread) = guard.peek(now) {
                guard.remove(&thread);
                Self::ready_for_wake(&thread, status);
                batch.push(thread);
            }
            batch
        };
        let count = batch.len();
        if count > 0 {
            sched::scheduler().unblock_batch(batch);
        }
        count
    }

    /// Force-wake a specific thread out of whichever queue holds it
    pub fn unblock_thread(thread: &Arc<Thread>, status: Status) -> Result<(), Status> {
        let core = thread
            .wait_state()
            .blocking_queue
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(Status::BadState)?;
        let mut guard = core.collection.lock();
        if !core.holds(thread) || !thread.is_blocked() {
            return Err(Status::BadState);
        }
        guard.remove(thread);
        Self::ready_for_wake(thread, status);
        drop(guard);
        sched::scheduler().unblock(thread.clone());
        Ok(())
    }

    /// Remove a specific thread without waking it.
    ///
    /// The thread stays blocked with no owning queue; the caller must
    /// re-home it (see [`WaitQueue::move_thread`]) or wake it.
    pub fn dequeue_thread(&self, thread: &Arc<Thread>) -> bool {
        let mut guard = self.core.collection.lock();
        if !self.core.holds(thread) {
            return false;
        }
        guard.remove(thread);
        thread.wait_state().blocking_queue = None;
        drop(guard);
        true
    }

    /// Relocate a blocked thread from this queue to `dest` without a wake,
    /// preserving its blocked accounting (futex-requeue primitive)
    pub fn move_thread(&self, dest: &WaitQueue, thread: &Arc<Thread>) -> bool {
        if core::ptr::eq(
            Arc::as_ptr(&self.core),
            Arc::as_ptr(&dest.core),
        ) {
            return self.core.holds(thread);
        }
        let (first, second) = if self.core.id < dest.core.id {
            (&self.core, &dest.core)
        } else {
            (&dest.core, &self.core)
        };
        let mut g1 = first.collection.lock();
        let mut g2 = second.collection.lock();
        let (src, dst) = if Arc::as_ptr(first) == Arc::as_ptr(&self.core) {
            (&mut g1, &mut g2)
        } else {
            (&mut g2, &mut g1)
        };
        if !self.core.holds(thread) {
            return false;
        }
        src.remove(thread);
        dst.insert(thread);
        thread.wait_state().blocking_queue = Some(Arc::downgrade(&dest.core));
        true
    }

    /// Re-splice a blocked thread after its effective priority changed.
    ///
    /// The sort key is derived from scheduler state that priority
    /// inheritance may have altered; remove and reinsert recomputes it.
    pub fn priority_changed(&self, thread: &Arc<Thread>, _old_priority: i32) -> bool {
        let mut guard = self.core.collection.lock();
        if !self.core.holds(thread) {
            return false;
        }
        guard.remove(thread);
        guard.insert(thread);
        true
    }

    /// Log the queue's waiters
    pub fn debug_dump(&self) {
        let guard = self.core.collection.lock();
        log::info!("wait queue {}: {} waiters", self.core.id, guard.count());
        for thread in guard.iter() {
            let mut line: heapless::String<128> = heapless::String::new();
            let (key, interruptible) = {
                let ws = thread.wait_state();
                (ws.sort_key, ws.interruptible)
            };
            let _ = write!(
                line,
                "  {:?} {} {:?} key={:?} {:?}",
                thread.id(),
                thread.name(),
                thread.state(),
                key,
                interruptible
            );
            log::info!("{}", line);
        }
    }
}

/// Timeout expiry handler, racing the natural wake path with `try_lock`;
/// see [`TimeoutOutcome`]
pub(crate) fn timeout_thread(thread: &Arc<Thread>, id: TimerId) -> TimeoutOutcome {
    let Some(core) = thread
        .wait_state()
        .blocking_queue
        .as_ref()
        .and_then(Weak::upgrade)
    else {
        return TimeoutOutcome::Lost;
    };
    let Some(mut guard) = core.collection.try_lock() else {
        return TimeoutOutcome::Contended;
    };
    if !core.holds(thread) || !thread.is_blocked() || thread.wait_state().armed_timeout != Some(id)
    {
        return TimeoutOutcome::Lost;
    }
    guard.remove(thread);
    {
        let mut ws = thread.wait_state();
        ws.blocking_queue = None;
        ws.blocked_status = Status::TimedOut;
        ws.armed_timeout = None;
    }
    thread.set_state(ThreadState::Running);
    drop(guard);
    sched::scheduler().unblock(thread.clone());
    TimeoutOutcome::Fired
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        let waiters = self.core.collection.lock().count();
        assert_eq!(
            waiters, 0,
            "wait queue {} destroyed with {} blocked threads",
            self.core.id, waiters
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::sched::test_support;
    use crate::kern::thread::Signals;

    fn fair(name: &str, weight: u64, start_ns: i64) -> Arc<Thread> {
        Thread::new_fair(name, weight, SchedTime::from_nanos(start_ns))
    }

    fn deadline(name: &str, start_ns: i64, finish_ns: i64) -> Arc<Thread> {
        Thread::new_deadline(
            name,
            SchedTime::from_nanos(start_ns),
            SchedTime::from_nanos(finish_ns),
        )
    }

    fn at(ns: i64) -> SchedTime {
        SchedTime::from_nanos(ns)
    }

    // === Collection ordering ===

    #[test]
    fn test_sort_key_order() {
        assert!(SortKey::Deadline(at(i64::MAX)) < SortKey::Fair(at(0)));
        assert!(SortKey::Deadline(at(1)) < SortKey::Deadline(at(2)));
        assert!(SortKey::Fair(at(1)) < SortKey::Fair(at(2)));
    }

    #[test]
    fn test_peek_empty() {
        let c = WaitQueueCollection::new();
        assert!(c.peek(at(0)).is_none());
        assert!(c.is_empty());
    }

    #[test]
    fn test_peek_deadline_beats_fair() {
        let mut c = WaitQueueCollection::new();
        let f = fair("fair", 1, 0);
        let d = deadline("deadline", 0, 10_000_000);
        c.insert(&f);
        c.insert(&d);
        // Unexpired deadline wins.
        assert_eq!(c.peek(at(0)).unwrap().id(), d.id());
        // Expired deadline still wins via the relative-deadline fallback.
        assert_eq!(c.peek(at(11_000_000)).unwrap().id(), d.id());
        c.remove(&d);
        assert_eq!(c.peek(at(11_000_000)).unwrap().id(), f.id());
        c.remove(&f);
    }

    #[test]
    fn test_peek_expired_prefers_min_relative_deadline() {
        let mut c = WaitQueueCollection::new();
        // Earlier absolute deadline but longer relative deadline.
        let a = deadline("a", 0, 100);
        // Later absolute deadline, shorter relative deadline.
        let b = deadline("b", 150, 200);
        c.insert(&a);
        c.insert(&b);
        // Both expired at t=300: b has the smaller relative deadline.
        assert_eq!(c.peek(at(300)).unwrap().id(), b.id());
        // At t=120 only a is expired; b is the soonest unexpired deadline.
        assert_eq!(c.peek(at(120)).unwrap().id(), b.id());
        // At t=50 a is the soonest unexpired deadline.
        assert_eq!(c.peek(at(50)).unwrap().id(), a.id());
        c.remove(&a);
        c.remove(&b);
    }

    #[test]
    #[should_panic(expected = "double insert")]
    fn test_double_insert_asserts() {
        let mut c = WaitQueueCollection::new();
        let t = fair("dup", 1, 0);
        c.insert(&t);
        c.insert(&t);
    }

    #[test]
    fn test_remove_clears_key_cache() {
        let mut c = WaitQueueCollection::new();
        let t = deadline("cache", 0, 50);
        c.insert(&t);
        assert!(t.wait_state().sort_key.is_some());
        assert!(c.remove(&t));
        assert!(t.wait_state().sort_key.is_none());
        assert!(t.wait_state().rel_deadline.is_none());
        assert!(!c.remove(&t));
    }

    // === Peek matches a reference linear scan ===

    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    fn reference_peek(threads: &[Arc<Thread>], now: SchedTime) -> Option<ThreadId> {
        let key_of = |t: &Arc<Thread>| sort_key_for(t).0;
        let deadlines: Vec<_> = threads
            .iter()
            .filter(|t| t.sched_state().discipline == Discipline::Deadline)
            .collect();
        if !deadlines.is_empty() {
            let unexpired = deadlines
                .iter()
                .filter(|t| t.sched_state().finish_time > now)
                .min_by_key(|t| (key_of(t), t.id()));
            if let Some(t) = unexpired {
                return Some(t.id());
            }
            return deadlines
                .iter()
                .min_by_key(|t| (t.sched_state().relative_deadline(), t.id()))
                .map(|t| t.id());
        }
        threads
            .iter()
            .min_by_key(|t| (key_of(t), t.id()))
            .map(|t| t.id())
    }

    #[test]
    fn test_peek_matches_reference_scan() {
        let mut rng = Lcg(0x4b1d_c0de);
        for round in 0..8 {
            let mut c = WaitQueueCollection::new();
            let mut threads = Vec::new();
            let n = 4 + (rng.next() % 24) as usize;
            for i in 0..n {
                let t = if round > 0 && rng.next() % 3 == 0 {
                    fair("p1-fair", 1 + rng.next() % 7, (rng.next() % 1000) as i64)
                } else {
                    let start = (rng.next() % 1000) as i64;
                    let rel = 1 + (rng.next() % 2000) as i64;
                    deadline("p1-deadline", start, start + rel)
                };
                let _ = i;
                c.insert(&t);
                threads.push(t);
            }
            let mut sample_times: Vec<i64> = threads
                .iter()
                .filter(|t| t.sched_state().discipline == Discipline::Deadline)
                .flat_map(|t| {
                    let f = t.sched_state().finish_time.nanos();
                    [f - 1, f, f + 1]
                })
                .collect();
            sample_times.extend([0, 1, 1500, 4000, 100_000]);
            for ns in sample_times {
                let now = at(ns);
                let got = c.peek(now).map(|t| t.id());
                let want = reference_peek(&threads, now);
                assert_eq!(got, want, "peek mismatch at t={ns} round={round}");
            }
            for t in &threads {
                c.remove(t);
            }
        }
    }

    // === Blocking and waking ===

    #[test]
    fn test_wake_one_delivers_status() {
        test_support::init();
        let q = Arc::new(WaitQueue::new());
        let q2 = q.clone();
        let handle = std::thread::spawn(move || {
            let me = test_support::adopt_new("wake-one-waiter");
            let st = q2.block_etc(
                Deadline::INFINITE,
                Signals::empty(),
                ResourceOwnership::Normal,
                Interruptible::No,
            );
            (me.id(), st)
        });
        while q.is_empty() {
            std::thread::yield_now();
        }
        assert!(q.wake_one(Status::NotFound));
        let (_, st) = handle.join().unwrap();
        assert_eq!(st, Status::NotFound);
        assert!(q.is_empty());
        assert!(!q.wake_one(Status::Ok));
    }

    #[test]
    fn test_wake_all_batch() {
        test_support::init();
        let q = Arc::new(WaitQueue::new());
        let mut handles = Vec::new();
        for i in 0..3 {
            let q2 = q.clone();
            handles.push(std::thread::spawn(move || {
                test_support::adopt_new("wake-all-waiter");
                let _ = i;
                q2.block_etc(
                    Deadline::INFINITE,
                    Signals::empty(),
                    ResourceOwnership::Normal,
                    Interruptible::No,
                )
            }));
        }
        while q.count() < 3 {
            std::thread::yield_now();
        }
        assert_eq!(q.wake_all(Status::Ok), 3);
        for h in handles {
            assert_eq!(h.join().unwrap(), Status::Ok);
        }
        assert_eq!(q.wake_all(Status::Ok), 0);
    }

    #[test]
    fn test_block_past_deadline_times_out() {
        test_support::init();
        test_support::adopt_new("past-deadline");
        let q = WaitQueue::new();
        let now = timer::monotonic_now();
        let st = q.block_etc(
            Deadline::at(now),
            Signals::empty(),
            ResourceOwnership::Normal,
            Interruptible::Yes,
        );
        assert_eq!(st, Status::TimedOut);
        assert!(q.is_empty());
    }

    #[test]
    fn test_pending_signal_short_circuits() {
        test_support::init();
        let me = test_support::adopt_new("signaled");
        me.send_signal(Signals::KILL);
        let q = WaitQueue::new();
        let st = q.block_etc(
            Deadline::INFINITE,
            Signals::empty(),
            ResourceOwnership::Normal,
            Interruptible::Yes,
        );
        // Never enqueued.
        assert_eq!(st, Status::Killed);
        assert!(q.is_empty());
        me.clear_signals(Signals::KILL);
    }

    #[test]
    fn test_masked_signal_does_not_interrupt() {
        test_support::init();
        let q = Arc::new(WaitQueue::new());
        let q2 = q.clone();
        let handle = std::thread::spawn(move || {
            let me = test_support::adopt_new("masked");
            me.send_signal(Signals::SUSPEND);
            // Masked: the pending suspend must not short-circuit the block.
            let st = q2.block_etc(
                Deadline::INFINITE,
                Signals::SUSPEND,
                ResourceOwnership::Normal,
                Interruptible::Yes,
            );
            me.clear_signals(Signals::SUSPEND);
            st
        });
        while q.is_empty() {
            std::thread::yield_now();
        }
        assert!(q.wake_one(Status::Ok));
        assert_eq!(handle.join().unwrap(), Status::Ok);
    }

    #[test]
    fn test_suspend_signal_maps_to_retry() {
        test_support::init();
        let me = test_support::adopt_new("suspended");
        me.send_signal(Signals::SUSPEND);
        let q = WaitQueue::new();
        let st = q.block_etc(
            Deadline::INFINITE,
            Signals::empty(),
            ResourceOwnership::Normal,
            Interruptible::Yes,
        );
        assert_eq!(st, Status::Retry);
        assert!(q.is_empty());
        me.clear_signals(Signals::SUSPEND);
    }

    #[test]
    fn test_uninterruptible_ignores_signals() {
        test_support::init();
        let me = test_support::adopt_new("unint");
        me.send_signal(Signals::KILL);
        let q = WaitQueue::new();
        let now = timer::monotonic_now();
        let st = q.block_etc(
            Deadline::at(now),
            Signals::empty(),
            ResourceOwnership::Normal,
            Interruptible::No,
        );
        assert_eq!(st, Status::TimedOut);
        me.clear_signals(Signals::KILL);
    }

    #[test]
    fn test_block_timeout_fires() {
        test_support::init();
        let q = Arc::new(WaitQueue::new());
        let deadline = timer::monotonic_now() + SchedDuration::from_millis(5);
        let q2 = q.clone();
        let handle = std::thread::spawn(move || {
            test_support::adopt_new("timeout-waiter");
            q2.block_etc(
                Deadline::at(deadline),
                Signals::empty(),
                ResourceOwnership::Normal,
                Interruptible::Yes,
            )
        });
        while q.is_empty() {
            std::thread::yield_now();
        }
        timer::advance(SchedDuration::from_millis(10));
        while !q.is_empty() {
            timer::process_timeouts(timer::monotonic_now());
            std::thread::yield_now();
        }
        assert_eq!(handle.join().unwrap(), Status::TimedOut);
    }

    #[test]
    fn test_unblock_thread_targets_specific_waiter() {
        test_support::init();
        let q = Arc::new(WaitQueue::new());
        let q2 = q.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let me = test_support::adopt_new("unblock-target");
            tx.send(me.clone()).unwrap();
            q2.block_etc(
                Deadline::INFINITE,
                Signals::empty(),
                ResourceOwnership::Normal,
                Interruptible::No,
            )
        });
        let target = rx.recv().unwrap();
        while q.is_empty() {
            std::thread::yield_now();
        }
        WaitQueue::unblock_thread(&target, Status::Retry).unwrap();
        assert_eq!(handle.join().unwrap(), Status::Retry);
        // Not blocked anymore: forced wake reports bad state.
        assert_eq!(
            WaitQueue::unblock_thread(&target, Status::Ok),
            Err(Status::BadState)
        );
    }

    #[test]
    fn test_unblock_never_blocked_is_bad_state() {
        let t = fair("never-blocked", 1, 0);
        assert_eq!(
            WaitQueue::unblock_thread(&t, Status::Ok),
            Err(Status::BadState)
        );
    }

    #[test]
    fn test_move_thread_requeues() {
        test_support::init();
        let q1 = Arc::new(WaitQueue::new());
        let q2 = Arc::new(WaitQueue::new());
        let q1c = q1.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let me = test_support::adopt_new("requeue");
            tx.send(me).unwrap();
            q1c.block_etc(
                Deadline::INFINITE,
                Signals::empty(),
                ResourceOwnership::Normal,
                Interruptible::No,
            )
        });
        let target = rx.recv().unwrap();
        while q1.is_empty() {
            std::thread::yield_now();
        }
        assert!(q1.move_thread(&q2, &target));
        assert!(q1.is_empty());
        assert_eq!(q2.count(), 1);
        assert!(target.is_blocked());
        // Move from the wrong queue is refused.
        assert!(!q1.move_thread(&q2, &target));
        assert!(q2.wake_one(Status::Ok));
        assert_eq!(handle.join().unwrap(), Status::Ok);
    }

    #[test]
    fn test_priority_changed_resplices() {
        let q = WaitQueue::new();
        let t = deadline("resplice", 0, 100);
        {
            let mut guard = q.core.collection.lock();
            t.set_state(ThreadState::Blocked);
            guard.insert(&t);
            t.wait_state().blocking_queue = Some(Arc::downgrade(&q.core));
        }
        let old_key = t.wait_state().sort_key;
        t.sched_state().finish_time = at(500);
        assert!(q.priority_changed(&t, 16));
        let new_key = t.wait_state().sort_key;
        assert_ne!(old_key, new_key);
        assert_eq!(new_key, Some(SortKey::Deadline(at(500))));
        assert!(q.dequeue_thread(&t));
        t.set_state(ThreadState::Running);
    }

    // === Fatal destroy ===

    #[test]
    #[should_panic(expected = "destroyed with")]
    fn test_destroy_nonempty_queue_panics() {
        let q = WaitQueue::new();
        let t = fair("leaked-waiter", 1, 0);
        {
            let mut guard = q.core.collection.lock();
            t.set_state(ThreadState::Blocked);
            guard.insert(&t);
        }
        drop(q);
    }

    // === Single-spinlock block invariant ===

    #[test]
    #[should_panic(expected = "extra spinlocks")]
    fn test_block_with_extra_spinlock_asserts() {
        test_support::init();
        test_support::adopt_new("extra-lock");
        let other = SpinLock::new(());
        let q = WaitQueue::new();
        let _held = other.lock();
        let _ = q.block_etc(
            Deadline::INFINITE,
            Signals::empty(),
            ResourceOwnership::Normal,
            Interruptible::No,
        );
    }

    // === Mixed-discipline wake scenario ===

    #[test]
    fn test_fair_and_deadline_wake_order() {
        let mut c = WaitQueueCollection::new();
        let f = fair("mixed-fair", 1, 0);
        let d = deadline("mixed-deadline", 0, 10_000_000);
        c.insert(&f);
        c.insert(&d);
        assert_eq!(c.peek(at(0)).unwrap().id(), d.id());
        assert_eq!(c.peek(at(11_000_000)).unwrap().id(), d.id());
        c.remove(&d);
        assert_eq!(c.peek(at(11_000_000)).unwrap().id(), f.id());
        c.remove(&f);
        assert!(c.is_empty());
    }
}
