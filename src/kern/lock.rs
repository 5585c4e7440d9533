//! Locking Primitives
//!
//! Spin locks for the queue, source and timer state, with held-lock
//! accounting so the blocking path can check its single-spinlock contract.
//! Small per-object interlocks use `spin::Mutex` directly and are not
//! counted.

use core::ops::{Deref, DerefMut};

// ============================================================================
// Held-Lock Accounting
// ============================================================================

#[cfg(not(test))]
mod held {
    use core::sync::atomic::{AtomicU32, Ordering};

    // One slot per CPU; single-slot until an embedder wires up per-CPU ids.
    static HELD: AtomicU32 = AtomicU32::new(0);

    pub fn inc() {
        HELD.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec() {
        HELD.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn count() -> u32 {
        HELD.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod held {
    use core::cell::Cell;

    std::thread_local! {
        static HELD: Cell<u32> = const { Cell::new(0) };
    }

    pub fn inc() {
        HELD.with(|h| h.set(h.get() + 1));
    }

    pub fn dec() {
        HELD.with(|h| h.set(h.get() - 1));
    }

    pub fn count() -> u32 {
        HELD.with(|h| h.get())
    }
}

/// Number of counting spin locks held by the current context
pub fn spinlocks_held() -> u32 {
    held::count()
}

// ============================================================================
// Spin Lock
// ============================================================================

/// A counting spin lock guarding shared kernel state.
///
/// Should only be held for short critical sections; the block path asserts
/// that exactly one of these is held while a thread goes to sleep.
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquire the lock, spinning until available
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let guard = self.inner.lock();
        held::inc();
        SpinLockGuard { guard }
    }

    /// Try to acquire the lock without spinning
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.inner.try_lock().map(|guard| {
            held::inc();
            SpinLockGuard { guard }
        })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Guard for a held [`SpinLock`]
pub struct SpinLockGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        held::dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_counts_held() {
        let lock = SpinLock::new(5u32);
        assert_eq!(spinlocks_held(), 0);
        {
            let mut g = lock.lock();
            *g += 1;
            assert_eq!(spinlocks_held(), 1);
        }
        assert_eq!(spinlocks_held(), 0);
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_try_lock() {
        let lock = SpinLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        let g2 = lock.try_lock();
        assert!(g2.is_some());
        assert_eq!(spinlocks_held(), 1);
        drop(g2);
        assert_eq!(spinlocks_held(), 0);
    }

    #[test]
    fn test_nested_locks() {
        let a = SpinLock::new(1u8);
        let b = SpinLock::new(2u8);
        let ga = a.lock();
        let gb = b.lock();
        assert_eq!(spinlocks_held(), 2);
        assert_eq!(*ga + *gb, 3);
        drop(gb);
        assert_eq!(spinlocks_held(), 1);
    }
}
