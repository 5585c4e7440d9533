//! Common types used across Kestrel
//!
//! This module defines shared types to avoid circular dependencies.

use core::ops::{Add, AddAssign, Div, Sub};
use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert_eq;

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(pub u64);

impl ThreadId {
    pub const NULL: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    /// Create a new thread ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ThreadId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

// ============================================================================
// Status Codes
// ============================================================================

/// Kernel status codes delivered as block resume values and request
/// completion codes.
///
/// `TimedOut`, `Killed` and `Retry` are normal recoverable outcomes of a
/// block; the I/O family is the closed set of provider failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    /// Operation completed normally
    Ok = 0,
    /// Block deadline expired
    TimedOut = 1,
    /// Thread has a pending kill signal
    Killed = 2,
    /// Thread has a pending suspend signal; caller should retry the wait
    Retry = 3,
    /// Object is in the wrong state for the operation
    BadState = 4,
    /// Backing store has no data for the range
    NotFound = 5,
    /// Operation not supported by the provider
    NotSupported = 6,
    /// Generic I/O failure
    Io = 7,
    /// Data failed an integrity check
    IoDataIntegrity = 8,
    /// Backing store is out of space
    NoSpace = 9,
    /// Supplied buffer was too small
    BufferTooSmall = 10,
    /// Kernel-internal allocation failure
    NoMemory = 11,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::TimedOut => "TIMED_OUT",
            Status::Killed => "KILLED",
            Status::Retry => "RETRY",
            Status::BadState => "BAD_STATE",
            Status::NotFound => "NOT_FOUND",
            Status::NotSupported => "NOT_SUPPORTED",
            Status::Io => "IO",
            Status::IoDataIntegrity => "IO_DATA_INTEGRITY",
            Status::NoSpace => "NO_SPACE",
            Status::BufferTooSmall => "BUFFER_TOO_SMALL",
            Status::NoMemory => "NO_MEMORY",
        }
    }
}

// ============================================================================
// Scheduler Time
// ============================================================================

/// Absolute monotonic time in whole nanoseconds.
///
/// The fair/deadline sort key computation requires an integral
/// representation; `FRACTIONAL_BITS` records that precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SchedTime(pub i64);

impl SchedTime {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(i64::MAX);
    pub const FRACTIONAL_BITS: u32 = 0;

    pub const fn from_nanos(ns: i64) -> Self {
        Self(ns)
    }

    pub fn nanos(self) -> i64 {
        self.0
    }

    pub fn saturating_add(self, dur: SchedDuration) -> Self {
        Self(self.0.saturating_add(dur.0))
    }
}

impl Add<SchedDuration> for SchedTime {
    type Output = SchedTime;
    fn add(self, rhs: SchedDuration) -> SchedTime {
        SchedTime(self.0 + rhs.0)
    }
}

impl Sub<SchedTime> for SchedTime {
    type Output = SchedDuration;
    fn sub(self, rhs: SchedTime) -> SchedDuration {
        SchedDuration(self.0 - rhs.0)
    }
}

/// Span of monotonic time in whole nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SchedDuration(pub i64);

impl SchedDuration {
    pub const ZERO: Self = Self(0);
    pub const FRACTIONAL_BITS: u32 = 0;

    pub const fn from_nanos(ns: i64) -> Self {
        Self(ns)
    }

    pub const fn from_micros(us: i64) -> Self {
        Self(us * 1_000)
    }

    pub const fn from_millis(ms: i64) -> Self {
        Self(ms * 1_000_000)
    }

    pub fn nanos(self) -> i64 {
        self.0
    }
}

const_assert_eq!(SchedTime::FRACTIONAL_BITS, 0);
const_assert_eq!(SchedDuration::FRACTIONAL_BITS, 0);

impl Add for SchedDuration {
    type Output = SchedDuration;
    fn add(self, rhs: SchedDuration) -> SchedDuration {
        SchedDuration(self.0 + rhs.0)
    }
}

impl AddAssign for SchedDuration {
    fn add_assign(&mut self, rhs: SchedDuration) {
        self.0 += rhs.0;
    }
}

impl Div<u64> for SchedDuration {
    type Output = SchedDuration;
    fn div(self, rhs: u64) -> SchedDuration {
        SchedDuration(self.0 / rhs as i64)
    }
}

// ============================================================================
// Deadline
// ============================================================================

/// Absolute deadline for a block operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(SchedTime);

impl Deadline {
    pub const INFINITE: Self = Self(SchedTime::MAX);

    pub const fn at(when: SchedTime) -> Self {
        Self(when)
    }

    pub fn after(now: SchedTime, dur: SchedDuration) -> Self {
        Self(now.saturating_add(dur))
    }

    pub fn when(self) -> SchedTime {
        self.0
    }

    pub fn is_infinite(self) -> bool {
        self.0 == SchedTime::MAX
    }

    /// A deadline at or before `now` has already expired
    pub fn is_past(self, now: SchedTime) -> bool {
        !self.is_infinite() && self.0 <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_unique() {
        let a = ThreadId::new();
        let b = ThreadId::new();
        assert_ne!(a, b);
        assert!(!a.is_null());
        assert!(ThreadId::NULL.is_null());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(Status::Ok.name(), "OK");
        assert_eq!(Status::TimedOut.name(), "TIMED_OUT");
        assert!(Status::Ok.is_ok());
        assert!(!Status::Io.is_ok());
    }

    #[test]
    fn test_sched_time_arithmetic() {
        let t = SchedTime::from_nanos(1_000);
        let t2 = t + SchedDuration::from_nanos(500);
        assert_eq!(t2.nanos(), 1_500);
        assert_eq!((t2 - t).nanos(), 500);
        assert_eq!(SchedDuration::from_millis(2).nanos(), 2_000_000);
        assert_eq!((SchedDuration::from_millis(16) / 4).nanos(), 4_000_000);
    }

    #[test]
    fn test_deadline() {
        let now = SchedTime::from_nanos(100);
        assert!(!Deadline::INFINITE.is_past(SchedTime::MAX));
        assert!(Deadline::at(SchedTime::from_nanos(100)).is_past(now));
        assert!(Deadline::at(SchedTime::from_nanos(50)).is_past(now));
        assert!(!Deadline::at(SchedTime::from_nanos(101)).is_past(now));
        assert_eq!(
            Deadline::after(now, SchedDuration::from_nanos(10)).when().nanos(),
            110
        );
    }
}
