//! Kestrel - Kernel blocking and demand-paging core
//!
//! This crate provides the two primitives the rest of a kernel sleeps on:
//! wait queues (ordered thread blocking and wakeup, unifying fair and
//! deadline scheduling disciplines) and page sources (on-demand paging
//! against an asynchronous external page provider).

#![no_std]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Request bookkeeping compares lengths in bytes, not container emptiness
#![allow(clippy::len_without_is_empty)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// Core types
pub mod types;

// Subsystems
pub mod kern;
pub mod vm;

pub use kern::{
    Event, OwnedWaitQueue, Scheduler, SchedulerState, Thread, WaitQueue, WaitQueueCollection,
};
pub use types::{Deadline, SchedDuration, SchedTime, Status, ThreadId};
pub use vm::{PageProvider, PageRequest, PageSource, ProviderProperties, PAGE_SIZE};

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "Kestrel";

/// Initialize the kernel library
pub fn init() {
    kern::init();
    vm::init();
    log::info!("{} {} initialized", NAME, VERSION);
}
