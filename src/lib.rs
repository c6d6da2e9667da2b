//! Strand - a multicore thread and synchronization core
//!
//! The scheduling heart of a small embedded operating system: threads,
//! per-core ready queues under a selectable discipline, alarms driving
//! periodic activations, and the blocking primitives built on top. The
//! machine side (CPU, interrupt controller, timer, MMU) is consumed
//! through narrow interfaces and modeled in software so the whole core
//! runs and tests on a host.

#![no_std]
// Kernel-appropriate clippy configuration
#![allow(clippy::new_without_default)]
#![allow(clippy::result_unit_err)]
#![allow(clippy::len_without_is_empty)]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod types;

// Configuration and machine model
pub mod config;
pub mod cpu;
pub mod ic;

// Scheduling core
pub mod alarm;
pub mod counters;
pub mod criterion;
pub mod klock;
pub mod monitor;
pub mod periodic;
pub mod rq;
pub mod scheduler;
pub mod synchronizer;
pub mod task;
pub mod thread;

pub use alarm::{Alarm, AlarmHandler, INFINITE};
pub use criterion::{Criterion, Policy};
pub use periodic::{PeriodicConfiguration, PeriodicThread, RtConfiguration, RtThread};
pub use synchronizer::{Condition, Mutex, Semaphore};
pub use thread::{Configuration, State, Thread};
pub use types::KernError;

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "Strand";

/// Bring the core up: vectors wired, MAIN thread wrapped around `entry`,
/// one idle thread per core, scheduler timer armed.
pub fn init(
    entry: cpu::EntryFn,
    arg: usize,
) -> Result<alloc::sync::Arc<Thread>, KernError> {
    thread::init(entry, arg)
}
