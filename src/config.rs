//! Build-time configuration
//!
//! The recognized knobs of the core, resolved to constants. A port edits
//! this file (or generates it) instead of threading configuration objects
//! through every call site.

use crate::criterion::Policy;

/// Number of hardware cores. Partitioned policies run one ready queue per
/// core; global policies share a single queue across all of them.
pub const CPUS: usize = 4;

/// Enable the Thread class; with this off only the boot flow exists.
pub const MULTITHREAD: bool = true;

/// Enable SMP spinlocks and reschedule IPIs.
pub const MULTICORE: bool = CPUS > 1;

/// Enable Task / address-space isolation and user stacks.
pub const MULTITASK: bool = false;

/// Timer-driven preemption and priority preemption on resume/wakeup.
pub const PREEMPTIVE: bool = true;

/// Record statistics at dispatch and `wait_next`.
pub const MONITORED: bool = true;

/// On last-thread exit: reboot instead of halting.
pub const REBOOT: bool = false;

/// Scheduling discipline applied to threads created without an explicit
/// criterion.
pub const DEFAULT_POLICY: Policy = Policy::Fp;

/// Scheduler timer frequency in Hz (tick = 1/FREQUENCY).
pub const FREQUENCY: u64 = 1_000;

/// Time slice for round-robin among equals, in microseconds.
pub const QUANTUM: u64 = 10_000;

/// System stack size per thread, in bytes.
pub const STACK_SIZE: usize = 16 * 1024;

/// User stack segment size (multitask configurations).
pub const USER_STACK_SIZE: usize = 64 * 1024;

/// Capacity of each per-CPU monitor sample batch.
pub const MONITOR_BATCH: usize = 256;
