//! CPU primitives
//!
//! The narrow machine interface the core consumes: core identity,
//! interrupt masking, context initialization and switching, spin hints and
//! a monotonic time stamp. This module is a deterministic software model
//! of that interface — per-core flags live in atomics and the "current
//! core" is whatever the caller declares — so the whole core runs and
//! tests on a host. A port supplies hardware implementations behind the
//! same functions.

use core::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::config;
use crate::types::{CpuId, TimeStamp};

/// Thread entry point: receives its argument, returns an exit status.
pub type EntryFn = fn(usize) -> i32;

/// Exit trampoline invoked when an entry function returns.
pub type ExitFn = fn();

/// The core the calling code is executing on (model: declared, not read
/// from hardware).
static CURRENT: AtomicU32 = AtomicU32::new(0);

/// Per-core interrupt-enable flags.
static INT_ENABLED: [AtomicBool; config::CPUS] = [const { AtomicBool::new(true) }; config::CPUS];

/// Monotonic time-stamp counter, advanced by the timer tick (microsecond
/// resolution in the model).
static TSC: AtomicU64 = AtomicU64::new(0);

/// Identity of the executing core.
pub fn id() -> CpuId {
    CURRENT.load(Ordering::Relaxed)
}

/// Declare the executing core. On hardware this is read from the core
/// itself; the model uses it at boot and when servicing another core's
/// pending interrupts.
pub fn set_id(cpu: CpuId) {
    debug_assert!((cpu as usize) < config::CPUS);
    CURRENT.store(cpu, Ordering::Relaxed);
}

/// Number of cores in the machine.
pub fn cores() -> u32 {
    config::CPUS as u32
}

/// Disable interrupts on the executing core.
pub fn int_disable() {
    INT_ENABLED[id() as usize].store(false, Ordering::SeqCst);
}

/// Enable interrupts on the executing core.
pub fn int_enable() {
    INT_ENABLED[id() as usize].store(true, Ordering::SeqCst);
}

/// Whether interrupts are disabled on the executing core.
pub fn int_disabled() -> bool {
    !INT_ENABLED[id() as usize].load(Ordering::SeqCst)
}

/// Whether interrupts are disabled on a specific core.
pub fn int_disabled_on(cpu: CpuId) -> bool {
    !INT_ENABLED[cpu as usize].load(Ordering::SeqCst)
}

/// Pause until the next interrupt. The model has no wait state; callers
/// loop on a condition around this.
pub fn halt() {
    core::hint::spin_loop();
}

/// Busy-wait hint.
pub fn spin_hint() {
    core::hint::spin_loop();
}

/// Restart the machine. The model has nothing to restart; a port wires
/// the board's reset controller here.
pub fn reboot() {}

/// Full barrier across cores.
pub fn smp_barrier() {
    fence(Ordering::SeqCst);
}

/// Monotonic time stamp (model unit: microseconds).
pub fn time_stamp() -> TimeStamp {
    TSC.load(Ordering::SeqCst)
}

/// Time-stamp frequency in counts per second.
pub fn tsc_frequency() -> u64 {
    1_000_000
}

/// Advance the time-stamp counter; driven by the timer tick.
pub(crate) fn advance_time(us: u64) {
    TSC.fetch_add(us, Ordering::SeqCst);
}

// ============================================================================
// Machine Context
// ============================================================================

/// Saved machine context of a thread.
///
/// The model records what the first activation needs (entry, argument,
/// stack pointers, exit trampoline) instead of raw register state; a port
/// replaces the body of `init_stack`/`switch_context` with the real
/// frame layout and switch sequence.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    /// System stack pointer.
    pub sp: usize,
    /// User stack pointer (0 when the thread has none).
    pub usp: usize,
    /// First-activation entry point.
    pub entry: Option<EntryFn>,
    /// Entry argument.
    pub arg: usize,
    /// Invoked when `entry` returns.
    pub exit: Option<ExitFn>,
}

impl Context {
    pub const fn empty() -> Self {
        Self {
            sp: 0,
            usp: 0,
            entry: None,
            arg: 0,
            exit: None,
        }
    }
}

/// Build the initial context of a thread on its system stack so that the
/// first activation enters `entry(arg)` and falls into `exit` on return.
pub fn init_stack(
    usp: usize,
    stack_top: usize,
    exit: ExitFn,
    entry: EntryFn,
    arg: usize,
) -> Context {
    Context {
        sp: stack_top,
        usp,
        entry: Some(entry),
        arg,
        exit: Some(exit),
    }
}

/// Initialize a user-level stack; returns the number of bytes consumed
/// from the top. `exit` is absent for main threads, which return to the
/// loader instead of the exit trampoline.
pub fn init_user_stack(_usp: usize, exit: Option<ExitFn>, _arg: usize) -> usize {
    // Return address plus the argument slot.
    if exit.is_some() {
        2 * core::mem::size_of::<usize>()
    } else {
        core::mem::size_of::<usize>()
    }
}

/// Switch machine context from `prev` to `next`. In the model the switch
/// is a bookkeeping point: state was already transferred by the caller
/// and control returns immediately.
pub fn switch_context(_prev: &mut Context, _next: &Context) {
    fence(Ordering::SeqCst);
}
