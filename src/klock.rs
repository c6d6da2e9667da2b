//! Scheduler lock
//!
//! A single lock serializes every ready-queue mutation and every thread
//! state transition. The discipline is fixed: interrupts are disabled on
//! the acquiring core before the lock is taken and re-enabled after it is
//! released. On uniprocessor configurations the lock collapses to the
//! interrupt mask alone.
//!
//! Dispatch releases the spin portion immediately before the context
//! switch so the next thread can re-enter the scheduler on its own terms;
//! interrupts come back on after the switch returns.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config;
use crate::cpu;
use crate::types::CpuId;

const NO_OWNER: u32 = u32::MAX;

/// Test-and-set spin lock that records the owning core.
pub struct Spin {
    taken: AtomicBool,
    owner: AtomicU32,
}

impl Spin {
    pub const fn new() -> Self {
        Self {
            taken: AtomicBool::new(false),
            owner: AtomicU32::new(NO_OWNER),
        }
    }

    /// Acquire, spinning until available.
    pub fn acquire(&self) {
        while self
            .taken
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.taken.load(Ordering::Relaxed) {
                cpu::spin_hint();
            }
        }
        self.owner.store(cpu::id(), Ordering::Relaxed);
    }

    /// Release; the caller must hold the lock.
    pub fn release(&self) {
        debug_assert!(self.owned_by(cpu::id()));
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.taken.store(false, Ordering::Release);
    }

    pub fn taken(&self) -> bool {
        self.taken.load(Ordering::Relaxed)
    }

    pub fn owned_by(&self, cpu: CpuId) -> bool {
        self.taken() && self.owner.load(Ordering::Relaxed) == cpu
    }
}

impl Default for Spin {
    fn default() -> Self {
        Self::new()
    }
}

static LOCK: Spin = Spin::new();

/// Disable interrupts on this core, then take the scheduler lock.
pub fn lock() {
    cpu::int_disable();
    if config::MULTICORE {
        LOCK.acquire();
    }
}

/// Release the scheduler lock, then re-enable interrupts.
pub fn unlock() {
    if config::MULTICORE {
        LOCK.release();
    }
    cpu::int_enable();
}

/// Whether the executing core holds the scheduler lock.
pub fn locked() -> bool {
    if config::MULTICORE {
        LOCK.owned_by(cpu::id())
    } else {
        cpu::int_disabled()
    }
}

/// Release the spin portion only. Dispatch uses this right before the
/// context switch; interrupts are re-enabled separately once the switch
/// returns.
pub(crate) fn release_spin() {
    if config::MULTICORE {
        LOCK.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_discipline() {
        let _g = crate::test_support::guard();
        cpu::set_id(0);

        assert!(!locked());
        lock();
        assert!(locked());
        assert!(cpu::int_disabled());
        unlock();
        assert!(!locked());
        assert!(!cpu::int_disabled());
    }

    #[test]
    fn test_owner_is_per_core() {
        let _g = crate::test_support::guard();
        cpu::set_id(0);

        lock();
        // Another core does not observe itself as the holder.
        cpu::set_id(1);
        assert!(!locked());
        cpu::set_id(0);
        assert!(locked());
        unlock();
    }

    #[test]
    fn test_spin_taken() {
        let _g = crate::test_support::guard();
        cpu::set_id(0);

        let s = Spin::new();
        assert!(!s.taken());
        s.acquire();
        assert!(s.taken());
        assert!(s.owned_by(0));
        s.release();
        assert!(!s.taken());
    }
}
