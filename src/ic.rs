//! Interrupt controller interface
//!
//! Vector registration and inter-processor interrupts. The model keeps a
//! pending-interrupt mask per core; `service` delivers a core's pending
//! interrupts when that core has them enabled, which is how tests and the
//! host runtime stand in for hardware delivery.

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::config;
use crate::counters;
use crate::cpu;
use crate::types::{CpuId, InterruptId};

/// Reschedule request from another core.
pub const INT_RESCHEDULER: InterruptId = 1;

/// Scheduler timer tick.
pub const INT_SYS_TIMER: InterruptId = 2;

/// Number of interrupt vectors.
pub const VECTORS: usize = 64;

/// Interrupt handler: receives the vector that fired.
pub type Handler = fn(InterruptId);

static VECTOR_TABLE: Mutex<[Option<Handler>; VECTORS]> = Mutex::new([None; VECTORS]);

/// Per-core pending mask, one bit per vector.
static PENDING: [AtomicU64; config::CPUS] = [const { AtomicU64::new(0) }; config::CPUS];

/// Register `handler` for vector `id`.
pub fn int_vector(id: InterruptId, handler: Handler) {
    debug_assert!((id as usize) < VECTORS);
    VECTOR_TABLE.lock()[id as usize] = Some(handler);
}

/// Send an inter-processor interrupt to `cpu`.
pub fn ipi(cpu: CpuId, id: InterruptId) {
    debug_assert!((id as usize) < VECTORS);
    PENDING[cpu as usize].fetch_or(1 << id, Ordering::SeqCst);
    if id == INT_RESCHEDULER {
        counters::RESCHED_IPIS.inc();
    }
}

/// Whether `id` is pending on `cpu`.
pub fn pending(cpu: CpuId, id: InterruptId) -> bool {
    PENDING[cpu as usize].load(Ordering::SeqCst) & (1 << id) != 0
}

/// Deliver the pending interrupts of `cpu`, provided that core has
/// interrupts enabled. Returns the number of handlers invoked. Delivery
/// runs with the caller acting as `cpu`; the previous core identity is
/// restored afterwards.
pub fn service(cpu: CpuId) -> usize {
    if cpu::int_disabled_on(cpu) {
        return 0;
    }

    let mask = PENDING[cpu as usize].swap(0, Ordering::SeqCst);
    if mask == 0 {
        return 0;
    }

    let prev = cpu::id();
    cpu::set_id(cpu);

    let mut served = 0;
    for id in 0..VECTORS as u32 {
        if mask & (1 << id) != 0 {
            let handler = VECTOR_TABLE.lock()[id as usize];
            if let Some(h) = handler {
                h(id);
                served += 1;
            }
        }
    }

    cpu::set_id(prev);
    served
}

/// Drop every pending interrupt and vector registration.
#[cfg(test)]
pub(crate) fn reset() {
    for p in PENDING.iter() {
        p.store(0, Ordering::SeqCst);
    }
    *VECTOR_TABLE.lock() = [None; VECTORS];
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn count_handler(_id: InterruptId) {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_ipi_pends_until_serviced() {
        let _g = crate::test_support::guard();
        reset();
        FIRED.store(0, Ordering::SeqCst);

        int_vector(INT_RESCHEDULER, count_handler);
        ipi(1, INT_RESCHEDULER);
        assert!(pending(1, INT_RESCHEDULER));

        assert_eq!(service(1), 1);
        assert!(!pending(1, INT_RESCHEDULER));
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_masked_core_defers_delivery() {
        let _g = crate::test_support::guard();
        reset();
        FIRED.store(0, Ordering::SeqCst);

        int_vector(INT_RESCHEDULER, count_handler);
        cpu::set_id(2);
        cpu::int_disable();
        ipi(2, INT_RESCHEDULER);

        assert_eq!(service(2), 0);
        assert!(pending(2, INT_RESCHEDULER));

        cpu::int_enable();
        assert_eq!(service(2), 1);
        cpu::set_id(0);
    }
}
