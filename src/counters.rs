//! Kernel event counters
//!
//! Process-wide counters for the paths worth watching: context switches,
//! thread churn, reschedule IPIs, alarm fires, wakeups, deadline misses.
//! Relaxed atomics; a snapshot is taken for the shutdown report and by
//! tests.

use core::sync::atomic::{AtomicU64, Ordering};

/// An atomically updated event counter.
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

pub static CONTEXT_SWITCHES: Counter = Counter::new("context_switches");
pub static THREADS_CREATED: Counter = Counter::new("threads_created");
pub static THREADS_DESTROYED: Counter = Counter::new("threads_destroyed");
pub static RESCHED_IPIS: Counter = Counter::new("resched_ipis");
pub static ALARMS_FIRED: Counter = Counter::new("alarms_fired");
pub static TIMER_TICKS: Counter = Counter::new("timer_ticks");
pub static WAKEUPS: Counter = Counter::new("wakeups");
pub static DEADLINE_MISSES: Counter = Counter::new("deadline_misses");

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub context_switches: u64,
    pub threads_created: u64,
    pub threads_destroyed: u64,
    pub resched_ipis: u64,
    pub alarms_fired: u64,
    pub timer_ticks: u64,
    pub wakeups: u64,
    pub deadline_misses: u64,
}

pub fn snapshot() -> CounterSnapshot {
    CounterSnapshot {
        context_switches: CONTEXT_SWITCHES.get(),
        threads_created: THREADS_CREATED.get(),
        threads_destroyed: THREADS_DESTROYED.get(),
        resched_ipis: RESCHED_IPIS.get(),
        alarms_fired: ALARMS_FIRED.get(),
        timer_ticks: TIMER_TICKS.get(),
        wakeups: WAKEUPS.get(),
        deadline_misses: DEADLINE_MISSES.get(),
    }
}

#[cfg(test)]
pub(crate) fn reset_all() {
    CONTEXT_SWITCHES.reset();
    THREADS_CREATED.reset();
    THREADS_DESTROYED.reset();
    RESCHED_IPIS.reset();
    ALARMS_FIRED.reset();
    TIMER_TICKS.reset();
    WAKEUPS.reset();
    DEADLINE_MISSES.reset();
}
