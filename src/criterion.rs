//! Scheduling criteria
//!
//! A criterion is a comparable rank (lower = more urgent) with an affinity
//! to one of the scheduler's queues. Static disciplines keep their rank
//! for life; dynamic ones recompute it at every job release. Reserved
//! bands partition the rank space: interrupt service above everything,
//! then MAIN, the real-time band between the PERIODIC and APERIODIC
//! boundaries, the aperiodic ranks, and IDLE at the bottom.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::alarm;
use crate::config;
use crate::types::{us_to_ticks, CpuId, InterruptId, Microsecond, Tick};

/// Comparable scheduling rank; lower is more urgent.
pub type Rank = i64;

/// Interrupt-service base rank, biased by the interrupt id.
pub const ISR: Rank = -(1 << 20);
/// The main thread of the system.
pub const MAIN: Rank = -1;
/// Highest application rank.
pub const HIGH: Rank = 0;
/// Start of the real-time band (exclusive).
pub const PERIODIC: Rank = HIGH;
/// End of the real-time band (exclusive).
pub const APERIODIC: Rank = 1 << 40;
/// Default aperiodic rank.
pub const NORMAL: Rank = APERIODIC;
/// Background rank.
pub const LOW: Rank = 1 << 41;
/// The idle thread of each core; nothing ranks below it.
pub const IDLE: Rank = Rank::MAX;

/// Rank used while servicing interrupt `id`.
pub fn isr_rank(id: InterruptId) -> Rank {
    ISR + id as Rank
}

/// Whether a rank falls in the real-time band.
pub fn is_realtime(rank: Rank) -> bool {
    rank > PERIODIC && rank < APERIODIC
}

/// Home queue wildcard: let the discipline pick.
pub const ANY: u32 = u32::MAX;

/// Rotating assignment for partitioned disciplines when the caller does
/// not pin a queue.
static NEXT_QUEUE: AtomicU32 = AtomicU32::new(0);

// ============================================================================
// Policy
// ============================================================================

/// Scheduling discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Fixed priority, partitioned per core.
    Fp,
    /// Fixed priority with round-robin time slicing among equals.
    Rr,
    /// Rate monotonic: rank by period, partitioned.
    Rm,
    /// Earliest deadline first, partitioned per core.
    Edf,
    /// Global EDF: one queue feeds every core.
    Gedf,
    /// Partitioned EDF with caller-pinned cores.
    Pedf,
}

impl Policy {
    /// Whether wakeups and timer ticks may preempt the running thread.
    pub fn preemptive(self) -> bool {
        true
    }

    /// Whether the quantum expiry reschedules.
    pub fn timed(self) -> bool {
        matches!(self, Policy::Rr | Policy::Edf | Policy::Gedf | Policy::Pedf)
    }

    /// Whether ranks are recomputed at each job release.
    pub fn dynamic(self) -> bool {
        matches!(self, Policy::Edf | Policy::Gedf | Policy::Pedf)
    }

    /// Number of ready queues the scheduler runs under this discipline.
    pub fn queues(self) -> usize {
        match self {
            Policy::Gedf => 1,
            _ => config::CPUS,
        }
    }

    /// Whether queue index and core coincide.
    pub fn partitioned(self) -> bool {
        self.queues() == config::CPUS
    }

    fn assign_queue(self, cpu: u32) -> u32 {
        if !self.partitioned() {
            0
        } else if cpu == ANY {
            NEXT_QUEUE.fetch_add(1, Ordering::Relaxed) % config::CPUS as u32
        } else {
            debug_assert!((cpu as usize) < config::CPUS);
            cpu
        }
    }
}

// ============================================================================
// Criterion
// ============================================================================

/// A thread's scheduling criterion: its rank, home queue and, for
/// real-time disciplines, the timing parameters the rank derives from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Criterion {
    policy: Policy,
    rank: Rank,
    queue: u32,
    period: Tick,
    deadline: Tick,
    capacity: Tick,
}

impl Criterion {
    /// A fixed rank under the default policy, queue picked by the
    /// discipline.
    pub fn fixed(rank: Rank) -> Self {
        Self::fixed_under(config::DEFAULT_POLICY, rank, ANY)
    }

    /// A fixed rank on a specific core.
    pub fn fixed_on(rank: Rank, cpu: CpuId) -> Self {
        Self::fixed_under(config::DEFAULT_POLICY, rank, cpu)
    }

    /// A fixed rank under an explicit policy.
    pub fn fixed_under(policy: Policy, rank: Rank, cpu: u32) -> Self {
        Self {
            policy,
            rank,
            queue: policy.assign_queue(cpu),
            period: 0,
            deadline: 0,
            capacity: 0,
        }
    }

    /// Criterion of the boot thread.
    pub fn main_thread() -> Self {
        Self {
            policy: config::DEFAULT_POLICY,
            rank: MAIN,
            queue: 0,
            period: 0,
            deadline: 0,
            capacity: 0,
        }
    }

    /// Criterion of a core's idle thread.
    pub fn idle(cpu: CpuId) -> Self {
        let policy = config::DEFAULT_POLICY;
        Self {
            policy,
            rank: IDLE,
            queue: if policy.partitioned() { cpu } else { 0 },
            period: 0,
            deadline: 0,
            capacity: 0,
        }
    }

    /// Criterion of a periodic thread with deadline = period.
    pub fn periodic(policy: Policy, period: Microsecond) -> Self {
        Self::real_time(policy, period, period, 0, ANY)
    }

    /// Criterion of a real-time thread. Static disciplines rank inside the
    /// real-time band immediately; dynamic ones re-rank at each release.
    pub fn real_time(
        policy: Policy,
        deadline: Microsecond,
        period: Microsecond,
        capacity: Microsecond,
        cpu: u32,
    ) -> Self {
        let deadline_ticks = us_to_ticks(deadline).max(1);
        let period_ticks = us_to_ticks(period).max(1);
        let rank = match policy {
            // RM ranks by period: shorter period, more urgent.
            Policy::Rm => in_rt_band(PERIODIC + period_ticks as Rank),
            // EDF variants start from their relative deadline and are
            // re-ranked by update() at each release.
            Policy::Edf | Policy::Gedf | Policy::Pedf => {
                in_rt_band(PERIODIC + deadline_ticks as Rank)
            }
            // Fixed-priority disciplines treat the period as the rank.
            Policy::Fp | Policy::Rr => in_rt_band(PERIODIC + period_ticks as Rank),
        };
        Self {
            policy,
            rank,
            queue: policy.assign_queue(cpu),
            period: period_ticks,
            deadline: deadline_ticks,
            capacity: us_to_ticks(capacity),
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Home queue; authoritative for affinity. A thread migrates by
    /// changing its criterion and being re-inserted.
    pub fn queue(&self) -> u32 {
        self.queue
    }

    pub fn period(&self) -> Tick {
        self.period
    }

    pub fn deadline(&self) -> Tick {
        self.deadline
    }

    pub fn capacity(&self) -> Tick {
        self.capacity
    }

    pub fn preemptive(&self) -> bool {
        self.policy.preemptive()
    }

    pub fn timed(&self) -> bool {
        self.policy.timed()
    }

    pub fn dynamic(&self) -> bool {
        self.policy.dynamic()
    }

    pub fn is_idle(&self) -> bool {
        self.rank == IDLE
    }

    pub fn is_realtime(&self) -> bool {
        is_realtime(self.rank)
    }

    /// Replace the rank, keeping the timing parameters.
    pub(crate) fn set_rank(&mut self, rank: Rank) {
        self.rank = rank;
    }

    /// Re-rank a dynamic criterion at a job release: absolute deadline in
    /// ticks, clamped inside the real-time band. Static criteria are
    /// unchanged.
    pub fn update(&mut self) {
        if self.dynamic() {
            let absolute = alarm::elapsed() + self.deadline;
            self.rank = in_rt_band(PERIODIC + absolute as Rank);
        }
    }
}

fn in_rt_band(rank: Rank) -> Rank {
    rank.clamp(PERIODIC + 1, APERIODIC - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_order() {
        assert!(isr_rank(5) < MAIN);
        assert!(MAIN < HIGH);
        assert!(HIGH < NORMAL);
        assert!(NORMAL < LOW);
        assert!(LOW < IDLE);
        assert!(is_realtime(PERIODIC + 1));
        assert!(!is_realtime(NORMAL));
        assert!(!is_realtime(MAIN));
    }

    #[test]
    fn test_rm_ranks_by_period() {
        let short = Criterion::real_time(Policy::Rm, 10_000, 10_000, 0, 0);
        let long = Criterion::real_time(Policy::Rm, 50_000, 50_000, 0, 0);
        assert!(short.rank() < long.rank());
        assert!(short.is_realtime());
        assert!(!short.dynamic());
    }

    #[test]
    fn test_edf_update_tracks_elapsed() {
        let mut c = Criterion::real_time(Policy::Edf, 20_000, 20_000, 0, 0);
        let before = c.rank();
        c.update();
        // The absolute deadline only moves forward as ticks elapse.
        assert!(c.rank() >= before);
        assert!(c.is_realtime());
        assert!(c.dynamic());
        assert!(c.timed());
    }

    #[test]
    fn test_gedf_is_single_queue() {
        assert_eq!(Policy::Gedf.queues(), 1);
        let c = Criterion::real_time(Policy::Gedf, 10_000, 10_000, 0, ANY);
        assert_eq!(c.queue(), 0);
        let pinned = Criterion::real_time(Policy::Pedf, 10_000, 10_000, 0, 2);
        assert_eq!(pinned.queue(), 2);
    }

    #[test]
    fn test_idle_criterion() {
        let c = Criterion::idle(3);
        assert!(c.is_idle());
        assert_eq!(c.queue(), 3);
        // Nothing outranks an ISR, nothing ranks below idle.
        assert!(isr_rank(0) < Criterion::main_thread().rank());
        assert!(Criterion::fixed(NORMAL).rank() < c.rank());
    }
}
