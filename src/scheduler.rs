//! Scheduler
//!
//! One rank-ordered ready chain per scheduling domain plus one chosen
//! slot per core. The chosen slot is held out of the ordered chain: the
//! running thread is not linked anywhere, it is what `chosen()` answers
//! for its core. Partitioned disciplines map core `i` to chain `i`;
//! global disciplines share chain 0 among every core. Suspended threads
//! park in a side set without losing their criterion.
//!
//! Callers serialize every operation with the scheduler lock; this type
//! is plain data.

use alloc::vec::Vec;

use crate::config;
use crate::criterion::{Policy, Rank};
use crate::rq::{Entry, OrderedQueue};
use crate::types::{CpuId, ThreadId};

pub struct Scheduler {
    policy: Policy,
    chains: Vec<OrderedQueue>,
    chosen: [Option<Entry>; config::CPUS],
    suspended: Vec<Entry>,
}

impl Scheduler {
    pub fn new(policy: Policy) -> Self {
        let mut chains = Vec::with_capacity(policy.queues());
        for _ in 0..policy.queues() {
            chains.push(OrderedQueue::new());
        }
        Self {
            policy,
            chains,
            chosen: [None; config::CPUS],
            suspended: Vec::new(),
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    fn chain_of_queue(&self, queue: u32) -> usize {
        (queue as usize).min(self.chains.len() - 1)
    }

    fn chain_of_cpu(&self, cpu: CpuId) -> usize {
        if self.policy.partitioned() {
            cpu as usize
        } else {
            0
        }
    }

    /// Place a thread in its home queue. An empty chosen slot served by
    /// that queue is filled directly, which is how the boot threads land.
    pub fn insert(&mut self, entry: Entry, queue: u32) {
        if self.policy.partitioned() {
            let cpu = self.chain_of_queue(queue);
            if self.chosen[cpu].is_none() {
                self.chosen[cpu] = Some(entry);
                return;
            }
        } else if let Some(slot) = self.chosen.iter().position(Option::is_none) {
            self.chosen[slot] = Some(entry);
            return;
        }
        let chain = self.chain_of_queue(queue);
        self.chains[chain].insert(entry);
    }

    /// Unlink a thread from wherever it is. Removing a chosen thread
    /// pulls the head of its chain into the slot.
    pub fn remove(&mut self, id: ThreadId) -> Option<Entry> {
        if let Some(entry) = self.take_active(id) {
            return Some(entry);
        }
        let pos = self.suspended.iter().position(|e| e.id == id)?;
        Some(self.suspended.remove(pos))
    }

    /// Move a thread from the active structures to the suspended set.
    pub fn suspend(&mut self, id: ThreadId) -> Option<Entry> {
        let entry = self.take_active(id)?;
        self.suspended.push(entry);
        Some(entry)
    }

    /// Unlink from the active structures only; used when a wait queue
    /// takes over the thread.
    pub fn block(&mut self, id: ThreadId) -> Option<Entry> {
        self.take_active(id)
    }

    /// Re-insert a thread, dropping it from the suspended set when it
    /// parked there.
    pub fn resume(&mut self, entry: Entry, queue: u32) {
        if let Some(pos) = self.suspended.iter().position(|e| e.id == entry.id) {
            self.suspended.remove(pos);
        }
        self.insert(entry, queue);
    }

    /// Pick the most urgent thread for `cpu`: the old chosen re-enters
    /// the chain and the head replaces it.
    pub fn choose(&mut self, cpu: CpuId) -> Option<Entry> {
        let chain = self.chain_of_cpu(cpu);
        if let Some(current) = self.chosen[cpu as usize].take() {
            self.chains[chain].insert(current);
        }
        self.chosen[cpu as usize] = self.chains[chain].pop_head();
        self.chosen[cpu as usize]
    }

    /// Pick the head of `cpu`'s chain, skipping the current chosen when
    /// anything else is ready.
    pub fn choose_another(&mut self, cpu: CpuId) -> Option<Entry> {
        let chain = self.chain_of_cpu(cpu);
        if self.chains[chain].head().is_some() {
            let old = self.chosen[cpu as usize].take();
            self.chosen[cpu as usize] = self.chains[chain].pop_head();
            if let Some(old) = old {
                self.chains[chain].insert(old);
            }
        }
        self.chosen[cpu as usize]
    }

    /// Promote a specific ready thread on `cpu`. Answers `None` when the
    /// thread is not schedulable there.
    pub fn choose_that(&mut self, cpu: CpuId, id: ThreadId) -> Option<Entry> {
        if let Some(current) = self.chosen[cpu as usize] {
            if current.id == id {
                return Some(current);
            }
        }
        let chain = self.chain_of_cpu(cpu);
        let entry = self.chains[chain].remove(id)?;
        if let Some(old) = self.chosen[cpu as usize].take() {
            self.chains[chain].insert(old);
        }
        self.chosen[cpu as usize] = Some(entry);
        Some(entry)
    }

    /// The running thread of `cpu`, without choosing.
    pub fn chosen(&self, cpu: CpuId) -> Option<Entry> {
        self.chosen[cpu as usize]
    }

    /// Ready threads across every chain, excluding the chosen ones.
    pub fn schedulables(&self) -> usize {
        self.chains.iter().map(OrderedQueue::len).sum()
    }

    /// Most urgent ready rank of a queue.
    pub fn head_rank(&self, queue: u32) -> Option<Rank> {
        let chain = self.chain_of_queue(queue);
        self.chains[chain].head().map(|e| e.rank)
    }

    /// The core a wakeup on `queue` should reschedule: the queue's core
    /// for partitioned disciplines, the core running the least urgent
    /// chosen thread for global ones.
    pub fn preemption_target(&self, queue: u32) -> CpuId {
        if self.policy.partitioned() {
            return self.chain_of_queue(queue) as CpuId;
        }
        let mut target = 0;
        let mut worst = Rank::MIN;
        for (cpu, slot) in self.chosen.iter().enumerate() {
            let rank = slot.map(|e| e.rank).unwrap_or(Rank::MAX);
            if rank > worst {
                worst = rank;
                target = cpu;
            }
        }
        target as CpuId
    }

    /// How many scheduler structures link this thread (ready chains and
    /// the suspended set; the chosen slot is not a link).
    pub fn linked_count(&self, id: ThreadId) -> usize {
        let chains = self
            .chains
            .iter()
            .filter(|chain| chain.contains(id))
            .count();
        let suspended = self.suspended.iter().filter(|e| e.id == id).count();
        chains + suspended
    }

    pub fn is_suspended(&self, id: ThreadId) -> bool {
        self.suspended.iter().any(|e| e.id == id)
    }

    /// Re-rank a chosen thread in place; the slot keeps its occupant.
    pub fn reweigh_chosen(&mut self, id: ThreadId, rank: Rank) -> bool {
        for slot in self.chosen.iter_mut().flatten() {
            if slot.id == id {
                slot.rank = rank;
                return true;
            }
        }
        false
    }

    fn take_active(&mut self, id: ThreadId) -> Option<Entry> {
        for cpu in 0..config::CPUS {
            if let Some(current) = self.chosen[cpu] {
                if current.id == id {
                    let chain = self.chain_of_cpu(cpu as CpuId);
                    self.chosen[cpu] = self.chains[chain].pop_head();
                    return Some(current);
                }
            }
        }
        for chain in self.chains.iter_mut() {
            if let Some(entry) = chain.remove(id) {
                return Some(entry);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criterion;

    fn e(id: u64, rank: Rank) -> Entry {
        Entry::new(ThreadId(id), rank)
    }

    #[test]
    fn test_first_insert_becomes_chosen() {
        let mut s = Scheduler::new(Policy::Fp);
        s.insert(e(10, criterion::MAIN), 0);
        assert_eq!(s.chosen(0).unwrap().id, ThreadId(10));
        assert_eq!(s.schedulables(), 0);

        s.insert(e(11, criterion::NORMAL), 0);
        assert_eq!(s.schedulables(), 1);
        assert_eq!(s.chosen(0).unwrap().id, ThreadId(10));
    }

    #[test]
    fn test_choose_picks_most_urgent() {
        let mut s = Scheduler::new(Policy::Fp);
        s.insert(e(1, criterion::IDLE), 0);
        s.insert(e(2, criterion::NORMAL), 0);
        s.insert(e(3, criterion::HIGH), 0);

        let next = s.choose(0).unwrap();
        assert_eq!(next.id, ThreadId(3));
        // The old chosen went back into the chain.
        assert_eq!(s.schedulables(), 2);
    }

    #[test]
    fn test_choose_another_skips_current() {
        let mut s = Scheduler::new(Policy::Fp);
        s.insert(e(1, criterion::NORMAL), 0);
        s.insert(e(2, criterion::NORMAL), 0);

        assert_eq!(s.chosen(0).unwrap().id, ThreadId(1));
        assert_eq!(s.choose_another(0).unwrap().id, ThreadId(2));
        // With nothing else ready the chosen stays put.
        let mut lone = Scheduler::new(Policy::Fp);
        lone.insert(e(7, criterion::NORMAL), 0);
        assert_eq!(lone.choose_another(0).unwrap().id, ThreadId(7));
    }

    #[test]
    fn test_choose_that_requires_schedulable() {
        let mut s = Scheduler::new(Policy::Fp);
        s.insert(e(1, criterion::NORMAL), 0);
        s.insert(e(2, criterion::LOW), 0);

        assert!(s.choose_that(0, ThreadId(9)).is_none());
        assert_eq!(s.choose_that(0, ThreadId(2)).unwrap().id, ThreadId(2));
        assert_eq!(s.chosen(0).unwrap().id, ThreadId(2));
        // Not a priority override: thread 1 is simply ready again.
        assert_eq!(s.head_rank(0), Some(criterion::NORMAL));
    }

    #[test]
    fn test_remove_chosen_refills_from_chain() {
        let mut s = Scheduler::new(Policy::Fp);
        s.insert(e(1, criterion::NORMAL), 0);
        s.insert(e(2, criterion::LOW), 0);

        let gone = s.remove(ThreadId(1)).unwrap();
        assert_eq!(gone.id, ThreadId(1));
        assert_eq!(s.chosen(0).unwrap().id, ThreadId(2));
        assert_eq!(s.schedulables(), 0);
    }

    #[test]
    fn test_suspend_resume_keeps_criterion() {
        let mut s = Scheduler::new(Policy::Fp);
        s.insert(e(1, criterion::NORMAL), 0);
        s.insert(e(2, criterion::HIGH), 0);

        let entry = s.suspend(ThreadId(2)).unwrap();
        assert!(s.is_suspended(ThreadId(2)));
        assert_eq!(s.linked_count(ThreadId(2)), 1);

        s.resume(entry, 0);
        assert!(!s.is_suspended(ThreadId(2)));
        assert_eq!(s.head_rank(0), Some(criterion::HIGH));
    }

    #[test]
    fn test_partitioned_queues_are_independent() {
        let mut s = Scheduler::new(Policy::Fp);
        s.insert(e(1, criterion::NORMAL), 0);
        s.insert(e(2, criterion::NORMAL), 1);
        s.insert(e(3, criterion::HIGH), 1);

        assert_eq!(s.chosen(0).unwrap().id, ThreadId(1));
        assert_eq!(s.chosen(1).unwrap().id, ThreadId(2));
        assert_eq!(s.preemption_target(1), 1);
        assert_eq!(s.choose(1).unwrap().id, ThreadId(3));
    }

    #[test]
    fn test_global_policy_shares_one_chain() {
        let mut s = Scheduler::new(Policy::Gedf);
        // First inserts land in the free chosen slots, one per core.
        for cpu in 0..config::CPUS as u64 {
            s.insert(e(cpu + 1, criterion::PERIODIC + 10), 0);
        }
        for cpu in 0..config::CPUS as u32 {
            assert!(s.chosen(cpu).is_some());
        }

        // The next insert queues; the preemption target is the core with
        // the least urgent chosen thread.
        s.insert(e(99, criterion::PERIODIC + 1), 0);
        assert_eq!(s.schedulables(), 1);
        let target = s.preemption_target(0);
        assert_eq!(s.choose(target).unwrap().id, ThreadId(99));
    }

    #[test]
    fn test_fifo_among_equals_end_to_end() {
        let mut s = Scheduler::new(Policy::Fp);
        s.insert(e(1, criterion::IDLE), 0); // occupies the slot
        s.insert(e(10, criterion::NORMAL), 0);
        s.insert(e(11, criterion::NORMAL), 0);

        assert_eq!(s.choose(0).unwrap().id, ThreadId(10));
        s.remove(ThreadId(10));
        assert_eq!(s.chosen(0).map(|e| e.id), Some(ThreadId(11)));
    }
}
