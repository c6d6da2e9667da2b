//! Synchronizers
//!
//! Mutex, semaphore and condition built over thread sleep/wakeup. Every
//! counter manipulation happens under the scheduler lock; the wait queues
//! are criterion-ordered so priority-aware primitives wake their most
//! urgent waiter, FIFO among equals.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::alarm::{Alarm, AlarmHandler};
use crate::config;
use crate::ic;
use crate::klock;
use crate::rq::WaitQueue;
use crate::thread;
use crate::types::{KernError, Microsecond, ThreadId};

// ============================================================================
// Semaphore
// ============================================================================

/// Counting semaphore. `p` sleeps once the counter goes negative; `v`
/// wakes the head while the counter is non-positive.
pub struct Semaphore {
    value: AtomicI64,
    queue: Arc<WaitQueue>,
}

impl Semaphore {
    pub fn new(value: i64) -> Arc<Semaphore> {
        Arc::new(Semaphore {
            value: AtomicI64::new(value),
            queue: WaitQueue::ranked(),
        })
    }

    /// A fair semaphore: waiters pass in arrival order regardless of
    /// rank.
    pub fn fair(value: i64) -> Arc<Semaphore> {
        Arc::new(Semaphore {
            value: AtomicI64::new(value),
            queue: WaitQueue::fifo(),
        })
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn waiters(&self) -> usize {
        self.queue.len()
    }

    pub fn p(&self) {
        klock::lock();
        let old = self.value.fetch_sub(1, Ordering::SeqCst);
        if old < 1 {
            thread::sleep(&self.queue);
        } else {
            klock::unlock();
        }
    }

    pub fn v(&self) {
        klock::lock();
        let old = self.value.fetch_add(1, Ordering::SeqCst);
        if old < 0 {
            thread::wakeup(&self.queue);
        } else {
            klock::unlock();
        }
    }

    /// `p` with a timeout. A timed-out waiter returns `Err(Timeout)` and
    /// the counter is restored as if no wakeup had occurred.
    pub fn p_timed(&self, timeout: Microsecond) -> Result<(), KernError> {
        klock::lock();
        let old = self.value.fetch_sub(1, Ordering::SeqCst);
        if old < 1 {
            let me = thread::running();
            me.set_timed_out(false);
            let alarm = Alarm::new(timeout, AlarmHandler::CancelWait(me.id()), 1);
            thread::sleep(&self.queue);

            if me.took_timeout() {
                self.value.fetch_add(1, Ordering::SeqCst);
                return Err(KernError::Timeout);
            }
            alarm.cancel();
        } else {
            klock::unlock();
        }
        Ok(())
    }
}

// ============================================================================
// Mutex
// ============================================================================

/// Sleeping mutual exclusion with priority-ordered handoff. The owner is
/// tracked for diagnostics only.
pub struct Mutex {
    locked: AtomicBool,
    owner: AtomicU64,
    queue: Arc<WaitQueue>,
}

impl Mutex {
    pub fn new() -> Arc<Mutex> {
        Arc::new(Mutex {
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(0),
            queue: WaitQueue::ranked(),
        })
    }

    pub fn held(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn owner(&self) -> ThreadId {
        ThreadId(self.owner.load(Ordering::SeqCst))
    }

    pub fn lock(&self) {
        klock::lock();
        if !self.locked.swap(true, Ordering::SeqCst) {
            self.owner.store(thread::this_thread::id(), Ordering::SeqCst);
            klock::unlock();
        } else {
            debug_assert!(
                self.owner.load(Ordering::SeqCst) != thread::this_thread::id(),
                "relock by the owner"
            );
            thread::sleep(&self.queue);
        }
    }

    /// Release; a waiting thread takes the lock over directly, so it
    /// never goes free while the queue is non-empty.
    pub fn unlock(&self) {
        klock::lock();
        if self.queue.is_empty() {
            self.owner.store(0, Ordering::SeqCst);
            self.locked.store(false, Ordering::SeqCst);
            klock::unlock();
        } else {
            let (next, target) =
                thread::wakeup_one_keep_lock(&self.queue).expect("non-empty queue");
            self.owner.store(next.0, Ordering::SeqCst);
            if config::PREEMPTIVE {
                thread::reschedule_on(target);
            } else {
                klock::unlock();
            }
        }
    }

    /// Hand the lock over (or free it) while the caller already holds
    /// the scheduler lock; remote beneficiaries get their IPI, the local
    /// queue is left for the caller's own dispatch.
    fn release_for_wait(&self) {
        debug_assert!(klock::locked());
        if self.queue.is_empty() {
            self.owner.store(0, Ordering::SeqCst);
            self.locked.store(false, Ordering::SeqCst);
        } else if let Some((next, target)) = thread::wakeup_one_keep_lock(&self.queue) {
            self.owner.store(next.0, Ordering::SeqCst);
            if config::MULTICORE && target != crate::cpu::id() {
                ic::ipi(target, ic::INT_RESCHEDULER);
            }
        }
    }
}

// ============================================================================
// Condition
// ============================================================================

/// Condition variable paired with a [`Mutex`]: `wait` atomically releases
/// the mutex and sleeps; woken threads re-acquire it before returning.
pub struct Condition {
    queue: Arc<WaitQueue>,
}

impl Condition {
    pub fn new() -> Arc<Condition> {
        Arc::new(Condition {
            queue: WaitQueue::ranked(),
        })
    }

    pub fn waiters(&self) -> usize {
        self.queue.len()
    }

    pub fn wait(&self, mutex: &Mutex) {
        klock::lock();
        mutex.release_for_wait();
        thread::sleep(&self.queue);
        mutex.lock();
    }

    pub fn signal(&self) {
        klock::lock();
        thread::wakeup(&self.queue);
    }

    pub fn broadcast(&self) {
        klock::lock();
        thread::wakeup_all(&self.queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criterion::{self, Criterion, Policy};
    use crate::thread::{exit, yield_now, Configuration, State, Thread};

    fn body(_: usize) -> i32 {
        0
    }

    fn main_entry(_: usize) -> i32 {
        0
    }

    fn setup() -> Arc<crate::thread::Thread> {
        crate::thread::test_reset(Policy::Fp);
        crate::thread::init(main_entry, 0).unwrap()
    }

    fn spawn_normal() -> Arc<Thread> {
        Thread::spawn(
            Configuration::new(
                State::Ready,
                Criterion::fixed_under(Policy::Fp, criterion::NORMAL, 0),
            ),
            body,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_semaphore_counts_waiters_exactly() {
        let _g = crate::test_support::guard();
        let _main = setup();

        let w1 = spawn_normal();
        let w2 = spawn_normal();
        let w3 = spawn_normal();
        exit(0); // main leaves; w1 runs

        let sem = Semaphore::new(0);

        // Each running thread downs the semaphore and blocks in turn.
        sem.p();
        assert_eq!(w1.state(), State::Waiting);
        sem.p();
        assert_eq!(w2.state(), State::Waiting);
        sem.p();
        assert_eq!(w3.state(), State::Waiting);
        assert_eq!(sem.value(), -3);
        assert_eq!(sem.waiters(), 3);

        // Waiting threads sit in exactly one queue.
        assert_eq!(crate::thread::scheduler().lock().linked_count(w1.id()), 0);
        assert!(w1.waiting_in().is_some());

        // After N releases exactly N waiters pass, FIFO among equals.
        sem.v();
        assert_eq!(w1.state(), State::Running);
        sem.v();
        assert!(w2.state() == State::Ready || w2.state() == State::Running);
        assert_eq!(w3.state(), State::Waiting);
        assert_eq!(sem.value(), -1);
        assert_eq!(sem.waiters(), 1);
    }

    #[test]
    fn test_producer_consumer_accounting() {
        let _g = crate::test_support::guard();
        let _main = setup();

        // Bounded buffer of one slot: empty starts at 1, full at 0.
        let empty = Semaphore::new(1);
        let full = Semaphore::new(0);

        let mut produced = 0u32;
        let mut consumed = 0u32;
        for _ in 0..1000 {
            // Producer: empty.p(); ...; full.v()
            empty.p();
            produced += 1;
            full.v();
            // Consumer: full.p(); ...; empty.v()
            full.p();
            consumed += 1;
            empty.v();
        }

        assert_eq!(produced, 1000);
        assert_eq!(consumed, 1000);
        assert_eq!(empty.value(), 1);
        assert_eq!(full.value(), 0);
        assert_eq!(empty.waiters() + full.waiters(), 0);
    }

    #[test]
    fn test_fair_semaphore_wakes_in_arrival_order() {
        let _g = crate::test_support::guard();
        let _main = setup();

        let high = Thread::spawn(
            Configuration::new(
                State::Ready,
                Criterion::fixed_under(Policy::Fp, criterion::HIGH, 0),
            ),
            body,
            0,
        )
        .unwrap();
        let low = Thread::spawn(
            Configuration::new(
                State::Ready,
                Criterion::fixed_under(Policy::Fp, criterion::LOW, 0),
            ),
            body,
            0,
        )
        .unwrap();
        exit(0);

        let sem = Semaphore::fair(0);

        // The low-priority thread arrives first.
        low.pass();
        sem.p();
        assert_eq!(low.state(), State::Waiting);
        sem.p();
        assert_eq!(high.state(), State::Waiting);

        // Arrival order wins over rank.
        sem.v();
        assert_ne!(low.state(), State::Waiting);
        assert_eq!(high.state(), State::Waiting);
    }

    #[test]
    fn test_mutex_contention_hands_off() {
        let _g = crate::test_support::guard();
        let _main = setup();

        let a = spawn_normal();
        let b = spawn_normal();
        exit(0); // a runs

        let m = Mutex::new();
        m.lock(); // a owns the mutex
        assert!(m.held());
        assert_eq!(m.owner(), a.id());

        yield_now(); // b runs
        assert_eq!(crate::thread::running().id(), b.id());
        m.lock(); // b blocks on the mutex; a runs again
        assert_eq!(b.state(), State::Waiting);
        assert_eq!(crate::thread::running().id(), a.id());

        m.unlock(); // handoff: b owns the lock without it going free
        assert!(m.held());
        assert_eq!(m.owner(), b.id());
        assert_ne!(b.state(), State::Waiting);
    }

    #[test]
    fn test_mutex_uncontended_unlock_frees() {
        let _g = crate::test_support::guard();
        let _main = setup();

        let m = Mutex::new();
        m.lock();
        assert!(m.held());
        m.unlock();
        assert!(!m.held());
        assert_eq!(m.owner(), ThreadId(0));
    }

    #[test]
    fn test_condition_signal_wakes_one() {
        let _g = crate::test_support::guard();
        let _main = setup();

        let t = spawn_normal();
        exit(0); // t runs

        let m = Mutex::new();
        let cond = Condition::new();

        m.lock();
        cond.wait(&m); // t releases the mutex and sleeps
        assert_eq!(t.state(), State::Waiting);
        assert_eq!(cond.waiters(), 1);

        cond.signal();
        assert_eq!(cond.waiters(), 0);
        assert_ne!(t.state(), State::Waiting);
    }

    #[test]
    fn test_condition_broadcast_wakes_all() {
        let _g = crate::test_support::guard();
        let _main = setup();

        let t1 = spawn_normal();
        let t2 = spawn_normal();
        exit(0);

        let m = Mutex::new();
        let cond = Condition::new();

        // Both ready threads fall asleep on the condition in turn.
        m.lock();
        cond.wait(&m);
        assert_eq!(t1.state(), State::Waiting);
        cond.wait(&m);
        assert_eq!(t2.state(), State::Waiting);
        assert_eq!(cond.waiters(), 2);

        cond.broadcast();
        assert_eq!(cond.waiters(), 0);
        assert_ne!(t1.state(), State::Waiting);
        assert_ne!(t2.state(), State::Waiting);
    }

    #[test]
    fn test_timed_wait_cancellation_restores() {
        let _g = crate::test_support::guard();
        let _main = setup();

        let w = spawn_normal();
        exit(0); // w runs

        let sem = Semaphore::new(0);
        sem.p(); // w blocks
        assert_eq!(w.state(), State::Waiting);
        assert_eq!(sem.value(), -1);

        // A timeout alarm cancels the wait: the sleeper comes back READY
        // with the timed-out indicator raised, out of the wait queue.
        let _alarm = Alarm::new(3_000, AlarmHandler::CancelWait(w.id()), 1);
        for _ in 0..3 {
            crate::alarm::tick(0);
        }
        assert_ne!(w.state(), State::Waiting);
        assert_eq!(sem.waiters(), 0);
        assert!(w.took_timeout());

        // The waiter's timeout path restores the counter.
        sem.v();
        assert_eq!(sem.value(), 0);
    }
}
