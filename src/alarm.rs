//! Alarms and the scheduler timer
//!
//! A single ordered timeout list keyed by absolute expiry tick drives
//! every time-based activation. The timer interrupt ticks each core at
//! `FREQUENCY`; core 0 owns the alarm list, every core counts down its
//! quantum and re-enters the scheduler when a timed discipline says so.
//! Handlers run from the tick path with interrupts masked on the timer
//! core, so they are a small closed set of actions rather than arbitrary
//! trait objects: release a semaphore, update a criterion then release,
//! resume a thread, cancel a timed wait, or call a plain function.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::config;
use crate::counters;
use crate::cpu;
use crate::klock;
use crate::monitor;
use crate::synchronizer::Semaphore;
use crate::thread;
use crate::types::{us_to_ticks, CpuId, InterruptId, Microsecond, ThreadId, Tick};

/// Rearm forever.
pub const INFINITE: u64 = u64::MAX;

const US_PER_TICK: u64 = 1_000_000 / config::FREQUENCY;

// ============================================================================
// Handlers
// ============================================================================

/// What an alarm does when it fires.
#[derive(Clone)]
pub enum AlarmHandler {
    /// Release a semaphore: the periodic job-release mechanism.
    SemaphoreV(Arc<Semaphore>),
    /// Re-rank a dynamic criterion, then release.
    UpdateAndRelease(ThreadId, Arc<Semaphore>),
    /// Resume a thread (the event-handler-that-triggers-a-thread).
    ResumeThread(ThreadId),
    /// Cancel a timed wait, waking the sleeper with the timeout flag.
    CancelWait(ThreadId),
    /// Plain function.
    Function(fn()),
    /// Real-time activation point: on fire, turn this alarm into the
    /// thread's periodic alarm and release the first job.
    Activate {
        thread: ThreadId,
        sem: Arc<Semaphore>,
        period: Microsecond,
        times: u64,
    },
}

impl core::fmt::Debug for AlarmHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            AlarmHandler::SemaphoreV(_) => "SemaphoreV",
            AlarmHandler::UpdateAndRelease(..) => "UpdateAndRelease",
            AlarmHandler::ResumeThread(_) => "ResumeThread",
            AlarmHandler::CancelWait(_) => "CancelWait",
            AlarmHandler::Function(_) => "Function",
            AlarmHandler::Activate { .. } => "Activate",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Alarm
// ============================================================================

/// A (deadline, period, handler, times) tuple linked in the global
/// timeout list. `times` counts down per fire; zero consumes the alarm,
/// `INFINITE` rearms indefinitely.
#[derive(Debug)]
pub struct Alarm {
    period: AtomicU64, // ticks
    times: AtomicU64,
    handler: Mutex<AlarmHandler>,
    active: AtomicBool,
}

struct Pending {
    expiry: Tick,
    alarm: Arc<Alarm>,
}

static ALARM_LIST: Mutex<Vec<Pending>> = Mutex::new(Vec::new());
static ELAPSED: AtomicU64 = AtomicU64::new(0);
static QUANTUM_LEFT: [AtomicU64; config::CPUS] = [const { AtomicU64::new(0) }; config::CPUS];

impl Alarm {
    /// Arm an alarm `time` microseconds from now, firing `times` times
    /// with `time` as the period.
    pub fn new(time: Microsecond, handler: AlarmHandler, times: u64) -> Arc<Alarm> {
        let ticks = us_to_ticks(time).max(1);
        let alarm = Arc::new(Alarm {
            period: AtomicU64::new(ticks),
            times: AtomicU64::new(times),
            handler: Mutex::new(handler),
            active: AtomicBool::new(true),
        });
        enqueue(elapsed() + ticks, Arc::clone(&alarm));
        alarm
    }

    pub fn period(&self) -> Microsecond {
        self.period.load(Ordering::SeqCst) * US_PER_TICK
    }

    /// Change the period; takes effect at the next rearm.
    pub fn set_period(&self, period: Microsecond) {
        self.period.store(us_to_ticks(period).max(1), Ordering::SeqCst);
    }

    /// Activations left; `INFINITE` never decrements.
    pub fn remaining(&self) -> u64 {
        self.times.load(Ordering::SeqCst)
    }

    /// Take the alarm out of the list; pending entries are dropped at the
    /// next tick.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

fn enqueue(expiry: Tick, alarm: Arc<Alarm>) {
    let mut list = ALARM_LIST.lock();
    // Insert after equal expiries: same-tick handlers fire in insertion
    // order.
    let pos = list
        .iter()
        .position(|p| p.expiry > expiry)
        .unwrap_or(list.len());
    list.insert(pos, Pending { expiry, alarm });
}

/// Ticks since boot.
pub fn elapsed() -> Tick {
    ELAPSED.load(Ordering::SeqCst)
}

/// Microseconds-to-ticks at the timer frequency.
pub fn ticks(time: Microsecond) -> Tick {
    us_to_ticks(time)
}

// ============================================================================
// Tick path
// ============================================================================

/// Timer interrupt entry.
pub(crate) fn timer_handler(_interrupt: InterruptId) {
    tick(cpu::id());
}

/// One timer tick on `cpu`. Core 0 advances time and fires due alarms;
/// every core runs its quantum down and time-slices under a timed
/// discipline.
pub fn tick(cpu_id: CpuId) {
    counters::TIMER_TICKS.inc();

    if cpu_id == 0 {
        cpu::advance_time(US_PER_TICK);
        let now = ELAPSED.fetch_add(1, Ordering::SeqCst) + 1;
        let ts = cpu::time_stamp();
        for c in 0..config::CPUS as CpuId {
            monitor::tick_hyperperiod(c, ts);
        }
        fire_due(now);
    }

    if thread::booted() && config::PREEMPTIVE {
        let timed = thread::scheduler().lock().policy().timed();
        if timed && quantum_expired(cpu_id) {
            thread::time_slicer(0);
        }
    }
}

fn quantum_expired(cpu_id: CpuId) -> bool {
    let slot = &QUANTUM_LEFT[cpu_id as usize];
    let left = slot.load(Ordering::SeqCst);
    if left <= 1 {
        slot.store(us_to_ticks(config::QUANTUM).max(1), Ordering::SeqCst);
        left == 1
    } else {
        slot.store(left - 1, Ordering::SeqCst);
        false
    }
}

fn fire_due(now: Tick) {
    let due: Vec<Pending> = {
        let mut list = ALARM_LIST.lock();
        let mut due = Vec::new();
        while let Some(head) = list.first() {
            if head.expiry > now {
                break;
            }
            due.push(list.remove(0));
        }
        due
    };

    for pending in due {
        let alarm = pending.alarm;
        if !alarm.active.load(Ordering::SeqCst) {
            continue;
        }
        counters::ALARMS_FIRED.inc();

        let handler = alarm.handler.lock().clone();
        let activation = matches!(handler, AlarmHandler::Activate { .. });
        invoke(&alarm, handler);

        if activation {
            // The activation fire morphed the alarm into its periodic
            // form; the first periodic release is one period out.
            if alarm.times.load(Ordering::SeqCst) != 0 {
                enqueue(now + alarm.period.load(Ordering::SeqCst), alarm);
            }
        } else {
            let times = alarm.times.load(Ordering::SeqCst);
            if times == INFINITE {
                enqueue(now + alarm.period.load(Ordering::SeqCst), alarm);
            } else if times > 0 {
                let left = times - 1;
                alarm.times.store(left, Ordering::SeqCst);
                if left > 0 {
                    enqueue(now + alarm.period.load(Ordering::SeqCst), alarm);
                }
            }
        }
    }
}

fn invoke(alarm: &Arc<Alarm>, handler: AlarmHandler) {
    match handler {
        AlarmHandler::SemaphoreV(sem) => sem.v(),
        AlarmHandler::UpdateAndRelease(tid, sem) => {
            refresh_criterion(tid);
            sem.v();
        }
        AlarmHandler::ResumeThread(tid) => {
            if let Some(t) = thread::find(tid) {
                t.resume();
            }
        }
        AlarmHandler::CancelWait(tid) => thread::cancel_wait(tid),
        AlarmHandler::Function(f) => f(),
        AlarmHandler::Activate {
            thread: tid,
            sem,
            period,
            times,
        } => {
            // Become the thread's periodic alarm.
            alarm.period.store(us_to_ticks(period).max(1), Ordering::SeqCst);
            alarm.times.store(times, Ordering::SeqCst);
            let dynamic = thread::find(tid)
                .map(|t| t.criterion().dynamic())
                .unwrap_or(false);
            *alarm.handler.lock() = if dynamic {
                AlarmHandler::UpdateAndRelease(tid, Arc::clone(&sem))
            } else {
                AlarmHandler::SemaphoreV(Arc::clone(&sem))
            };
            if dynamic {
                refresh_criterion(tid);
            }
            sem.v();
        }
    }
}

fn refresh_criterion(tid: ThreadId) {
    if let Some(t) = thread::find(tid) {
        klock::lock();
        let mut c = t.criterion();
        c.update();
        t.set_criterion(c);
        klock::unlock();
    }
}

/// Busy-free sleep: arm a one-shot release and wait for it.
pub fn delay(time: Microsecond) {
    let sem = Semaphore::new(0);
    let _alarm = Alarm::new(time, AlarmHandler::SemaphoreV(Arc::clone(&sem)), 1);
    sem.p();
}

/// Prime the per-core quantum counters.
pub(crate) fn start_timer() {
    for slot in QUANTUM_LEFT.iter() {
        slot.store(us_to_ticks(config::QUANTUM).max(1), Ordering::SeqCst);
    }
}

#[cfg(test)]
pub(crate) fn reset() {
    ALARM_LIST.lock().clear();
    ELAPSED.store(0, Ordering::SeqCst);
    start_timer();
}

#[cfg(test)]
mod tests {
    use super::*;

    static FIRES: AtomicU64 = AtomicU64::new(0);
    static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());

    fn count() {
        FIRES.fetch_add(1, Ordering::SeqCst);
    }

    fn first() {
        ORDER.lock().push(1);
    }

    fn second() {
        ORDER.lock().push(2);
    }

    fn run_ticks(n: u64) {
        for _ in 0..n {
            tick(0);
        }
    }

    #[test]
    fn test_one_shot_fires_once() {
        let _g = crate::test_support::guard();
        crate::thread::test_reset(crate::criterion::Policy::Fp);
        FIRES.store(0, Ordering::SeqCst);

        let a = Alarm::new(3 * US_PER_TICK, AlarmHandler::Function(count), 1);
        run_ticks(2);
        assert_eq!(FIRES.load(Ordering::SeqCst), 0);
        run_ticks(1);
        assert_eq!(FIRES.load(Ordering::SeqCst), 1);
        assert_eq!(a.remaining(), 0);
        run_ticks(10);
        assert_eq!(FIRES.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_periodic_rearms_until_consumed() {
        let _g = crate::test_support::guard();
        crate::thread::test_reset(crate::criterion::Policy::Fp);
        FIRES.store(0, Ordering::SeqCst);

        let a = Alarm::new(5 * US_PER_TICK, AlarmHandler::Function(count), 3);
        run_ticks(20);
        assert_eq!(FIRES.load(Ordering::SeqCst), 3);
        assert_eq!(a.remaining(), 0);
    }

    #[test]
    fn test_infinite_fire_count_over_interval() {
        let _g = crate::test_support::guard();
        crate::thread::test_reset(crate::criterion::Policy::Fp);
        FIRES.store(0, Ordering::SeqCst);

        // Property: over T ticks a period-P alarm fires floor(T/P) +/- 1
        // times.
        let _a = Alarm::new(5 * US_PER_TICK, AlarmHandler::Function(count), INFINITE);
        run_ticks(23);
        let fires = FIRES.load(Ordering::SeqCst);
        assert!((3..=5).contains(&fires), "fires = {}", fires);
    }

    #[test]
    fn test_same_tick_fires_in_insertion_order() {
        let _g = crate::test_support::guard();
        crate::thread::test_reset(crate::criterion::Policy::Fp);
        ORDER.lock().clear();

        let _a = Alarm::new(2 * US_PER_TICK, AlarmHandler::Function(first), 1);
        let _b = Alarm::new(2 * US_PER_TICK, AlarmHandler::Function(second), 1);
        run_ticks(2);
        assert_eq!(*ORDER.lock(), alloc::vec![1, 2]);
    }

    #[test]
    fn test_quantum_slices_round_robin() {
        let _g = crate::test_support::guard();
        crate::thread::test_reset(crate::criterion::Policy::Rr);

        fn body(_: usize) -> i32 {
            0
        }
        crate::thread::init(body, 0).unwrap();

        let conf = |cpu| {
            crate::thread::Configuration::new(
                crate::thread::State::Ready,
                crate::criterion::Criterion::fixed_under(
                    crate::criterion::Policy::Rr,
                    crate::criterion::NORMAL,
                    cpu,
                ),
            )
        };
        let t1 = crate::thread::Thread::spawn(conf(0), body, 0).unwrap();
        let t2 = crate::thread::Thread::spawn(conf(0), body, 0).unwrap();
        crate::thread::exit(0); // main leaves; t1 runs

        let quantum = us_to_ticks(crate::config::QUANTUM).max(1);
        assert_eq!(crate::thread::running().id(), t1.id());
        run_ticks(quantum);
        assert_eq!(crate::thread::running().id(), t2.id());
        run_ticks(quantum);
        assert_eq!(crate::thread::running().id(), t1.id());
    }

    #[test]
    fn test_cancel_drops_pending_fire() {
        let _g = crate::test_support::guard();
        crate::thread::test_reset(crate::criterion::Policy::Fp);
        FIRES.store(0, Ordering::SeqCst);

        let a = Alarm::new(2 * US_PER_TICK, AlarmHandler::Function(count), 1);
        a.cancel();
        run_ticks(5);
        assert_eq!(FIRES.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delay_blocks_until_elapsed() {
        let _g = crate::test_support::guard();
        crate::thread::test_reset(crate::criterion::Policy::Fp);

        fn body(_: usize) -> i32 {
            0
        }
        crate::thread::init(body, 0).unwrap();
        let t = crate::thread::Thread::spawn(
            crate::thread::Configuration::new(
                crate::thread::State::Ready,
                crate::criterion::Criterion::fixed_under(
                    crate::criterion::Policy::Fp,
                    crate::criterion::NORMAL,
                    0,
                ),
            ),
            body,
            0,
        )
        .unwrap();
        crate::thread::exit(0);
        assert_eq!(crate::thread::running().id(), t.id());

        delay(5 * US_PER_TICK);
        assert_eq!(t.state(), crate::thread::State::Waiting);
        run_ticks(4);
        assert_eq!(t.state(), crate::thread::State::Waiting);
        run_ticks(1);
        assert_eq!(t.state(), crate::thread::State::Running);
    }

    #[test]
    fn test_set_period_applies_at_rearm() {
        let _g = crate::test_support::guard();
        crate::thread::test_reset(crate::criterion::Policy::Fp);
        FIRES.store(0, Ordering::SeqCst);

        let a = Alarm::new(2 * US_PER_TICK, AlarmHandler::Function(count), INFINITE);
        run_ticks(2);
        assert_eq!(FIRES.load(Ordering::SeqCst), 1);

        // The fire above already rearmed with the old period; the new one
        // governs every rearm after that.
        a.set_period(10 * US_PER_TICK);
        assert_eq!(a.period(), 10 * US_PER_TICK);
        run_ticks(2);
        assert_eq!(FIRES.load(Ordering::SeqCst), 2);
        run_ticks(9);
        assert_eq!(FIRES.load(Ordering::SeqCst), 2);
        run_ticks(1);
        assert_eq!(FIRES.load(Ordering::SeqCst), 3);
        a.cancel();
    }
}
