//! Thread management
//!
//! The unified execution unit for aperiodic, periodic and real-time work.
//! A thread owns its system stack, a saved machine context, a scheduling
//! criterion and a lifecycle state; the scheduler knows it only by id.
//! Every state transition and queue mutation happens under the scheduler
//! lock, and `dispatch` is the single point where machine context
//! changes hands.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard, Once};

use crate::alarm;
use crate::config;
use crate::counters;
use crate::cpu::{self, Context, EntryFn};
use crate::criterion::{self, Criterion};
use crate::ic;
use crate::klock;
use crate::monitor::{self, Statistics};
use crate::rq::{Entry, WaitQueue};
use crate::scheduler::Scheduler;
use crate::task;
use crate::types::{CpuId, InterruptId, KernError, TaskId, ThreadId};

/// Largest stack the core will hand out.
const MAX_STACK: usize = 1 << 20;

// ============================================================================
// Thread State
// ============================================================================

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum State {
    Ready = 0,
    Running = 1,
    Suspended = 2,
    Waiting = 3,
    Finishing = 4,
}

impl State {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => State::Ready,
            1 => State::Running,
            2 => State::Suspended,
            3 => State::Waiting,
            _ => State::Finishing,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Creation parameters. `stack_size == 0` in multitask configurations
/// requests an auto-allocated user stack segment.
#[derive(Debug, Clone, Copy)]
pub struct Configuration {
    pub state: State,
    pub criterion: Criterion,
    pub task: Option<TaskId>,
    pub stack_size: usize,
}

impl Configuration {
    pub fn new(state: State, criterion: Criterion) -> Self {
        Self {
            state,
            criterion,
            task: None,
            stack_size: config::STACK_SIZE,
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new(State::Ready, Criterion::fixed(criterion::NORMAL))
    }
}

// ============================================================================
// Thread
// ============================================================================

pub struct Thread {
    id: ThreadId,
    task: TaskId,
    criterion: Mutex<Criterion>,
    state: AtomicU32,
    stack: Mutex<Box<[u8]>>,
    user_stack: Mutex<Option<task::Segment>>,
    context: Mutex<Context>,
    /// The wait queue this thread sleeps in, when WAITING.
    waiting: Mutex<Option<Arc<WaitQueue>>>,
    /// The single thread blocked in `join` on this one.
    joining: Mutex<Option<ThreadId>>,
    /// Set when a timed wait was cancelled by its alarm.
    timed_out: AtomicBool,
    stats: Mutex<Statistics>,
}

impl Thread {
    /// Create a thread. The construction is two-phase: the count is taken
    /// and the stack allocated first, and a failure rolls both back
    /// without the thread ever being inserted.
    pub fn spawn(
        conf: Configuration,
        entry: EntryFn,
        arg: usize,
    ) -> Result<Arc<Thread>, KernError> {
        debug_assert!(config::MULTITHREAD);
        klock::lock();

        THREAD_COUNT.fetch_add(1, Ordering::SeqCst);

        let user_stacked = config::MULTITASK && conf.stack_size == 0;
        let stack_size = if user_stacked {
            config::STACK_SIZE
        } else {
            conf.stack_size
        };
        let stack = match alloc_stack(stack_size) {
            Ok(s) => s,
            Err(e) => {
                THREAD_COUNT.fetch_sub(1, Ordering::SeqCst);
                klock::unlock();
                return Err(e);
            }
        };

        let task_id = conf.task.unwrap_or_else(|| task::current_id(cpu::id()));

        // User-level stack: initialize it through the creator's address
        // space, then hand it to the owning task's.
        let (user_stack, usp) = if user_stacked {
            let segment = task::Segment::new(config::USER_STACK_SIZE);
            let creator = task::current_id(cpu::id());
            let base = task::attach_segment(creator, &segment);
            let top = base + config::USER_STACK_SIZE;
            let exit = if conf.criterion.rank() == criterion::MAIN {
                // The main thread of a task returns to the loader.
                None
            } else {
                Some(exit_trampoline as fn())
            };
            let used = cpu::init_user_stack(top, exit, arg);
            task::detach_segment(creator, &segment, base);
            let base = task::attach_segment(task_id, &segment);
            (Some(segment), base + config::USER_STACK_SIZE - used)
        } else {
            (None, 0)
        };

        let stack_top = stack.as_ptr() as usize + stack.len();
        let context = cpu::init_stack(usp, stack_top, exit_trampoline, entry, arg);

        let id = ThreadId(NEXT_ID.fetch_add(1, Ordering::SeqCst));
        let thread = Arc::new(Thread {
            id,
            task: task_id,
            criterion: Mutex::new(conf.criterion),
            state: AtomicU32::new(conf.state as u32),
            stack: Mutex::new(stack),
            user_stack: Mutex::new(user_stack),
            context: Mutex::new(context),
            waiting: Mutex::new(None),
            joining: Mutex::new(None),
            timed_out: AtomicBool::new(false),
            stats: Mutex::new(Statistics::default()),
        });

        registry().lock().insert(id, Arc::clone(&thread));
        if config::MULTITASK {
            task::attach_thread(task_id, id);
        }
        counters::THREADS_CREATED.inc();

        {
            let mut sched = scheduler().lock();
            sched.insert(Entry::new(id, conf.criterion.rank()), conf.criterion.queue());
            if conf.state != State::Ready && conf.state != State::Running {
                sched.suspend(id);
            }
        }

        if config::PREEMPTIVE && conf.state == State::Ready && !conf.criterion.is_idle() {
            let target = scheduler().lock().preemption_target(conf.criterion.queue());
            reschedule_on(target);
        } else {
            klock::unlock();
        }

        Ok(thread)
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn state(&self) -> State {
        State::from_u32(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u32, Ordering::SeqCst);
    }

    pub fn criterion(&self) -> Criterion {
        *self.criterion.lock()
    }

    /// Overwrite the criterion without touching queue membership; the new
    /// rank is observed at the next insert.
    pub(crate) fn set_criterion(&self, c: Criterion) {
        *self.criterion.lock() = c;
    }

    pub fn priority(&self) -> criterion::Rank {
        self.criterion.lock().rank()
    }

    pub fn statistics(&self) -> Statistics {
        *self.stats.lock()
    }

    pub(crate) fn stats_guard(&self) -> MutexGuard<'_, Statistics> {
        self.stats.lock()
    }

    /// The exit status, stored at the base of the system stack.
    pub fn exit_status(&self) -> i32 {
        let stack = self.stack.lock();
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&stack[..4]);
        i32::from_ne_bytes(bytes)
    }

    fn write_status(&self, status: i32) {
        let mut stack = self.stack.lock();
        stack[..4].copy_from_slice(&status.to_ne_bytes());
    }

    pub(crate) fn set_timed_out(&self, v: bool) {
        self.timed_out.store(v, Ordering::SeqCst);
    }

    pub(crate) fn took_timeout(&self) -> bool {
        self.timed_out.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn waiting_in(&self) -> Option<Arc<WaitQueue>> {
        self.waiting.lock().clone()
    }

    /// Re-rank this thread. Ready threads are re-inserted; a running
    /// thread keeps its slot and both the new home queue and the old one
    /// are rescheduled.
    pub fn set_priority(&self, c: Criterion) {
        klock::lock();

        let old_queue = self.criterion().queue();
        let state = self.state();

        match state {
            State::Running => {
                *self.criterion.lock() = c;
                scheduler().lock().reweigh_chosen(self.id, c.rank());
            }
            State::Ready => {
                let mut sched = scheduler().lock();
                sched.remove(self.id);
                *self.criterion.lock() = c;
                sched.insert(Entry::new(self.id, c.rank()), c.queue());
            }
            State::Waiting => {
                *self.criterion.lock() = c;
                if let Some(q) = self.waiting.lock().as_ref() {
                    if q.remove(self.id).is_some() {
                        q.insert(Entry::new(self.id, c.rank()));
                    }
                }
            }
            State::Suspended | State::Finishing => {
                *self.criterion.lock() = c;
            }
        }

        if config::PREEMPTIVE && state != State::Waiting && state != State::Finishing {
            // Reschedule the new home queue, and the old one when the
            // thread migrated.
            let (new_target, old_target) = {
                let sched = scheduler().lock();
                (
                    sched.preemption_target(c.queue()),
                    sched.preemption_target(old_queue),
                )
            };
            let me = cpu::id();
            let mut local = false;
            let mut signalled = [false; config::CPUS];
            for target in [new_target, old_target] {
                if target == me {
                    local = true;
                } else if !signalled[target as usize] {
                    ic::ipi(target, ic::INT_RESCHEDULER);
                    signalled[target as usize] = true;
                }
            }
            if local {
                reschedule_locked();
            } else {
                klock::unlock();
            }
        } else {
            klock::unlock();
        }
    }

    /// Block until this thread finishes; returns its exit status. A
    /// thread may not join itself and takes at most one joiner.
    pub fn join(&self) -> i32 {
        klock::lock();

        let caller = try_running();
        if let Some(ref caller) = caller {
            debug_assert!(caller.id != self.id, "a thread cannot join itself");
        }
        debug_assert!(self.joining.lock().is_none(), "a thread takes a single joiner");

        if self.state() != State::Finishing {
            if let Some(caller) = caller {
                *self.joining.lock() = Some(caller.id);
                caller.suspend_locked();
            } else {
                klock::unlock();
            }
        } else {
            klock::unlock();
        }

        self.exit_status()
    }

    /// Hand the processor to this thread if it is schedulable on the
    /// caller's core; not a priority override.
    pub fn pass(&self) {
        klock::lock();
        let this_cpu = cpu::id();

        let prev = scheduler().lock().chosen(this_cpu);
        let next = scheduler().lock().choose_that(this_cpu, self.id);

        match (prev.and_then(|e| find(e.id)), next.and_then(|e| find(e.id))) {
            (Some(prev), Some(next)) => dispatch(&prev, &next),
            _ => klock::unlock(),
        }
    }

    /// Move this thread to the suspended set.
    pub fn suspend(&self) {
        self.suspend_inner(false);
    }

    pub(crate) fn suspend_locked(&self) {
        self.suspend_inner(true);
    }

    fn suspend_inner(&self, locked: bool) {
        if !locked {
            klock::lock();
        }
        let this_cpu = cpu::id();

        let prev = scheduler().lock().chosen(this_cpu);
        self.set_state(State::Suspended);
        scheduler().lock().suspend(self.id);
        let next = scheduler().lock().chosen(this_cpu);

        match (prev.and_then(|e| find(e.id)), next.and_then(|e| find(e.id))) {
            (Some(prev), Some(next)) => dispatch(&prev, &next),
            _ => klock::unlock(),
        }
    }

    /// Make a suspended thread schedulable again; preempts its home core
    /// when it outranks the thread running there.
    pub fn resume(&self) {
        klock::lock();

        if self.state() == State::Suspended {
            self.set_state(State::Ready);
            let crit = self.criterion();
            let target = {
                let mut sched = scheduler().lock();
                sched.resume(Entry::new(self.id, crit.rank()), crit.queue());
                sched.preemption_target(crit.queue())
            };
            if config::PREEMPTIVE {
                reschedule_on(target);
            } else {
                klock::unlock();
            }
        } else {
            klock::unlock();
        }
    }

    /// Tear a thread down. The running thread cannot destroy itself;
    /// destruction of any other state unlinks it everywhere, wakes a
    /// pending joiner and is idempotent.
    pub fn destroy(&self) -> Result<(), KernError> {
        klock::lock();

        if !registry().lock().contains_key(&self.id) {
            klock::unlock();
            return Ok(());
        }

        let state = self.state();
        debug_assert!(state != State::Running, "the running thread cannot destroy itself");
        if state == State::Running {
            klock::unlock();
            return Err(KernError::Busy);
        }

        match state {
            State::Ready | State::Suspended => {
                scheduler().lock().remove(self.id);
                THREAD_COUNT.fetch_sub(1, Ordering::SeqCst);
            }
            State::Waiting => {
                if let Some(q) = self.waiting.lock().take() {
                    q.remove(self.id);
                }
                scheduler().lock().remove(self.id);
                THREAD_COUNT.fetch_sub(1, Ordering::SeqCst);
            }
            State::Finishing => {}
            State::Running => unreachable!(),
        }

        if config::MULTITASK {
            task::detach_thread(self.task, self.id);
            *self.user_stack.lock() = None;
        }

        let joiner = self.joining.lock().take().and_then(find);
        registry().lock().remove(&self.id);
        counters::THREADS_DESTROYED.inc();

        klock::unlock();

        if let Some(joiner) = joiner {
            joiner.resume();
        }
        Ok(())
    }

    /// Save the running thread's criterion and service an interrupt at
    /// ISR rank, biased by the interrupt id.
    pub fn begin_isr(&self, interrupt: InterruptId) -> Criterion {
        debug_assert!(self.state() == State::Running);
        let saved = self.criterion();
        let mut biased = saved;
        biased.set_rank(criterion::isr_rank(interrupt));
        *self.criterion.lock() = biased;
        scheduler().lock().reweigh_chosen(self.id, biased.rank());
        saved
    }

    /// Restore the criterion saved by `begin_isr`.
    pub fn end_isr(&self, _interrupt: InterruptId, saved: Criterion) {
        debug_assert!(self.state() == State::Running);
        *self.criterion.lock() = saved;
        scheduler().lock().reweigh_chosen(self.id, saved.rank());
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("rank", &self.priority())
            .finish()
    }
}

// ============================================================================
// Global State
// ============================================================================

static REGISTRY: Once<Mutex<BTreeMap<ThreadId, Arc<Thread>>>> = Once::new();
static SCHEDULER: Once<Mutex<Scheduler>> = Once::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(ThreadId::FIRST);
static THREAD_COUNT: AtomicUsize = AtomicUsize::new(0);
static BOOTED: AtomicBool = AtomicBool::new(false);

fn registry() -> &'static Mutex<BTreeMap<ThreadId, Arc<Thread>>> {
    REGISTRY.call_once(|| Mutex::new(BTreeMap::new()))
}

pub(crate) fn scheduler() -> &'static Mutex<Scheduler> {
    SCHEDULER.call_once(|| Mutex::new(Scheduler::new(config::DEFAULT_POLICY)))
}

/// Look a thread up by id.
pub fn find(id: ThreadId) -> Option<Arc<Thread>> {
    registry().lock().get(&id).cloned()
}

/// Live threads, idle threads included.
pub fn thread_count() -> usize {
    THREAD_COUNT.load(Ordering::SeqCst)
}

pub fn booted() -> bool {
    BOOTED.load(Ordering::SeqCst)
}

/// The thread running on the calling core.
pub fn running() -> Arc<Thread> {
    try_running().expect("threading not initialized")
}

pub fn try_running() -> Option<Arc<Thread>> {
    let entry = scheduler().lock().chosen(cpu::id())?;
    find(entry.id)
}

fn alloc_stack(size: usize) -> Result<Box<[u8]>, KernError> {
    if size < 16 {
        return Err(KernError::Invalid);
    }
    if size > MAX_STACK {
        return Err(KernError::OutOfMemory);
    }
    Ok(vec![0u8; size].into_boxed_slice())
}

/// Entered when a thread's entry function returns.
fn exit_trampoline() {
    exit(0);
}

// ============================================================================
// Class operations
// ============================================================================

/// Give the processor up; the caller goes back to READY and the most
/// urgent ready thread (the caller excluded when possible) runs.
pub fn yield_now() {
    klock::lock();
    let this_cpu = cpu::id();

    let prev = scheduler().lock().chosen(this_cpu);
    let next = scheduler().lock().choose_another(this_cpu);

    match (prev.and_then(|e| find(e.id)), next.and_then(|e| find(e.id))) {
        (Some(prev), Some(next)) => dispatch(&prev, &next),
        _ => klock::unlock(),
    }
}

/// Terminate the running thread: store its status at the stack base,
/// wake a pending joiner and dispatch the next chosen.
pub fn exit(status: i32) {
    klock::lock();
    let this_cpu = cpu::id();

    let prev = match scheduler().lock().chosen(this_cpu).and_then(|e| find(e.id)) {
        Some(t) => t,
        None => {
            klock::unlock();
            return;
        }
    };

    scheduler().lock().remove(prev.id);
    prev.set_state(State::Finishing);
    prev.write_status(status);
    THREAD_COUNT.fetch_sub(1, Ordering::SeqCst);

    if let Some(joiner) = prev.joining.lock().take().and_then(find) {
        joiner.set_state(State::Ready);
        let crit = joiner.criterion();
        scheduler()
            .lock()
            .resume(Entry::new(joiner.id, crit.rank()), crit.queue());
    }

    // Re-pick: a joiner resumed above may outrank the refilled chosen.
    // At least the idle thread is always there.
    match scheduler().lock().choose(this_cpu).and_then(|e| find(e.id)) {
        Some(next) => dispatch(&prev, &next),
        None => klock::unlock(),
    }
}

// ============================================================================
// Sleep / Wakeup
// ============================================================================

/// Put the running thread to sleep in `q`. The scheduler lock must be
/// held; it is consumed by the dispatch.
pub(crate) fn sleep(q: &Arc<WaitQueue>) {
    debug_assert!(klock::locked());
    let this_cpu = cpu::id();

    let prev = match scheduler().lock().chosen(this_cpu).and_then(|e| find(e.id)) {
        Some(t) => t,
        None => {
            klock::unlock();
            return;
        }
    };

    scheduler().lock().block(prev.id);
    prev.set_state(State::Waiting);
    *prev.waiting.lock() = Some(Arc::clone(q));
    q.insert(Entry::new(prev.id, prev.criterion().rank()));

    match scheduler().lock().chosen(this_cpu).and_then(|e| find(e.id)) {
        Some(next) => dispatch(&prev, &next),
        None => klock::unlock(),
    }
}

/// Wake the head of `q`. The scheduler lock must be held; it is consumed.
pub(crate) fn wakeup(q: &Arc<WaitQueue>) {
    debug_assert!(klock::locked());

    if let Some(entry) = q.pop_head() {
        let target = wake_entry(entry);
        counters::WAKEUPS.inc();
        if config::PREEMPTIVE {
            reschedule_on(target);
            return;
        }
    }
    klock::unlock();
}

/// Drain `q`, then reschedule every affected core once. The scheduler
/// lock must be held; it is consumed.
pub(crate) fn wakeup_all(q: &Arc<WaitQueue>) {
    debug_assert!(klock::locked());

    let mut cpus: u32 = 0;
    while let Some(entry) = q.pop_head() {
        let target = wake_entry(entry);
        counters::WAKEUPS.inc();
        cpus |= 1 << target;
    }

    if cpus != 0 && config::PREEMPTIVE {
        let me = cpu::id();
        let mut local = false;
        for target in 0..config::CPUS as u32 {
            if cpus & (1 << target) == 0 {
                continue;
            }
            if target == me {
                local = true;
            } else {
                ic::ipi(target, ic::INT_RESCHEDULER);
            }
        }
        if local {
            reschedule_locked();
            return;
        }
    }
    klock::unlock();
}

/// Wake the head of `q` without consuming the scheduler lock or
/// rescheduling; the caller finishes the preemption itself. Used for
/// mutex handoff.
pub(crate) fn wakeup_one_keep_lock(q: &Arc<WaitQueue>) -> Option<(ThreadId, CpuId)> {
    debug_assert!(klock::locked());
    let entry = q.pop_head()?;
    let id = entry.id;
    let target = wake_entry(entry);
    counters::WAKEUPS.inc();
    Some((id, target))
}

/// Make a woken thread READY and schedulable; returns the core to
/// reschedule.
fn wake_entry(entry: Entry) -> CpuId {
    let thread = find(entry.id).expect("woken thread vanished");
    thread.set_state(State::Ready);
    *thread.waiting.lock() = None;
    let crit = thread.criterion();
    let mut sched = scheduler().lock();
    sched.resume(Entry::new(thread.id, crit.rank()), crit.queue());
    sched.preemption_target(crit.queue())
}

/// Cancel a timed wait: unlink the thread from its wait queue and make it
/// READY with the timeout flag raised. Invoked by the alarm machinery.
pub(crate) fn cancel_wait(id: ThreadId) {
    klock::lock();

    let thread = match find(id) {
        Some(t) => t,
        None => {
            klock::unlock();
            return;
        }
    };

    if thread.state() != State::Waiting {
        klock::unlock();
        return;
    }

    if let Some(q) = thread.waiting.lock().take() {
        q.remove(id);
    }
    thread.set_state(State::Ready);
    thread.set_timed_out(true);
    let crit = thread.criterion();
    let target = {
        let mut sched = scheduler().lock();
        sched.resume(Entry::new(id, crit.rank()), crit.queue());
        sched.preemption_target(crit.queue())
    };
    if config::PREEMPTIVE {
        reschedule_on(target);
    } else {
        klock::unlock();
    }
}

// ============================================================================
// Reschedule
// ============================================================================

/// Pick and dispatch on the calling core. The scheduler lock must be
/// held; it is consumed.
pub(crate) fn reschedule_locked() {
    debug_assert!(klock::locked());
    let this_cpu = cpu::id();

    let prev = scheduler().lock().chosen(this_cpu);
    let next = scheduler().lock().choose(this_cpu);

    match (prev.and_then(|e| find(e.id)), next.and_then(|e| find(e.id))) {
        (Some(prev), Some(next)) => dispatch(&prev, &next),
        _ => klock::unlock(),
    }
}

/// Reschedule `cpu`: locally by pick-and-dispatch, remotely by IPI. The
/// scheduler lock must be held; it is consumed either way.
pub(crate) fn reschedule_on(cpu: CpuId) {
    if !config::MULTICORE || cpu == cpu::id() {
        reschedule_locked();
    } else {
        ic::ipi(cpu, ic::INT_RESCHEDULER);
        klock::unlock();
    }
}

/// IPI handler: re-enter the scheduler on this core.
pub(crate) fn rescheduler(_interrupt: InterruptId) {
    klock::lock();
    reschedule_locked();
}

/// Quantum expiry under a timed discipline.
pub(crate) fn time_slicer(_interrupt: InterruptId) {
    klock::lock();
    reschedule_locked();
}

// ============================================================================
// Dispatch
// ============================================================================

/// The single context-switch point. Statistics are charged, states flip,
/// the spin lock is released right before the switch and interrupts come
/// back on after it returns.
fn dispatch(prev: &Arc<Thread>, next: &Arc<Thread>) {
    if config::MONITORED {
        monitor::run(prev, next, cpu::id());
    }

    if prev.id != next.id {
        if prev.state() == State::Running {
            prev.set_state(State::Ready);
        }
        next.set_state(State::Running);
        counters::CONTEXT_SWITCHES.inc();

        klock::release_spin();

        if config::MULTITASK && next.task != prev.task {
            task::activate(next.task);
        }

        {
            let mut prev_ctx = prev.context.lock();
            let next_ctx = next.context.lock();
            cpu::switch_context(&mut prev_ctx, &next_ctx);
        }
    } else {
        klock::release_spin();
    }

    cpu::int_enable();
}

// ============================================================================
// Idle
// ============================================================================

/// Per-core idle body: halt until work shows up; the last core standing
/// flushes the monitor and reboots or halts the machine.
fn idle_entry(_arg: usize) -> i32 {
    while thread_count() > cpu::cores() as usize {
        cpu::int_enable();
        cpu::halt();

        if scheduler().lock().schedulables() > 0 {
            yield_now();
        }
    }

    cpu::int_disable();
    if cpu::id() == 0 {
        if config::MONITORED {
            monitor::process_batch();
        }
        if config::REBOOT {
            cpu::reboot();
        } else {
            cpu::halt();
        }
    }

    loop {
        cpu::spin_hint();
    }
}

// ============================================================================
// Boot
// ============================================================================

/// Bring threading up: wire the reschedule and timer vectors, wrap the
/// caller into the MAIN thread and give every core an idle thread.
pub fn init(entry: EntryFn, arg: usize) -> Result<Arc<Thread>, KernError> {
    debug_assert!(!booted());

    ic::int_vector(ic::INT_RESCHEDULER, rescheduler);
    ic::int_vector(ic::INT_SYS_TIMER, alarm::timer_handler);

    let main = Thread::spawn(
        Configuration {
            state: State::Running,
            criterion: Criterion::main_thread(),
            task: None,
            stack_size: config::STACK_SIZE,
        },
        entry,
        arg,
    )?;

    for cpu in 0..cpu::cores() {
        Thread::spawn(
            Configuration {
                state: State::Ready,
                criterion: Criterion::idle(cpu),
                task: None,
                stack_size: config::STACK_SIZE,
            },
            idle_entry,
            0,
        )?;
    }

    // Idle threads that landed directly in a free chosen slot are the
    // running threads of their cores.
    {
        let sched = scheduler().lock();
        for cpu in 0..cpu::cores() {
            if let Some(entry) = sched.chosen(cpu) {
                if let Some(t) = find(entry.id) {
                    if t.state() == State::Ready {
                        t.set_state(State::Running);
                    }
                }
            }
        }
    }

    alarm::start_timer();
    BOOTED.store(true, Ordering::SeqCst);
    Ok(main)
}

// ============================================================================
// Identity
// ============================================================================

pub mod this_thread {
    use super::*;

    /// The calling thread's id. Before threading is up this is the boot
    /// sentinel `cpu id + 1`, reserved and never allocated to a real
    /// thread.
    pub fn id() -> u64 {
        if booted() {
            try_running().map(|t| t.id().0).unwrap_or(cpu::id() as u64 + 1)
        } else {
            cpu::id() as u64 + 1
        }
    }
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) fn test_reset(policy: crate::criterion::Policy) {
    registry().lock().clear();
    *scheduler().lock() = Scheduler::new(policy);
    NEXT_ID.store(ThreadId::FIRST, Ordering::SeqCst);
    THREAD_COUNT.store(0, Ordering::SeqCst);
    BOOTED.store(false, Ordering::SeqCst);
    cpu::set_id(0);
    cpu::int_enable();
    ic::reset();
    alarm::reset();
    monitor::reset();
    counters::reset_all();
    task::reset();
}
