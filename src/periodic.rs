//! Periodic and real-time threads
//!
//! A periodic thread pairs a thread with a binary semaphore and an alarm
//! whose handler releases the next job each period; dynamic criteria are
//! re-ranked right before the release. The thread is created SUSPENDED
//! and resumed explicitly so its first activation aligns with the alarm
//! rather than with construction. A real-time thread adds an activation
//! delay: a one-shot alarm at the activation point that then becomes the
//! periodic alarm.

use alloc::sync::Arc;

use crate::alarm::{Alarm, AlarmHandler, INFINITE};
use crate::config;
use crate::cpu::{self, EntryFn};
use crate::criterion::{self, Criterion, Policy};
use crate::monitor;
use crate::synchronizer::Semaphore;
use crate::thread::{Configuration, State, Thread};
use crate::types::{KernError, Microsecond};

/// Deadline equals the period.
pub const SAME: Microsecond = 0;
/// No activation delay.
pub const NOW: Microsecond = 0;
/// Any core.
pub const ANY: u32 = criterion::ANY;

// ============================================================================
// Periodic Thread
// ============================================================================

/// Creation parameters for periodic and real-time threads.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicConfiguration {
    pub period: Microsecond,
    /// `SAME` takes the period.
    pub deadline: Microsecond,
    pub capacity: Microsecond,
    pub times: u64,
    pub cpu: u32,
    pub policy: Policy,
    pub state: State,
    pub stack_size: usize,
}

impl PeriodicConfiguration {
    pub fn new(period: Microsecond) -> Self {
        Self {
            period,
            deadline: SAME,
            capacity: 0,
            times: INFINITE,
            cpu: ANY,
            policy: config::DEFAULT_POLICY,
            state: State::Ready,
            stack_size: config::STACK_SIZE,
        }
    }
}

/// A thread released once per period by its alarm.
pub struct PeriodicThread {
    thread: Arc<Thread>,
    sem: Arc<Semaphore>,
    alarm: Arc<Alarm>,
}

impl PeriodicThread {
    pub fn new(period: Microsecond, entry: EntryFn, arg: usize) -> Result<Self, KernError> {
        Self::with_configuration(PeriodicConfiguration::new(period), entry, arg)
    }

    pub fn with_configuration(
        conf: PeriodicConfiguration,
        entry: EntryFn,
        arg: usize,
    ) -> Result<Self, KernError> {
        let deadline = if conf.deadline == SAME {
            conf.period
        } else {
            conf.deadline
        };
        let crit = Criterion::real_time(conf.policy, deadline, conf.period, conf.capacity, conf.cpu);

        let thread = Thread::spawn(
            Configuration {
                state: State::Suspended,
                criterion: crit,
                task: None,
                stack_size: conf.stack_size,
            },
            entry,
            arg,
        )?;

        let sem = Semaphore::new(0);
        let handler = release_handler(&thread, &sem, crit.dynamic());
        let alarm = Alarm::new(conf.period, handler, conf.times);

        if config::MONITORED {
            bookkeeping(&thread, &crit, conf.period, conf.times);
        }

        let pt = Self { thread, sem, alarm };
        // The first job is dispatched by the resume, in step with the
        // alarm.
        if conf.state == State::Ready || conf.state == State::Running {
            pt.thread.resume();
        }
        Ok(pt)
    }

    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    pub fn period(&self) -> Microsecond {
        self.alarm.period()
    }

    pub fn set_period(&self, period: Microsecond) {
        self.alarm.set_period(period);
    }

    /// Activations the alarm still owes.
    pub fn remaining(&self) -> u64 {
        self.alarm.remaining()
    }

    /// Job boundary: close the statistics of the finished job and block
    /// until the next release. Answers whether another job is due.
    pub fn wait_next(&self) -> bool {
        if config::MONITORED {
            monitor::job_boundary(&self.thread, self.alarm.remaining(), cpu::id());
        }

        if self.alarm.remaining() != 0 {
            self.sem.p();
        }
        self.alarm.remaining() != 0
    }
}

// ============================================================================
// Real-Time Thread
// ============================================================================

/// Creation parameters of a real-time thread.
#[derive(Debug, Clone, Copy)]
pub struct RtConfiguration {
    pub deadline: Microsecond,
    /// `SAME` takes the deadline.
    pub period: Microsecond,
    pub capacity: Microsecond,
    /// `NOW` starts the periodic release immediately.
    pub activation: Microsecond,
    pub times: u64,
    pub cpu: u32,
    pub policy: Policy,
    pub stack_size: usize,
}

impl RtConfiguration {
    pub fn new(deadline: Microsecond) -> Self {
        Self {
            deadline,
            period: SAME,
            capacity: 0,
            activation: NOW,
            times: INFINITE,
            cpu: ANY,
            policy: config::DEFAULT_POLICY,
            stack_size: config::STACK_SIZE,
        }
    }
}

/// A periodic thread with an explicit activation point: it waits on its
/// semaphore for a one-shot alarm which, on firing, becomes the periodic
/// alarm with the configured period.
pub struct RtThread {
    inner: PeriodicThread,
}

impl RtThread {
    pub fn new(conf: RtConfiguration, entry: EntryFn, arg: usize) -> Result<Self, KernError> {
        let period = if conf.period == SAME {
            conf.deadline
        } else {
            conf.period
        };
        let mut crit =
            Criterion::real_time(conf.policy, conf.deadline, period, conf.capacity, conf.cpu);

        let thread = Thread::spawn(
            Configuration {
                state: State::Suspended,
                criterion: crit,
                task: None,
                stack_size: conf.stack_size,
            },
            entry,
            arg,
        )?;

        let sem = Semaphore::new(0);
        let alarm = if conf.activation != NOW {
            if crit.dynamic() {
                // Until the first release re-ranks it, the thread enters
                // at the top of the periodic band.
                crit.set_rank(criterion::PERIODIC + 1);
                thread.set_criterion(crit);
            }
            Alarm::new(
                conf.activation,
                AlarmHandler::Activate {
                    thread: thread.id(),
                    sem: Arc::clone(&sem),
                    period,
                    times: conf.times,
                },
                1,
            )
        } else {
            let handler = release_handler(&thread, &sem, crit.dynamic());
            Alarm::new(period, handler, conf.times)
        };

        if config::MONITORED {
            bookkeeping(&thread, &crit, period, conf.times);
        }

        let rt = Self {
            inner: PeriodicThread { thread, sem, alarm },
        };
        rt.inner.thread.resume();
        Ok(rt)
    }

    pub fn thread(&self) -> &Arc<Thread> {
        &self.inner.thread
    }

    pub fn period(&self) -> Microsecond {
        self.inner.period()
    }

    pub fn remaining(&self) -> u64 {
        self.inner.remaining()
    }

    pub fn wait_next(&self) -> bool {
        self.inner.wait_next()
    }
}

fn release_handler(thread: &Arc<Thread>, sem: &Arc<Semaphore>, dynamic: bool) -> AlarmHandler {
    if dynamic {
        AlarmHandler::UpdateAndRelease(thread.id(), Arc::clone(sem))
    } else {
        AlarmHandler::SemaphoreV(Arc::clone(sem))
    }
}

fn bookkeeping(thread: &Arc<Thread>, crit: &Criterion, period: Microsecond, times: u64) {
    let ts = cpu::time_stamp();
    let cpu_slot = if crit.policy().partitioned() {
        crit.queue()
    } else {
        0
    };
    monitor::register_periodic(cpu_slot, period, ts);

    let mut stats = thread.stats_guard();
    stats.last_execution = ts;
    if times != INFINITE {
        stats.configured_times = times;
    }
}
