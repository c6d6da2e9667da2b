//! Monitor
//!
//! Lightweight statistics side-channel. Dispatch and `wait_next` are the
//! only capture points: dispatch charges execution and idle time and rolls
//! real-time accounting over at hyperperiod boundaries, `wait_next`
//! closes a job and counts missed deadlines. Samples accumulate in
//! per-core fixed-capacity batches that are drained at shutdown; nothing
//! on the hot path allocates.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config;
use crate::counters;
use crate::cpu;
use crate::criterion;
use crate::thread::Thread;
use crate::types::{CpuId, ThreadId, Tick, TimeStamp};

// ============================================================================
// Per-thread statistics
// ============================================================================

/// Execution statistics kept per thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    /// Time executed in the current job, microseconds.
    pub execution_time: u64,
    /// Stamp of the last charge point.
    pub last_execution: TimeStamp,
    /// Jobs completed in the current hyperperiod.
    pub jobs: u64,
    /// Execution time accumulated over those jobs.
    pub accumulated_execution_time: u64,
    /// Hyperperiod this thread last rolled over at.
    pub hyperperiod_count: u64,
    /// Jobs of the previous hyperperiod.
    pub hyperperiod_jobs: u64,
    /// Average execution time of the previous hyperperiod.
    pub hyperperiod_average_execution_time: u64,
    /// Activations the periodic machinery was configured with.
    pub configured_times: u64,
    /// Deadline misses observed so far.
    pub missed_deadlines: u64,
}

// ============================================================================
// Per-core accounting
// ============================================================================

static HYPERPERIOD: [AtomicU64; config::CPUS] = [const { AtomicU64::new(0) }; config::CPUS];
static LAST_HYPERPERIOD: [AtomicU64; config::CPUS] = [const { AtomicU64::new(0) }; config::CPUS];
static HYPERPERIOD_COUNT: [AtomicU64; config::CPUS] = [const { AtomicU64::new(0) }; config::CPUS];
static IDLE_TIME: [AtomicU64; config::CPUS] = [const { AtomicU64::new(0) }; config::CPUS];
static LAST_IDLE: [AtomicU64; config::CPUS] = [const { AtomicU64::new(0) }; config::CPUS];
static HYPERPERIOD_IDLE_TIME: [AtomicU64; config::CPUS] = [const { AtomicU64::new(0) }; config::CPUS];

// ============================================================================
// Sample batches
// ============================================================================

/// What a sample records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Dispatch,
    JobDone,
    DeadlineMiss,
}

#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub ts: TimeStamp,
    pub event: Event,
    pub thread: ThreadId,
    pub value: u64,
}

type Batch = heapless::Vec<Sample, { config::MONITOR_BATCH }>;

static BATCHES: [Mutex<Batch>; config::CPUS] =
    [const { Mutex::new(heapless::Vec::new()) }; config::CPUS];

fn record(cpu: CpuId, sample: Sample) {
    let mut batch = BATCHES[cpu as usize].lock();
    if batch.push(sample).is_err() {
        // Batch full; drop the oldest half rather than the new sample.
        let keep: Batch = batch.iter().skip(batch.len() / 2).copied().collect();
        *batch = keep;
        let _ = batch.push(sample);
    }
}

// ============================================================================
// Capture points
// ============================================================================

/// Dispatch hook: charge `prev`, stamp `next`, account idle time and roll
/// real-time statistics over at hyperperiod boundaries.
pub fn run(prev: &Arc<Thread>, next: &Arc<Thread>, cpu: CpuId) {
    let ts = cpu::time_stamp();
    let prev_rank = prev.criterion().rank();
    let next_rank = next.criterion().rank();

    if prev_rank == criterion::IDLE {
        let last = LAST_IDLE[cpu as usize].load(Ordering::Relaxed);
        if last != 0 {
            IDLE_TIME[cpu as usize].fetch_add(ts.saturating_sub(last), Ordering::Relaxed);
        }
    }
    if next_rank == criterion::IDLE {
        LAST_IDLE[cpu as usize].store(ts, Ordering::Relaxed);
    }

    {
        let mut stats = prev.stats_guard();
        if prev_rank != criterion::IDLE {
            stats.execution_time += ts.saturating_sub(stats.last_execution);
        }
        if criterion::is_realtime(prev_rank) {
            rollover(&mut stats, cpu);
        }
        let execution = stats.execution_time;
        drop(stats);
        record(
            cpu,
            Sample {
                ts,
                event: Event::Dispatch,
                thread: prev.id(),
                value: execution,
            },
        );
    }

    let mut stats = next.stats_guard();
    if next_rank != criterion::IDLE {
        stats.last_execution = ts;
    }
    if criterion::is_realtime(next_rank) {
        rollover(&mut stats, cpu);
    }
}

fn rollover(stats: &mut Statistics, cpu: CpuId) {
    let count = HYPERPERIOD_COUNT[cpu as usize].load(Ordering::Relaxed);
    if stats.hyperperiod_count < count {
        if stats.jobs > 0 {
            stats.hyperperiod_average_execution_time =
                stats.accumulated_execution_time / stats.jobs;
        }
        stats.hyperperiod_jobs = stats.jobs;
        stats.accumulated_execution_time = 0;
        stats.jobs = 0;
        stats.hyperperiod_count = count;
    }
}

/// Job boundary hook from `wait_next`: close the running job and count
/// missed deadlines as configured − remaining − completed.
pub fn job_boundary(thread: &Arc<Thread>, remaining: u64, cpu: CpuId) {
    let ts = cpu::time_stamp();
    let mut stats = thread.stats_guard();

    stats.execution_time += ts.saturating_sub(stats.last_execution);
    stats.last_execution = ts;
    stats.accumulated_execution_time += stats.execution_time;
    stats.jobs += 1;
    let execution = stats.execution_time;
    stats.execution_time = 0;

    if stats.configured_times != 0 && stats.configured_times != u64::MAX {
        let missed = stats
            .configured_times
            .saturating_sub(remaining)
            .saturating_sub(stats.jobs);
        if missed > stats.missed_deadlines {
            counters::DEADLINE_MISSES.add(missed - stats.missed_deadlines);
            record(
                cpu,
                Sample {
                    ts,
                    event: Event::DeadlineMiss,
                    thread: thread.id(),
                    value: missed,
                },
            );
        }
        stats.missed_deadlines = missed;
    }
    drop(stats);

    record(
        cpu,
        Sample {
            ts,
            event: Event::JobDone,
            thread: thread.id(),
            value: execution,
        },
    );
}

/// Fold a new periodic thread into its core's hyperperiod (lcm of the
/// co-scheduled periods).
pub fn register_periodic(cpu: CpuId, period: Tick, now: TimeStamp) {
    let slot = cpu as usize;
    if LAST_HYPERPERIOD[slot].load(Ordering::Relaxed) == 0 {
        LAST_HYPERPERIOD[slot].store(now.max(1), Ordering::Relaxed);
        HYPERPERIOD[slot].store(period, Ordering::Relaxed);
    } else {
        let current = HYPERPERIOD[slot].load(Ordering::Relaxed);
        HYPERPERIOD[slot].store(lcm(current, period), Ordering::Relaxed);
    }
}

/// Advance hyperperiod accounting; called from the tick path of the alarm
/// core.
pub fn tick_hyperperiod(cpu: CpuId, now: TimeStamp) {
    let slot = cpu as usize;
    let hyper = HYPERPERIOD[slot].load(Ordering::Relaxed);
    if hyper == 0 {
        return;
    }
    let last = LAST_HYPERPERIOD[slot].load(Ordering::Relaxed);
    if now.saturating_sub(last) >= hyper {
        LAST_HYPERPERIOD[slot].store(now, Ordering::Relaxed);
        HYPERPERIOD_COUNT[slot].fetch_add(1, Ordering::Relaxed);
        HYPERPERIOD_IDLE_TIME[slot].store(IDLE_TIME[slot].load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

/// Idle time accumulated on a core so far, microseconds.
pub fn idle_time(cpu: CpuId) -> u64 {
    IDLE_TIME[cpu as usize].load(Ordering::Relaxed)
}

pub fn hyperperiod_count(cpu: CpuId) -> u64 {
    HYPERPERIOD_COUNT[cpu as usize].load(Ordering::Relaxed)
}

/// Drain every core's batch; used at shutdown and by tests.
pub fn process_batch() -> Vec<Sample> {
    let mut all = Vec::new();
    for batch in BATCHES.iter() {
        let mut b = batch.lock();
        all.extend(b.iter().copied());
        b.clear();
    }
    all
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn lcm(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 {
        a.max(b)
    } else {
        a / gcd(a, b) * b
    }
}

#[cfg(test)]
pub(crate) fn reset() {
    for slot in 0..config::CPUS {
        HYPERPERIOD[slot].store(0, Ordering::Relaxed);
        LAST_HYPERPERIOD[slot].store(0, Ordering::Relaxed);
        HYPERPERIOD_COUNT[slot].store(0, Ordering::Relaxed);
        IDLE_TIME[slot].store(0, Ordering::Relaxed);
        LAST_IDLE[slot].store(0, Ordering::Relaxed);
        HYPERPERIOD_IDLE_TIME[slot].store(0, Ordering::Relaxed);
        BATCHES[slot].lock().clear();
    }
}
