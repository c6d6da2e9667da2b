//! Common types used across Strand
//!
//! This module defines shared types to avoid circular dependencies.

use crate::config;

/// Thread identifier
///
/// Ids `1..=CPUS` are reserved boot sentinels (`cpu id + 1`, see
/// `this_thread::id`); the allocator for real threads starts above them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId {
    pub const NULL: Self = Self(0);

    /// First id handed out to an actual thread.
    pub const FIRST: u64 = config::CPUS as u64 + 1;

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True for the boot-time sentinel range.
    pub fn is_boot_sentinel(self) -> bool {
        self.0 >= 1 && self.0 <= config::CPUS as u64
    }
}

/// Task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub const NULL: Self = Self(0);
    pub const KERNEL: Self = Self(1);
}

/// Hardware core number, `0..CPUS`.
pub type CpuId = u32;

/// Interrupt vector number.
pub type InterruptId = u32;

/// Microseconds, the time unit of the public API.
pub type Microsecond = u64;

/// Timer ticks at `config::FREQUENCY`.
pub type Tick = u64;

/// Monotonic time-stamp counter value.
pub type TimeStamp = u64;

/// Errors reported by fallible kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernError {
    /// Heap or segment allocation failed.
    OutOfMemory,
    /// Subsystem not initialized yet.
    NotReady,
    /// The object is in use (e.g. destroying a RUNNING thread).
    Busy,
    /// Argument or state does not admit the operation.
    Invalid,
    /// A timed blocking operation elapsed without a wakeup.
    Timeout,
}

/// Convert microseconds to timer ticks, rounding up.
pub const fn us_to_ticks(us: Microsecond) -> Tick {
    (us * config::FREQUENCY + 999_999) / 1_000_000
}

/// Convert timer ticks back to microseconds.
pub const fn ticks_to_us(ticks: Tick) -> Microsecond {
    ticks * 1_000_000 / config::FREQUENCY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_conversion() {
        // 1 kHz: one tick per millisecond.
        assert_eq!(us_to_ticks(1_000), 1);
        assert_eq!(us_to_ticks(1_500), 2); // rounds up
        assert_eq!(us_to_ticks(0), 0);
        assert_eq!(ticks_to_us(10), 10_000);
    }

    #[test]
    fn test_boot_sentinels() {
        assert!(ThreadId(1).is_boot_sentinel());
        assert!(!ThreadId(ThreadId::FIRST).is_boot_sentinel());
        assert!(!ThreadId::NULL.is_boot_sentinel());
    }
}
