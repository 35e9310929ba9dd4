//! # Scheduling Constants

use core::time::Duration;

/// Number of emulated CPU cores.
pub const CPU_CORES_COUNT: usize = 4;

/// Number of distinct guest thread priorities. Priority `0` is the highest.
pub const PRIORITIES_COUNT: usize = 64;

/// Highest (numerically lowest) priority a guest thread may hold.
pub const HIGHEST_THREAD_PRIORITY: u8 = 0;

/// Lowest (numerically highest) priority a guest thread may hold.
pub const LOWEST_THREAD_PRIORITY: u8 = (PRIORITIES_COUNT - 1) as u8;

/// Priority reported for a core that has no thread to run.
///
/// Ranks below every guest priority; no thread can ever be assigned it.
pub const IDLE_PRIORITY: u8 = PRIORITIES_COUNT as u8;

/// Threads above this priority are never moved between cores to balance load.
pub const LOAD_BALANCING_MIN_PRIORITY: u8 = 2;

/// `SleepThread` argument yielding and pulling over a waiting thread of another core.
pub const YIELD_WITH_LOAD_BALANCING: i64 = -1;

/// `SleepThread` argument giving the core up to any thread, whatever its priority.
pub const YIELD_TO_ANY_THREAD: i64 = -2;

/// Default time slice after which equal-priority threads are rotated.
pub const DEFAULT_PREEMPTION_QUANTUM: Duration = Duration::from_millis(10);

/// Maximum number of handles a single wait may reference.
pub const MAX_WAIT_OBJECTS: usize = 64;

/// Pseudo handle that always refers to the calling thread.
pub const CURRENT_THREAD_HANDLE: u32 = 0xFFFF_8000;

/// Pseudo handle that always refers to the calling thread's process.
pub const CURRENT_PROCESS_HANDLE: u32 = 0xFFFF_8001;

/// Default number of entries in a process handle table.
pub const DEFAULT_HANDLE_TABLE_SIZE: usize = 1024;

/// Core id argument selecting the process default core.
pub const CORE_ID_PROCESS_DEFAULT: i32 = -2;

/// Core id argument keeping the thread's current preferred core.
pub const CORE_ID_NO_UPDATE: i32 = -3;

/// A core mask with every emulated core set.
pub const ALL_CORES_MASK: u64 = (1 << CPU_CORES_COUNT) - 1;

/// A priority mask allowing every guest priority.
pub const ALL_PRIORITIES_MASK: u64 = u64::MAX;

const _: () = {
    assert!(CPU_CORES_COUNT <= 64);
    assert!(PRIORITIES_COUNT <= 64);
    assert!(IDLE_PRIORITY > LOWEST_THREAD_PRIORITY);
};

/// Returns the single-bit mask for `core`.
#[inline]
#[must_use]
pub const fn core_bit(core: usize) -> u64 {
    1 << core
}

/// Whether `core` names one of the emulated cores.
#[inline]
#[must_use]
pub const fn is_valid_core(core: usize) -> bool {
    core < CPU_CORES_COUNT
}

/// Whether `priority` is a priority a guest thread may hold.
#[inline]
#[must_use]
pub const fn is_valid_priority(priority: u8) -> bool {
    (priority as usize) < PRIORITIES_COUNT
}

/// Returns the highest core index set in `mask`, if any.
#[inline]
#[must_use]
pub const fn highest_core_in_mask(mask: u64) -> Option<usize> {
    let mask = mask & ALL_CORES_MASK;
    if mask == 0 {
        None
    } else {
        Some(63 - mask.leading_zeros() as usize)
    }
}
