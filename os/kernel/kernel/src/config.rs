use kernel_info::memory::{DEFAULT_DRAM_SIZE, DEFAULT_LARGE_SLAB_BLOCKS, DEFAULT_SMALL_SLAB_BLOCKS};
use kernel_info::scheduling::{DEFAULT_HANDLE_TABLE_SIZE, DEFAULT_PREEMPTION_QUANTUM};
use std::time::Duration;
use utils_accessors_derive::Accessors;

/// Tunables fixed at boot.
///
/// ```
/// # use kernel::KernelConfig;
/// # use std::time::Duration;
/// let config = KernelConfig::default()
///     .with_preemption_quantum(Duration::from_millis(5))
///     .with_run_preemption_thread(false);
/// assert_eq!(config.preemption_quantum(), Duration::from_millis(5));
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Accessors)]
pub struct KernelConfig {
    /// Interval of the preemption thread's forced rotation.
    preemption_quantum: Duration,
    /// Whether boot starts the preemption thread. Tests switch it off and
    /// call [`KernelContext::preemption_tick`](crate::KernelContext::preemption_tick).
    run_preemption_thread: bool,
    /// Bytes of emulated guest DRAM.
    dram_size: u64,
    /// Ledger nodes reserved for system processes.
    large_slab_blocks: usize,
    /// Ledger nodes reserved for applications.
    small_slab_blocks: usize,
    /// Handle table capacity of every process.
    handle_table_size: usize,
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        preemption_quantum: DEFAULT_PREEMPTION_QUANTUM,
        run_preemption_thread: true,
        dram_size: DEFAULT_DRAM_SIZE,
        large_slab_blocks: DEFAULT_LARGE_SLAB_BLOCKS,
        small_slab_blocks: DEFAULT_SMALL_SLAB_BLOCKS,
        handle_table_size: DEFAULT_HANDLE_TABLE_SIZE,
    };
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_kernel_constants() {
        let config = KernelConfig::default();
        assert_eq!(config.preemption_quantum(), Duration::from_millis(10));
        assert!(config.run_preemption_thread());
        assert_eq!(config.dram_size(), 64 * 1024 * 1024);
        assert_eq!(config.handle_table_size(), 1024);
    }

    #[test]
    fn setters_chain() {
        let mut config = KernelConfig::default();
        config.set_small_slab_blocks(16).set_dram_size(1 << 20);
        assert_eq!(config.small_slab_blocks(), 16);
        assert_eq!(config.dram_size(), 1 << 20);
        assert_eq!(config.large_slab_blocks(), DEFAULT_LARGE_SLAB_BLOCKS);
    }
}
