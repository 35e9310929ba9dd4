//! # Guest Memory Layout
//!
//! The guest uses a 39-bit address space. Regions are placed in a fixed order
//! above the code region; see [`crate::memory`] constants for their sizes.
//!
//! ```text
//! ADDRESS_SPACE_START ┌───────────────────────┐ 0x0000_0000_0800_0000
//!                     │  Code (static image)  │
//!                     ├───────────────────────┤
//!                     │  Alias                │ ALIAS_REGION_SIZE
//!                     ├───────────────────────┤
//!                     │  Heap                 │ HEAP_REGION_SIZE
//!                     ├───────────────────────┤
//!                     │  Stack                │ STACK_REGION_SIZE
//!                     ├───────────────────────┤
//!                     │  TLS / IO             │ TLS_IO_REGION_SIZE
//!                     ├───────────────────────┤
//!                     │  (unused)             │
//! ADDRESS_SPACE_END   └───────────────────────┘ 0x0000_0080_0000_0000
//! ```

/// Guest page size in bytes.
pub const PAGE_SIZE: u64 = 0x1000;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Heap sizes must be a multiple of this.
pub const HEAP_SIZE_ALIGNMENT: u64 = 0x20_0000;

/// First usable guest virtual address.
pub const ADDRESS_SPACE_START: u64 = 0x800_0000;

/// One past the last usable guest virtual address.
pub const ADDRESS_SPACE_END: u64 = 1 << 39;

/// Size reserved for the static code image at the bottom of the address space.
pub const CODE_REGION_SIZE: u64 = 0x1_0000_0000;

/// Size of the alias region used by IPC buffer mappings.
pub const ALIAS_REGION_SIZE: u64 = 0x10_0000_0000;

/// Size of the heap region.
pub const HEAP_REGION_SIZE: u64 = 0x1_8000_0000;

/// Size of the stack region.
pub const STACK_REGION_SIZE: u64 = 0x8000_0000;

/// Size of the thread-local storage and IO region.
pub const TLS_IO_REGION_SIZE: u64 = 0x10_0000_0000;

/// Default amount of guest DRAM backed by host memory.
pub const DEFAULT_DRAM_SIZE: u64 = 64 * 1024 * 1024;

/// Default number of ledger nodes in the large (system) slab pool.
pub const DEFAULT_LARGE_SLAB_BLOCKS: usize = 8192;

/// Default number of ledger nodes in the small (application) slab pool.
pub const DEFAULT_SMALL_SLAB_BLOCKS: usize = 2048;

/// Upper bound of ledger nodes consumed by one insertion (two boundary splits).
pub const MAX_BLOCKS_NEEDED_FOR_INSERTION: usize = 2;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(ADDRESS_SPACE_START.is_multiple_of(PAGE_SIZE));
    assert!(HEAP_SIZE_ALIGNMENT.is_multiple_of(PAGE_SIZE));
    assert!(DEFAULT_DRAM_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(
        ADDRESS_SPACE_START
            + CODE_REGION_SIZE
            + ALIAS_REGION_SIZE
            + HEAP_REGION_SIZE
            + STACK_REGION_SIZE
            + TLS_IO_REGION_SIZE
            <= ADDRESS_SPACE_END
    );
};

/// Whether `value` is a multiple of [`PAGE_SIZE`].
#[inline]
#[must_use]
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Number of whole pages in `size` bytes.
#[inline]
#[must_use]
pub const fn pages_in(size: u64) -> u64 {
    size >> PAGE_SHIFT
}
