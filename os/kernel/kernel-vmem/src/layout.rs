use crate::state::MemoryState;
use kernel_info::memory::{
    ADDRESS_SPACE_END, ADDRESS_SPACE_START, ALIAS_REGION_SIZE, CODE_REGION_SIZE,
    HEAP_REGION_SIZE, STACK_REGION_SIZE, TLS_IO_REGION_SIZE,
};
use kernel_memory_addresses::{PageRange, VirtualAddress};

/// Fixed region placement inside a process address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AddressSpaceLayout {
    pub address_space: PageRange,
    pub code: PageRange,
    pub alias: PageRange,
    pub heap: PageRange,
    pub stack: PageRange,
    pub tls_io: PageRange,
}

impl AddressSpaceLayout {
    /// The 39-bit layout: code at the bottom, then alias, heap, stack and TLS/IO.
    #[must_use]
    pub const fn standard() -> Self {
        const fn region(start: u64, size: u64) -> PageRange {
            PageRange::from_pages(
                VirtualAddress::new(start),
                size >> kernel_info::memory::PAGE_SHIFT,
            )
        }
        let code = ADDRESS_SPACE_START;
        let alias = code + CODE_REGION_SIZE;
        let heap = alias + ALIAS_REGION_SIZE;
        let stack = heap + HEAP_REGION_SIZE;
        let tls_io = stack + STACK_REGION_SIZE;
        Self {
            address_space: region(ADDRESS_SPACE_START, ADDRESS_SPACE_END - ADDRESS_SPACE_START),
            code: region(code, CODE_REGION_SIZE),
            alias: region(alias, ALIAS_REGION_SIZE),
            heap: region(heap, HEAP_REGION_SIZE),
            stack: region(stack, STACK_REGION_SIZE),
            tls_io: region(tls_io, TLS_IO_REGION_SIZE),
        }
    }

    /// Whether `range` may hold a block in `state`.
    ///
    /// Heap blocks live in the heap region and IPC buffers in the alias
    /// region. Everything else may go anywhere in the address space that is
    /// neither heap nor alias.
    #[must_use]
    pub const fn is_valid_region_for_state(&self, state: MemoryState, range: &PageRange) -> bool {
        match state {
            MemoryState::Unmapped | MemoryState::Inaccessible => false,
            MemoryState::Heap => self.heap.contains_range(range),
            MemoryState::IpcBuffer0 | MemoryState::IpcBuffer1 | MemoryState::IpcBuffer3 => {
                self.alias.contains_range(range)
            }
            _ => {
                self.address_space.contains_range(range)
                    && !self.heap.overlaps(range)
                    && !self.alias.overlaps(range)
            }
        }
    }
}

impl Default for AddressSpaceLayout {
    fn default() -> Self {
        Self::standard()
    }
}
