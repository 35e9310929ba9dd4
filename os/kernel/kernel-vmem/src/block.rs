use crate::state::{BlockState, MemoryAttribute, MemoryPermission, MemoryState};
use kernel_info::memory::PAGE_SHIFT;
use kernel_memory_addresses::{PageRange, VirtualAddress};

/// One ledger entry: a page range with homogeneous [`BlockState`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryBlock {
    pub base: VirtualAddress,
    pub pages: u64,
    pub state: BlockState,
}

impl MemoryBlock {
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.pages << PAGE_SHIFT
    }

    /// First address past the block.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size())
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, address: VirtualAddress) -> bool {
        address.as_u64() >= self.base.as_u64() && address.as_u64() < self.end().as_u64()
    }

    #[must_use]
    pub const fn range(&self) -> PageRange {
        PageRange::from_pages(self.base, self.pages)
    }

    #[must_use]
    pub const fn info(&self) -> MemoryInfo {
        MemoryInfo {
            address: self.base.as_u64(),
            size: self.size(),
            state: self.state.state,
            permission: self.state.permission,
            attribute: self.state.attribute,
        }
    }
}

/// Result of a memory query, as reported to the guest.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryInfo {
    pub address: u64,
    pub size: u64,
    pub state: MemoryState,
    pub permission: MemoryPermission,
    pub attribute: MemoryAttribute,
}

impl MemoryInfo {
    /// Size of the guest `MemoryInfo` structure.
    pub const GUEST_SIZE: usize = 0x28;

    /// Serializes into the guest layout: address, size, state, attribute,
    /// permission, IPC and device reference counts, padding.
    #[must_use]
    pub fn to_guest_bytes(&self) -> [u8; Self::GUEST_SIZE] {
        let mut out = [0u8; Self::GUEST_SIZE];
        out[0x00..0x08].copy_from_slice(&self.address.to_le_bytes());
        out[0x08..0x10].copy_from_slice(&self.size.to_le_bytes());
        out[0x10..0x14].copy_from_slice(&self.state.guest_value().to_le_bytes());
        out[0x14..0x18].copy_from_slice(&self.attribute.into_bits().to_le_bytes());
        out[0x18..0x1C].copy_from_slice(&self.permission.bits().to_le_bytes());
        out
    }
}
