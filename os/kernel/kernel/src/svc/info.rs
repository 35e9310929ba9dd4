use crate::process::ProcessRecord;
use crate::resource_limit::LimitableResource;
use kernel_info::KernelResult;

/// Queries answered by `GetInfo`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InfoType {
    CoreMask = 0,
    PriorityMask = 1,
    AliasRegionAddress = 2,
    AliasRegionSize = 3,
    HeapRegionAddress = 4,
    HeapRegionSize = 5,
    /// Physical memory the process may use at most.
    TotalMemorySize = 6,
    UsedMemorySize = 7,
    AddressSpaceAddress = 12,
    AddressSpaceSize = 13,
    StackRegionAddress = 14,
    StackRegionSize = 15,
    ProgramId = 18,
}

impl TryFrom<u32> for InfoType {
    type Error = KernelResult;

    fn try_from(value: u32) -> Result<Self, KernelResult> {
        Ok(match value {
            0 => Self::CoreMask,
            1 => Self::PriorityMask,
            2 => Self::AliasRegionAddress,
            3 => Self::AliasRegionSize,
            4 => Self::HeapRegionAddress,
            5 => Self::HeapRegionSize,
            6 => Self::TotalMemorySize,
            7 => Self::UsedMemorySize,
            12 => Self::AddressSpaceAddress,
            13 => Self::AddressSpaceSize,
            14 => Self::StackRegionAddress,
            15 => Self::StackRegionSize,
            18 => Self::ProgramId,
            _ => return Err(KernelResult::InvalidEnumValue),
        })
    }
}

impl InfoType {
    pub(crate) fn query(self, process: &ProcessRecord, dram_size: u64) -> u64 {
        let layout = process.memory.layout();
        match self {
            Self::CoreMask => process.core_mask,
            Self::PriorityMask => process.priority_mask,
            Self::AliasRegionAddress => layout.alias.start().as_u64(),
            Self::AliasRegionSize => layout.alias.size(),
            Self::HeapRegionAddress => layout.heap.start().as_u64(),
            Self::HeapRegionSize => layout.heap.size(),
            Self::TotalMemorySize => process
                .limit
                .limit(LimitableResource::PhysicalMemory)
                .min(dram_size),
            Self::UsedMemorySize => process.memory.used_memory(),
            Self::AddressSpaceAddress => layout.address_space.start().as_u64(),
            Self::AddressSpaceSize => layout.address_space.size(),
            Self::StackRegionAddress => layout.stack.start().as_u64(),
            Self::StackRegionSize => layout.stack.size(),
            Self::ProgramId => process.title_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_ids_are_rejected() {
        assert_eq!(InfoType::try_from(18), Ok(InfoType::ProgramId));
        assert_eq!(InfoType::try_from(8), Err(KernelResult::InvalidEnumValue));
        assert_eq!(InfoType::try_from(u32::MAX), Err(KernelResult::InvalidEnumValue));
    }
}
