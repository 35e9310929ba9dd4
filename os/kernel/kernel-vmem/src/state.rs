//! Memory state, permission and attribute tags carried by every ledger block.

use bitfield_struct::bitfield;

/// Capability flags encoded in the upper bits of a [`MemoryState`] word.
///
/// | Bits  | Field |
/// |-------|-------|
/// | 0–7   | `kind`: the state id reported to the guest |
/// | 8     | `permission_change_allowed` (`SetMemoryPermission`) |
/// | 9     | `force_read_writable_by_debug` |
/// | 10–12 | IPC send types 0, 3 and 1 |
/// | 14    | `process_permission_change_allowed` |
/// | 15    | `map_allowed` (`MapMemory` source) |
/// | 16    | `unmap_process_code_memory_allowed` |
/// | 17    | `transfer_memory_allowed` |
/// | 18    | `query_physical_address_allowed` |
/// | 19–20 | device mapping (any / aligned) |
/// | 21    | `ipc_buffer_allowed` |
/// | 22    | `is_pool_allocated` |
/// | 23    | `map_process_allowed` |
/// | 24    | `attribute_change_allowed` |
/// | 25    | `code_memory_allowed` |
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MemoryStateFlags {
    pub kind: u8,
    pub permission_change_allowed: bool,
    pub force_read_writable_by_debug: bool,
    pub ipc_send_type0: bool,
    pub ipc_send_type3: bool,
    pub ipc_send_type1: bool,
    __reserved13: bool,
    pub process_permission_change_allowed: bool,
    pub map_allowed: bool,
    pub unmap_process_code_memory_allowed: bool,
    pub transfer_memory_allowed: bool,
    pub query_physical_address_allowed: bool,
    pub map_device_allowed: bool,
    pub map_device_aligned_allowed: bool,
    pub ipc_buffer_allowed: bool,
    pub is_pool_allocated: bool,
    pub map_process_allowed: bool,
    pub attribute_change_allowed: bool,
    pub code_memory_allowed: bool,
    #[bits(6)]
    __reserved_high: u8,
}

/// What a block of guest memory is used for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MemoryState {
    Unmapped = 0x0000_0000,
    Io = 0x0000_2001,
    Normal = 0x0004_2002,
    CodeStatic = 0x00DC_7E03,
    CodeMutable = 0x03FE_BD04,
    Heap = 0x037E_BD05,
    SharedMemory = 0x0040_2006,
    ModCodeStatic = 0x00DD_7E08,
    ModCodeMutable = 0x03FF_BD09,
    IpcBuffer0 = 0x005C_3C0A,
    Stack = 0x005C_3C0B,
    ThreadLocal = 0x0040_200C,
    TransferMemoryIsolated = 0x015C_3C0D,
    TransferMemory = 0x005C_380E,
    ProcessMemory = 0x0040_380F,
    Inaccessible = 0x0000_0010,
    IpcBuffer1 = 0x005C_3811,
    IpcBuffer3 = 0x004C_2812,
    KernelStack = 0x0000_2013,
    CodeReadOnly = 0x0040_2214,
    CodeWritable = 0x0040_2015,
}

impl MemoryState {
    /// The raw word, flags included.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self as u32
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> MemoryStateFlags {
        MemoryStateFlags::from_bits(self.bits())
    }

    /// The value reported by `QueryMemory`: only the low byte.
    #[inline]
    #[must_use]
    pub const fn guest_value(self) -> u32 {
        self.flags().kind() as u32
    }

    /// Whether the block is backed by guest pages.
    #[inline]
    #[must_use]
    pub const fn is_mapped(self) -> bool {
        !matches!(self, Self::Unmapped | Self::Inaccessible)
    }
}

/// Access rights of a block.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum MemoryPermission {
    #[default]
    None = 0,
    Read = 1,
    ReadWrite = 3,
    ReadExecute = 5,
}

impl MemoryPermission {
    /// Decodes a guest permission word; write-only and other combinations are rejected.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::None),
            1 => Some(Self::Read),
            3 => Some(Self::ReadWrite),
            5 => Some(Self::ReadExecute),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self as u32
    }

    #[inline]
    #[must_use]
    pub const fn can_read(self) -> bool {
        !matches!(self, Self::None)
    }

    #[inline]
    #[must_use]
    pub const fn can_write(self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

/// Attribute tags of a block.
#[bitfield(u32)]
#[derive(PartialEq, Eq, Hash)]
pub struct MemoryAttribute {
    /// Borrowed by an alias mapping; must not change state or permission.
    pub locked: bool,
    pub ipc_mapped: bool,
    pub device_mapped: bool,
    pub uncached: bool,
    #[bits(28)]
    __: u32,
}

impl MemoryAttribute {
    pub const NONE: Self = Self::new();

    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.into_bits() == 0
    }
}

/// The homogeneous state shared by every page of one ledger block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockState {
    pub state: MemoryState,
    pub permission: MemoryPermission,
    pub attribute: MemoryAttribute,
}

impl BlockState {
    pub const UNMAPPED: Self = Self::new(MemoryState::Unmapped, MemoryPermission::None);

    #[must_use]
    pub const fn new(state: MemoryState, permission: MemoryPermission) -> Self {
        Self {
            state,
            permission,
            attribute: MemoryAttribute::NONE,
        }
    }

    #[must_use]
    pub const fn with_permission(self, permission: MemoryPermission) -> Self {
        Self { permission, ..self }
    }

    #[must_use]
    pub const fn with_attribute(self, attribute: MemoryAttribute) -> Self {
        Self { attribute, ..self }
    }
}
