//! # Guest-Visible Result Codes
//!
//! Supervisor calls report failure through a 32-bit result word. The low nine
//! bits hold the module (always `1`, the kernel) and the remaining bits hold the
//! description. Success is the all-zero word and is not a variant here; APIs
//! return `Result<T, KernelResult>` and [`result_code`] flattens that into the
//! register value.

/// Module number of the kernel in the result word.
pub const KERNEL_MODULE: u32 = 1;

const fn make(description: u32) -> u32 {
    KERNEL_MODULE | (description << 9)
}

/// A guest-visible kernel failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[repr(u32)]
pub enum KernelResult {
    #[error("the thread is being terminated")]
    ThreadTerminating = make(59),
    #[error("invalid size")]
    InvalidSize = make(101),
    #[error("invalid address")]
    InvalidAddress = make(102),
    #[error("out of kernel resources")]
    OutOfResource = make(103),
    #[error("out of memory")]
    OutOfMemory = make(104),
    #[error("handle table is full")]
    HandleTableFull = make(105),
    #[error("invalid memory state")]
    InvalidMemoryState = make(106),
    #[error("invalid permission")]
    InvalidPermission = make(108),
    #[error("invalid memory range")]
    InvalidMemoryRange = make(110),
    #[error("invalid priority")]
    InvalidPriority = make(112),
    #[error("invalid core id")]
    InvalidCoreId = make(113),
    #[error("invalid handle")]
    InvalidHandle = make(114),
    #[error("copy from or to guest memory failed")]
    UserCopyFailed = make(115),
    #[error("invalid combination")]
    InvalidCombination = make(116),
    #[error("timed out")]
    TimedOut = make(117),
    #[error("cancelled")]
    Cancelled = make(118),
    #[error("maximum exceeded")]
    MaximumExceeded = make(119),
    #[error("invalid enum value")]
    InvalidEnumValue = make(120),
    #[error("not found")]
    NotFound = make(121),
    #[error("invalid thread")]
    InvalidThread = make(122),
    #[error("invalid state")]
    InvalidState = make(125),
    #[error("reserved value")]
    ReservedValue = make(126),
    #[error("resource limit exceeded")]
    ResourceLimitExceeded = make(132),
}

impl KernelResult {
    /// The raw 32-bit result word.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// The module part of the result word.
    #[inline]
    #[must_use]
    pub const fn module(self) -> u32 {
        self.code() & 0x1FF
    }

    /// The description part of the result word.
    #[inline]
    #[must_use]
    pub const fn description(self) -> u32 {
        (self.code() >> 9) & 0x1FFF
    }
}

/// Flattens an operation outcome into the guest register value.
#[inline]
#[must_use]
pub fn result_code<T>(result: &Result<T, KernelResult>) -> u32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}
