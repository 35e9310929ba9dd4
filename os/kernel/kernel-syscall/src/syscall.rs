/// Supervisor call numbers understood by the kernel.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Sysno {
    SetHeapSize = 0x01,
    SetMemoryPermission = 0x02,
    MapMemory = 0x04,
    UnmapMemory = 0x05,
    QueryMemory = 0x06,
    ExitProcess = 0x07,
    CreateThread = 0x08,
    StartThread = 0x09,
    ExitThread = 0x0A,
    SleepThread = 0x0B,
    GetThreadPriority = 0x0C,
    SetThreadPriority = 0x0D,
    GetThreadCoreMask = 0x0E,
    SetThreadCoreMask = 0x0F,
    GetCurrentProcessorNumber = 0x10,
    SignalEvent = 0x11,
    ClearEvent = 0x12,
    CloseHandle = 0x16,
    ResetSignal = 0x17,
    WaitSynchronization = 0x18,
    CancelSynchronization = 0x19,
    GetThreadId = 0x25,
    GetInfo = 0x29,
    SetThreadActivity = 0x32,
    CreateEvent = 0x45,
    TerminateProcess = 0x7B,
}

/// A supervisor call immediate the kernel does not implement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown supervisor call {0:#x}")]
pub struct UnknownSyscall(pub u32);

impl Sysno {
    pub const ALL: [Self; 26] = [
        Self::SetHeapSize,
        Self::SetMemoryPermission,
        Self::MapMemory,
        Self::UnmapMemory,
        Self::QueryMemory,
        Self::ExitProcess,
        Self::CreateThread,
        Self::StartThread,
        Self::ExitThread,
        Self::SleepThread,
        Self::GetThreadPriority,
        Self::SetThreadPriority,
        Self::GetThreadCoreMask,
        Self::SetThreadCoreMask,
        Self::GetCurrentProcessorNumber,
        Self::SignalEvent,
        Self::ClearEvent,
        Self::CloseHandle,
        Self::ResetSignal,
        Self::WaitSynchronization,
        Self::CancelSynchronization,
        Self::GetThreadId,
        Self::GetInfo,
        Self::SetThreadActivity,
        Self::CreateEvent,
        Self::TerminateProcess,
    ];

    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self as u32
    }

    /// Whether the call may block the calling guest thread.
    #[must_use]
    pub const fn may_block(self) -> bool {
        matches!(self, Self::SleepThread | Self::WaitSynchronization)
    }
}

impl TryFrom<u32> for Sysno {
    type Error = UnknownSyscall;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.number() == value)
            .ok_or(UnknownSyscall(value))
    }
}

impl core::fmt::Display for Sysno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_round_trip() {
        for s in Sysno::ALL {
            assert_eq!(Sysno::try_from(s.number()), Ok(s));
        }
    }

    #[test]
    fn numbers_are_unique() {
        let mut seen: Vec<u32> = Sysno::ALL.iter().map(|s| s.number()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), Sysno::ALL.len());
    }

    #[test]
    fn unknown_numbers_are_rejected() {
        assert_eq!(Sysno::try_from(0x03), Err(UnknownSyscall(0x03)));
        assert_eq!(Sysno::try_from(0xFF), Err(UnknownSyscall(0xFF)));
        assert_eq!(
            UnknownSyscall(0x2A).to_string(),
            "unknown supervisor call 0x2a"
        );
    }
}
