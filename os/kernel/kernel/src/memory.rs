//! Guest memory as seen by the JIT and HLE services.
//!
//! Every call resolves the process, validates the access against its ledger
//! and only then touches DRAM, all inside the critical section. Span
//! callbacks therefore run with the section held and must not call back into
//! the kernel.

use crate::context::KernelContext;
use crate::ids::ProcessId;
use crate::resource_limit::LimitableResource;
use crate::state::KernelState;
use kernel_info::KernelResult;
use kernel_memory_addresses::{PageRange, VirtualAddress};
use kernel_vmem::{MemoryAccessError, MemoryBlock, MemoryInfo, MemoryPermission};

/// Why a guest memory access failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuestMemoryError {
    #[error("{0} does not exist")]
    NoSuchProcess(ProcessId),
    #[error(transparent)]
    Access(#[from] MemoryAccessError),
}

impl From<GuestMemoryError> for KernelResult {
    fn from(value: GuestMemoryError) -> Self {
        match value {
            GuestMemoryError::NoSuchProcess(_) => Self::InvalidHandle,
            GuestMemoryError::Access(e) => e.into(),
        }
    }
}

type AccessResult<T> = core::result::Result<T, GuestMemoryError>;
type Result<T> = core::result::Result<T, KernelResult>;

impl KernelState {
    pub(crate) fn read_guest(
        &self,
        process: ProcessId,
        address: VirtualAddress,
        buf: &mut [u8],
    ) -> AccessResult<()> {
        let record = self
            .processes
            .get(&process)
            .ok_or(GuestMemoryError::NoSuchProcess(process))?;
        Ok(record.memory.read(&self.slabs, &self.dram, address, buf)?)
    }

    pub(crate) fn write_guest(
        &mut self,
        process: ProcessId,
        address: VirtualAddress,
        data: &[u8],
    ) -> AccessResult<()> {
        let record = self
            .processes
            .get(&process)
            .ok_or(GuestMemoryError::NoSuchProcess(process))?;
        Ok(record.memory.write(&self.slabs, &mut self.dram, address, data)?)
    }
}

impl KernelContext {
    /// Copies guest memory of `process` at `address` into `buf`.
    ///
    /// # Errors
    /// If the process does not exist or any touched page is unmapped or unreadable.
    pub fn read_memory(&self, process: ProcessId, address: u64, buf: &mut [u8]) -> AccessResult<()> {
        self.critical_section()
            .with_lock(|state| state.read_guest(process, VirtualAddress::new(address), buf))
    }

    /// Copies `data` into guest memory of `process` at `address`.
    ///
    /// # Errors
    /// If the process does not exist or any touched page is unmapped or not
    /// writable. Nothing is written then.
    pub fn write_memory(&self, process: ProcessId, address: u64, data: &[u8]) -> AccessResult<()> {
        self.critical_section()
            .with_lock(|state| state.write_guest(process, VirtualAddress::new(address), data))
    }

    /// Runs `f` on `len` readable guest bytes, without copying when they are
    /// physically contiguous.
    ///
    /// # Errors
    /// As [`read_memory`](Self::read_memory).
    pub fn with_span<R>(
        &self,
        process: ProcessId,
        address: u64,
        len: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> AccessResult<R> {
        self.critical_section().with_lock(|state| {
            let (memory, res) = state
                .process_memory(process)
                .map_err(|_| GuestMemoryError::NoSuchProcess(process))?;
            Ok(memory.with_span(res.slabs, res.dram, VirtualAddress::new(address), len, f)?)
        })
    }

    /// Runs `f` on `len` writable guest bytes.
    ///
    /// # Errors
    /// As [`write_memory`](Self::write_memory).
    pub fn with_span_mut<R>(
        &self,
        process: ProcessId,
        address: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> AccessResult<R> {
        self.critical_section().with_lock(|state| {
            let (memory, res) = state
                .process_memory(process)
                .map_err(|_| GuestMemoryError::NoSuchProcess(process))?;
            Ok(memory.with_span_mut(res.slabs, res.dram, VirtualAddress::new(address), len, f)?)
        })
    }

    /// Reads a little-endian `u32`.
    ///
    /// # Errors
    /// As [`read_memory`](Self::read_memory).
    pub fn read_u32(&self, process: ProcessId, address: u64) -> AccessResult<u32> {
        let mut bytes = [0u8; 4];
        self.read_memory(process, address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Writes a little-endian `u32`.
    ///
    /// # Errors
    /// As [`write_memory`](Self::write_memory).
    pub fn write_u32(&self, process: ProcessId, address: u64, value: u32) -> AccessResult<()> {
        self.write_memory(process, address, &value.to_le_bytes())
    }

    /// Fills `len` bytes at `address` with `value`.
    ///
    /// # Errors
    /// As [`write_memory`](Self::write_memory).
    pub fn write_bytes(&self, process: ProcessId, address: u64, value: u8, len: usize) -> AccessResult<()> {
        self.with_span_mut(process, address, len, |span| span.fill(value))
    }

    /// Describes the block covering `address`.
    ///
    /// # Errors
    /// [`KernelResult::InvalidHandle`] if the process does not exist.
    pub fn query_memory(&self, process: ProcessId, address: u64) -> Result<MemoryInfo> {
        self.critical_section().with_lock(|state| {
            let (memory, res) = state.process_memory(process)?;
            Ok(memory.query(res.slabs, VirtualAddress::new(address)))
        })
    }

    /// Every ledger block of a process, lowest address first.
    ///
    /// # Errors
    /// [`KernelResult::InvalidHandle`] if the process does not exist.
    pub fn memory_blocks(&self, process: ProcessId) -> Result<Vec<MemoryBlock>> {
        self.critical_section().with_lock(|state| {
            let (memory, res) = state.process_memory(process)?;
            Ok(memory.blocks(res.slabs).copied().collect())
        })
    }

    /// Resizes the heap and returns its base. Growth is charged to the
    /// process's physical memory limit.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidSize`] if `size` is not a multiple of 2 MiB.
    /// * [`KernelResult::OutOfMemory`] beyond the heap region or DRAM.
    /// * [`KernelResult::ResourceLimitExceeded`] beyond the process limit.
    pub fn set_heap_size(&self, process: ProcessId, size: u64) -> Result<u64> {
        self.critical_section().with_lock(|state| {
            let record = state.process(process)?;
            let limit = record.limit.clone();
            let current = record.memory.heap_size();
            if size > current {
                limit.try_reserve(LimitableResource::PhysicalMemory, size - current)?;
            }
            let (memory, mut res) = state.process_memory(process)?;
            let base = match memory.set_heap_size(&mut res, size) {
                Ok(base) => base,
                Err(e) => {
                    if size > current {
                        limit.release(LimitableResource::PhysicalMemory, size - current);
                    }
                    return Err(e);
                }
            };
            let record = state.process_mut(process)?;
            if size < current {
                limit.release(LimitableResource::PhysicalMemory, current - size);
                record.reserved_memory -= current - size;
            } else {
                record.reserved_memory += size - current;
            }
            Ok(base.as_u64())
        })
    }

    /// Changes the permission of `[address, address + size)`. Only no access,
    /// read-only and read-write may be requested.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidAddress`] / [`KernelResult::InvalidSize`] for a misaligned range.
    /// * [`KernelResult::InvalidPermission`] for an execute permission.
    /// * [`KernelResult::InvalidMemoryState`] if the range does not allow the change.
    pub fn protect_memory(
        &self,
        process: ProcessId,
        address: u64,
        size: u64,
        permission: MemoryPermission,
    ) -> Result<()> {
        let range = PageRange::try_new(VirtualAddress::new(address), size)?;
        if !matches!(
            permission,
            MemoryPermission::None | MemoryPermission::Read | MemoryPermission::ReadWrite
        ) {
            return Err(KernelResult::InvalidPermission);
        }
        self.critical_section().with_lock(|state| {
            let (memory, res) = state.process_memory(process)?;
            memory.protect(res.slabs, range, permission)
        })
    }

    /// Aliases `size` bytes of `src` at `dst` in the stack region.
    ///
    /// # Errors
    /// Misaligned ranges, or any error of the ledger's alias mapping.
    pub fn map_memory(&self, process: ProcessId, dst: u64, src: u64, size: u64) -> Result<()> {
        let dst = PageRange::try_new(VirtualAddress::new(dst), size)?;
        let src = PageRange::try_new(VirtualAddress::new(src), size)?;
        self.critical_section().with_lock(|state| {
            let (memory, res) = state.process_memory(process)?;
            memory.map_alias(res.slabs, dst, src)
        })
    }

    /// Removes an alias made by [`map_memory`](Self::map_memory).
    ///
    /// # Errors
    /// Misaligned ranges, or any error of the ledger's alias removal.
    pub fn unmap_memory(&self, process: ProcessId, dst: u64, src: u64, size: u64) -> Result<()> {
        let dst = PageRange::try_new(VirtualAddress::new(dst), size)?;
        let src = PageRange::try_new(VirtualAddress::new(src), size)?;
        self.critical_section().with_lock(|state| {
            let (memory, res) = state.process_memory(process)?;
            memory.unmap_alias(res.slabs, dst, src)
        })
    }
}
