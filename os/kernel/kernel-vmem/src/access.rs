//! Validated guest memory access.
//!
//! Every access is checked against the ledger first: each touched block must
//! be mapped with a permission that allows the access. Only then are bytes
//! copied from or to the frames the page table names.

use crate::manager::{BlockSlab, MemoryManager};
use alloc::vec;
use kernel_alloc::PhysicalMemory;
use kernel_info::KernelResult;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PageRange, PhysicalAddress, VirtualAddress};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryAccessError {
    #[error("access of {len:#x} bytes at {address} wraps the address space")]
    Overflow { address: VirtualAddress, len: usize },
    #[error("{address} is not mapped")]
    Unmapped { address: VirtualAddress },
    #[error("{address} does not allow {access:?} access")]
    PermissionDenied {
        address: VirtualAddress,
        access: AccessKind,
    },
}

impl From<MemoryAccessError> for KernelResult {
    fn from(_: MemoryAccessError) -> Self {
        Self::UserCopyFailed
    }
}

type Result<T> = core::result::Result<T, MemoryAccessError>;

/// Pages touched by `[address, address + len)`; `None` for an empty access.
fn touched_pages(address: VirtualAddress, len: usize) -> Result<Option<PageRange>> {
    if len == 0 {
        return Ok(None);
    }
    let overflow = MemoryAccessError::Overflow { address, len };
    let last = address
        .as_u64()
        .checked_add(len as u64 - 1)
        .ok_or(overflow)?;
    let first = address.align_down();
    let end = (last | (PAGE_SIZE - 1)).checked_add(1).ok_or(overflow)?;
    Ok(PageRange::between(first, VirtualAddress::new(end)))
}

impl MemoryManager {
    /// Checks that `[address, address + len)` is mapped and allows `access`.
    ///
    /// # Errors
    /// The first offending address.
    pub fn validate_access(
        &self,
        slabs: &BlockSlab,
        address: VirtualAddress,
        len: usize,
        access: AccessKind,
    ) -> Result<()> {
        let Some(pages) = touched_pages(address, len)? else {
            return Ok(());
        };
        if !self.layout().address_space.contains_range(&pages) {
            let outside = if self.layout().address_space.contains(address) {
                self.layout().address_space.end()
            } else {
                address
            };
            return Err(MemoryAccessError::Unmapped { address: outside });
        }
        for block in self.overlapping(slabs, pages) {
            let at = block.base.max(address);
            if !block.state.state.is_mapped() {
                return Err(MemoryAccessError::Unmapped { address: at });
            }
            let allowed = match access {
                AccessKind::Read => block.state.permission.can_read(),
                AccessKind::Write => block.state.permission.can_write(),
            };
            if !allowed {
                return Err(MemoryAccessError::PermissionDenied {
                    address: at,
                    access,
                });
            }
        }
        Ok(())
    }

    /// Guest physical address backing `address`, if mapped.
    #[must_use]
    pub fn translate(&self, address: VirtualAddress) -> Option<PhysicalAddress> {
        self.page_table()
            .translate(address.align_down())
            .map(|entry| entry.frame + address.page_offset())
    }

    /// Walks the access page by page as `(frame address, offset into buffer, length)`.
    fn for_each_chunk(
        &self,
        address: VirtualAddress,
        len: usize,
        mut f: impl FnMut(PhysicalAddress, usize, usize),
    ) -> Result<()> {
        let mut done = 0usize;
        while done < len {
            let va = address + done as u64;
            let Some(pa) = self.translate(va) else {
                return Err(MemoryAccessError::Unmapped { address: va });
            };
            let in_page = (PAGE_SIZE - va.page_offset()) as usize;
            let chunk = in_page.min(len - done);
            f(pa, done, chunk);
            done += chunk;
        }
        Ok(())
    }

    /// The physical start of the access if all of its pages are physically
    /// consecutive.
    fn contiguous(&self, address: VirtualAddress, len: usize) -> Option<PhysicalAddress> {
        let start = self.translate(address)?;
        let mut expected = start;
        let mut contiguous = true;
        self.for_each_chunk(address, len, |pa, _, chunk| {
            contiguous &= pa == expected;
            expected = pa + chunk as u64;
        })
        .ok()?;
        contiguous.then_some(start)
    }

    /// Copies guest memory into `buf`.
    ///
    /// # Errors
    /// If any touched page is unmapped or not readable.
    pub fn read(
        &self,
        slabs: &BlockSlab,
        dram: &PhysicalMemory,
        address: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<()> {
        self.validate_access(slabs, address, buf.len(), AccessKind::Read)?;
        let mut failed = None;
        self.for_each_chunk(address, buf.len(), |pa, offset, chunk| {
            match dram.slice(pa, chunk) {
                Ok(src) => buf[offset..offset + chunk].copy_from_slice(src),
                Err(_) => failed = failed.or(Some(address + offset as u64)),
            }
        })?;
        failed.map_or(Ok(()), |address| Err(MemoryAccessError::Unmapped { address }))
    }

    /// Copies `data` into guest memory.
    ///
    /// # Errors
    /// If any touched page is unmapped or not writable. Nothing is written then.
    pub fn write(
        &self,
        slabs: &BlockSlab,
        dram: &mut PhysicalMemory,
        address: VirtualAddress,
        data: &[u8],
    ) -> Result<()> {
        self.validate_access(slabs, address, data.len(), AccessKind::Write)?;
        let mut failed = None;
        self.for_each_chunk(address, data.len(), |pa, offset, chunk| {
            match dram.slice_mut(pa, chunk) {
                Ok(dst) => dst.copy_from_slice(&data[offset..offset + chunk]),
                Err(_) => failed = failed.or(Some(address + offset as u64)),
            }
        })?;
        failed.map_or(Ok(()), |address| Err(MemoryAccessError::Unmapped { address }))
    }

    /// Runs `f` on the bytes at `[address, address + len)`.
    ///
    /// Physically contiguous ranges are handed out without copying; anything
    /// else goes through a temporary buffer.
    ///
    /// # Errors
    /// If any touched page is unmapped or not readable.
    pub fn with_span<R>(
        &self,
        slabs: &BlockSlab,
        dram: &PhysicalMemory,
        address: VirtualAddress,
        len: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        self.validate_access(slabs, address, len, AccessKind::Read)?;
        if len == 0 {
            return Ok(f(&[]));
        }
        if let Some(pa) = self.contiguous(address, len)
            && let Ok(span) = dram.slice(pa, len)
        {
            return Ok(f(span));
        }
        let mut copy = vec![0u8; len];
        self.read(slabs, dram, address, &mut copy)?;
        Ok(f(&copy))
    }

    /// Runs `f` on the writable bytes at `[address, address + len)`.
    ///
    /// Non-contiguous ranges are copied out, handed to `f`, and written back.
    ///
    /// # Errors
    /// If any touched page is unmapped or not writable.
    pub fn with_span_mut<R>(
        &self,
        slabs: &BlockSlab,
        dram: &mut PhysicalMemory,
        address: VirtualAddress,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        self.validate_access(slabs, address, len, AccessKind::Write)?;
        if len == 0 {
            return Ok(f(&mut []));
        }
        if let Some(pa) = self.contiguous(address, len)
            && let Ok(span) = dram.slice_mut(pa, len)
        {
            return Ok(f(span));
        }
        let mut copy = vec![0u8; len];
        self.read(slabs, dram, address, &mut copy)?;
        let out = f(&mut copy);
        self.write(slabs, dram, address, &copy)?;
        Ok(out)
    }
}
