//! Per-process guest address space.

use crate::block::{MemoryBlock, MemoryInfo};
use crate::layout::AddressSpaceLayout;
use crate::ledger::{BlockLedger, Blocks, LedgerNode, LedgerViolation};
use crate::page_table::{GuestPageTable, PageEntry};
use crate::state::{BlockState, MemoryAttribute, MemoryPermission, MemoryState};
use kernel_alloc::{BlockSlabManager, FrameAllocator, PhysicalMemory, SlabPool};
use kernel_info::KernelResult;
use kernel_info::memory::{
    ADDRESS_SPACE_END, ADDRESS_SPACE_START, HEAP_SIZE_ALIGNMENT, MAX_BLOCKS_NEEDED_FOR_INSERTION,
    PAGE_SIZE,
};
use kernel_memory_addresses::{PageRange, PhysicalAddress, VirtualAddress};
use log::{debug, trace};

/// Both ledger node pools.
pub type BlockSlab = BlockSlabManager<LedgerNode>;

/// Kernel-wide resources a mutating memory operation draws from.
pub struct MemoryResources<'a> {
    pub slabs: &'a mut BlockSlab,
    pub frames: &'a mut FrameAllocator,
    pub dram: &'a mut PhysicalMemory,
}

/// Where the pages of a new mapping come from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Backing {
    /// Fresh zeroed frames, owned by the mapping and freed on unmap.
    Allocate,
    /// An existing physically contiguous range the mapping does not own.
    Physical(PhysicalAddress),
}

type Result<T> = core::result::Result<T, KernelResult>;

/// The guest address space of one process: ledger, page table and heap.
///
/// Every mutating operation validates its complete input against the ledger
/// before touching anything, so a failed call leaves the address space exactly
/// as it was.
#[derive(Debug)]
pub struct MemoryManager {
    layout: AddressSpaceLayout,
    ledger: BlockLedger,
    pages: GuestPageTable,
    pool: SlabPool,
    heap_size: u64,
}

impl MemoryManager {
    /// Creates an address space that is unmapped everywhere.
    ///
    /// # Errors
    /// [`KernelResult::OutOfResource`] if `pool` has no node left.
    pub fn new(slabs: &mut BlockSlab, pool: SlabPool, layout: AddressSpaceLayout) -> Result<Self> {
        let ledger = BlockLedger::new(slabs.pool_mut(pool), layout.address_space)
            .map_err(|_| KernelResult::OutOfResource)?;
        Ok(Self {
            layout,
            ledger,
            pages: GuestPageTable::new(),
            pool,
            heap_size: 0,
        })
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &AddressSpaceLayout {
        &self.layout
    }

    #[inline]
    #[must_use]
    pub const fn pool(&self) -> SlabPool {
        self.pool
    }

    #[inline]
    #[must_use]
    pub const fn heap_size(&self) -> u64 {
        self.heap_size
    }

    /// Bytes of guest DRAM owned by this address space.
    #[inline]
    #[must_use]
    pub const fn used_memory(&self) -> u64 {
        self.pages.owned_pages() * PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn block_count(&self) -> usize {
        self.ledger.block_count()
    }

    #[must_use]
    pub fn blocks<'a>(&self, slabs: &'a BlockSlab) -> Blocks<'a> {
        self.ledger.iter(slabs.pool(self.pool))
    }

    /// # Errors
    /// The first broken ledger invariant.
    pub fn verify(&self, slabs: &BlockSlab) -> core::result::Result<(), LedgerViolation> {
        self.ledger.verify(slabs.pool(self.pool))
    }

    pub(crate) fn block_at(&self, slabs: &BlockSlab, address: VirtualAddress) -> Option<MemoryBlock> {
        self.ledger.block_at(slabs.pool(self.pool), address)
    }

    pub(crate) fn overlapping<'a>(&self, slabs: &'a BlockSlab, range: PageRange) -> Blocks<'a> {
        self.ledger.overlapping(slabs.pool(self.pool), range)
    }

    pub(crate) const fn page_table(&self) -> &GuestPageTable {
        &self.pages
    }

    /// Returns the state of `range` if one block covers it and `check` accepts it.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidMemoryRange`] if `range` leaves the address space.
    /// * [`KernelResult::InvalidMemoryState`] if the range is not homogeneous or
    ///   `check` rejects it.
    pub fn check_range(
        &self,
        slabs: &BlockSlab,
        range: PageRange,
        check: impl FnOnce(&BlockState) -> bool,
    ) -> Result<BlockState> {
        self.ensure_in_address_space(range)?;
        self.ledger
            .check_range(slabs.pool(self.pool), range, check)
            .ok_or(KernelResult::InvalidMemoryState)
    }

    const fn ensure_in_address_space(&self, range: PageRange) -> Result<()> {
        if self.layout.address_space.contains_range(&range) {
            Ok(())
        } else {
            Err(KernelResult::InvalidMemoryRange)
        }
    }

    fn ensure_capacity(&self, slabs: &BlockSlab, updates: usize) -> Result<()> {
        if slabs.can_allocate(self.pool, updates * MAX_BLOCKS_NEEDED_FOR_INSERTION) {
            Ok(())
        } else {
            Err(KernelResult::OutOfResource)
        }
    }

    fn update(&mut self, slabs: &mut BlockSlab, range: PageRange, state: BlockState) {
        self.ledger.update(slabs.pool_mut(self.pool), range, state);
    }

    /// Maps `range` with `state`, backed as described by `backing`.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidMemoryState`] if `state` is not a mapped state
    ///   or the range is not entirely unmapped.
    /// * [`KernelResult::InvalidMemoryRange`] if the range leaves the address
    ///   space or the region reserved for `state`, or a physical backing leaves DRAM.
    /// * [`KernelResult::InvalidAddress`] for a misaligned physical backing.
    /// * [`KernelResult::OutOfResource`] if the ledger pool is exhausted.
    /// * [`KernelResult::OutOfMemory`] if there are not enough free frames.
    pub fn map(
        &mut self,
        res: &mut MemoryResources<'_>,
        range: PageRange,
        backing: Backing,
        state: BlockState,
    ) -> Result<()> {
        if !state.state.is_mapped() {
            return Err(KernelResult::InvalidMemoryState);
        }
        self.ensure_in_address_space(range)?;
        if !self.layout.is_valid_region_for_state(state.state, &range) {
            return Err(KernelResult::InvalidMemoryRange);
        }
        self.check_range(res.slabs, range, |s| *s == BlockState::UNMAPPED)?;
        self.ensure_capacity(res.slabs, 1)?;

        match backing {
            Backing::Allocate => {
                if res.frames.free_frames() < range.pages() {
                    return Err(KernelResult::OutOfMemory);
                }
                let frames = res
                    .frames
                    .alloc_many(range.pages())
                    .ok_or(KernelResult::OutOfMemory)?;
                for (page, frame) in range.iter_pages().zip(frames) {
                    zero_frame(res.dram, frame);
                    self.pages.map(page, PageEntry { frame, owned: true });
                }
            }
            Backing::Physical(base) => {
                if !base.is_page_aligned() {
                    return Err(KernelResult::InvalidAddress);
                }
                if base
                    .as_u64()
                    .checked_add(range.size())
                    .is_none_or(|end| end > res.dram.size())
                {
                    return Err(KernelResult::InvalidMemoryRange);
                }
                for (i, page) in range.iter_pages().enumerate() {
                    let frame = base + (i as u64) * PAGE_SIZE;
                    self.pages.map(page, PageEntry { frame, owned: false });
                }
            }
        }

        self.update(res.slabs, range, state);
        trace!("mapped {range:?} as {:?}/{:?}", state.state, state.permission);
        Ok(())
    }

    /// Unmaps `range`, which must be one unlocked block in state `expected`.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidMemoryRange`] if the range leaves the address space.
    /// * [`KernelResult::InvalidMemoryState`] if the range is not homogeneous,
    ///   not in `expected`, or carries attributes.
    /// * [`KernelResult::OutOfResource`] if the ledger pool is exhausted.
    pub fn unmap(
        &mut self,
        res: &mut MemoryResources<'_>,
        range: PageRange,
        expected: MemoryState,
    ) -> Result<()> {
        self.check_range(res.slabs, range, |s| {
            s.state == expected && s.state.is_mapped() && s.attribute.is_none()
        })?;
        self.ensure_capacity(res.slabs, 1)?;

        for page in range.iter_pages() {
            if let Some(entry) = self.pages.unmap(page)
                && entry.owned
            {
                res.frames.free_4k(entry.frame);
            }
        }
        self.update(res.slabs, range, BlockState::UNMAPPED);
        trace!("unmapped {range:?}");
        Ok(())
    }

    /// Changes the permission of `range`, leaving state and attributes untouched.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidMemoryRange`] if the range leaves the address space.
    /// * [`KernelResult::InvalidMemoryState`] if the range is not one unlocked
    ///   block whose state allows permission changes.
    /// * [`KernelResult::OutOfResource`] if the ledger pool is exhausted.
    pub fn protect(
        &mut self,
        slabs: &mut BlockSlab,
        range: PageRange,
        permission: MemoryPermission,
    ) -> Result<()> {
        let current = self.check_range(slabs, range, |s| {
            s.state.flags().permission_change_allowed() && s.attribute.is_none()
        })?;
        if current.permission == permission {
            return Ok(());
        }
        self.ensure_capacity(slabs, 1)?;
        self.update(slabs, range, current.with_permission(permission));
        trace!("protected {range:?} as {permission:?}");
        Ok(())
    }

    /// Describes the block covering `address`. Never fails: addresses outside
    /// the address space report a synthesized inaccessible block.
    #[must_use]
    pub fn query(&self, slabs: &BlockSlab, address: VirtualAddress) -> MemoryInfo {
        if let Some(block) = self.block_at(slabs, address) {
            return block.info();
        }
        let (start, size) = if address.as_u64() < ADDRESS_SPACE_START {
            (0, ADDRESS_SPACE_START)
        } else {
            (ADDRESS_SPACE_END, 0u64.wrapping_sub(ADDRESS_SPACE_END))
        };
        MemoryInfo {
            address: start,
            size,
            state: MemoryState::Inaccessible,
            permission: MemoryPermission::None,
            attribute: MemoryAttribute::NONE,
        }
    }

    /// Maps `dst` in the stack region onto the pages of `src`.
    ///
    /// `src` becomes locked and inaccessible until [`unmap_alias`](Self::unmap_alias).
    ///
    /// # Errors
    /// * [`KernelResult::InvalidSize`] if the ranges differ in size.
    /// * [`KernelResult::InvalidMemoryRange`] if `src` leaves the address space or
    ///   `dst` leaves the stack region.
    /// * [`KernelResult::InvalidMemoryState`] if `src` is not one unlocked
    ///   read-write block that allows aliasing, or `dst` is not unmapped.
    /// * [`KernelResult::OutOfResource`] if the ledger pool is exhausted.
    pub fn map_alias(&mut self, slabs: &mut BlockSlab, dst: PageRange, src: PageRange) -> Result<()> {
        if dst.pages() != src.pages() {
            return Err(KernelResult::InvalidSize);
        }
        self.ensure_in_address_space(src)?;
        if !self.layout.stack.contains_range(&dst) {
            return Err(KernelResult::InvalidMemoryRange);
        }
        let source = self.check_range(slabs, src, |s| {
            s.state.flags().map_allowed()
                && s.permission == MemoryPermission::ReadWrite
                && s.attribute.is_none()
        })?;
        self.check_range(slabs, dst, |s| *s == BlockState::UNMAPPED)?;
        self.ensure_capacity(slabs, 2)?;

        for (d, s) in dst.iter_pages().zip(src.iter_pages()) {
            let Some(entry) = self.pages.translate(s) else {
                log::error!("mapped page {s} has no translation");
                panic!("mapped page {s} has no translation");
            };
            self.pages.map(
                d,
                PageEntry {
                    frame: entry.frame,
                    owned: false,
                },
            );
        }
        self.update(
            slabs,
            src,
            source
                .with_permission(MemoryPermission::None)
                .with_attribute(MemoryAttribute::new().with_locked(true)),
        );
        self.update(
            slabs,
            dst,
            BlockState::new(MemoryState::Stack, MemoryPermission::ReadWrite),
        );
        debug!("aliased {dst:?} onto {src:?}");
        Ok(())
    }

    /// Reverts [`map_alias`](Self::map_alias).
    ///
    /// # Errors
    /// * [`KernelResult::InvalidSize`] if the ranges differ in size.
    /// * [`KernelResult::InvalidMemoryRange`] if the ranges leave their regions
    ///   or `dst` is not backed by the pages of `src`.
    /// * [`KernelResult::InvalidMemoryState`] if `src` is not a locked alias
    ///   source or `dst` is not an unlocked stack block.
    /// * [`KernelResult::OutOfResource`] if the ledger pool is exhausted.
    pub fn unmap_alias(&mut self, slabs: &mut BlockSlab, dst: PageRange, src: PageRange) -> Result<()> {
        if dst.pages() != src.pages() {
            return Err(KernelResult::InvalidSize);
        }
        self.ensure_in_address_space(src)?;
        if !self.layout.stack.contains_range(&dst) {
            return Err(KernelResult::InvalidMemoryRange);
        }
        let locked = MemoryAttribute::new().with_locked(true);
        let source = self.check_range(slabs, src, |s| {
            s.state.flags().map_allowed()
                && s.permission == MemoryPermission::None
                && s.attribute == locked
        })?;
        self.check_range(slabs, dst, |s| {
            s.state == MemoryState::Stack && s.attribute.is_none()
        })?;
        let same_frames = dst.iter_pages().zip(src.iter_pages()).all(|(d, s)| {
            match (self.pages.translate(d), self.pages.translate(s)) {
                (Some(d), Some(s)) => d.frame == s.frame,
                _ => false,
            }
        });
        if !same_frames {
            return Err(KernelResult::InvalidMemoryRange);
        }
        self.ensure_capacity(slabs, 2)?;

        for page in dst.iter_pages() {
            self.pages.unmap(page);
        }
        self.update(slabs, dst, BlockState::UNMAPPED);
        self.update(
            slabs,
            src,
            source
                .with_permission(MemoryPermission::ReadWrite)
                .with_attribute(MemoryAttribute::NONE),
        );
        debug!("removed alias {dst:?} of {src:?}");
        Ok(())
    }

    /// Grows or shrinks the heap to `size` bytes from the heap region base and
    /// returns that base.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidSize`] if `size` is not a multiple of the heap alignment.
    /// * [`KernelResult::OutOfMemory`] if `size` exceeds the heap region or DRAM.
    /// * Any error of [`map`](Self::map) or [`unmap`](Self::unmap) for the delta.
    pub fn set_heap_size(&mut self, res: &mut MemoryResources<'_>, size: u64) -> Result<VirtualAddress> {
        if !size.is_multiple_of(HEAP_SIZE_ALIGNMENT) {
            return Err(KernelResult::InvalidSize);
        }
        if size > self.layout.heap.size() {
            return Err(KernelResult::OutOfMemory);
        }
        let base = self.layout.heap.start();
        let current = self.heap_size;
        if size > current {
            let delta = PageRange::from_pages(base + current, (size - current) / PAGE_SIZE);
            self.map(
                res,
                delta,
                Backing::Allocate,
                BlockState::new(MemoryState::Heap, MemoryPermission::ReadWrite),
            )?;
        } else if size < current {
            let delta = PageRange::from_pages(base + size, (current - size) / PAGE_SIZE);
            // Pages given other permissions cannot be handed back by a shrink.
            self.check_range(res.slabs, delta, |s| {
                s.state == MemoryState::Heap
                    && s.permission == MemoryPermission::ReadWrite
                    && s.attribute.is_none()
            })?;
            self.unmap(res, delta, MemoryState::Heap)?;
        }
        self.heap_size = size;
        debug!("heap resized from {current:#x} to {size:#x}");
        Ok(base)
    }

    /// Releases every frame and ledger node of this address space.
    pub fn release(mut self, res: &mut MemoryResources<'_>) {
        let owned: alloc::vec::Vec<_> = self.pages.drain_owned().collect();
        for frame in owned {
            res.frames.free_4k(frame);
        }
        self.ledger.release(res.slabs.pool_mut(self.pool));
    }
}

fn zero_frame(dram: &mut PhysicalMemory, frame: PhysicalAddress) {
    if let Err(e) = dram.zero(frame, PAGE_SIZE as usize) {
        log::error!("frame allocator handed out {frame} outside of DRAM: {e}");
        panic!("frame allocator handed out {frame} outside of DRAM: {e}");
    }
}
