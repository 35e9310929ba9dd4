use kernel_alloc::{FrameAllocator, PhysicalMemory, SlabPool};
use kernel_info::KernelResult;
use kernel_info::memory::{HEAP_SIZE_ALIGNMENT, PAGE_SIZE};
use kernel_memory_addresses::{PageRange, PhysicalAddress, VirtualAddress};
use kernel_vmem::{
    AccessKind, AddressSpaceLayout, Backing, BlockSlab, BlockState, MemoryAccessError,
    MemoryManager, MemoryPermission, MemoryResources, MemoryState,
};

const DRAM: u64 = 8 * 1024 * 1024;

struct Fixture {
    slabs: BlockSlab,
    frames: FrameAllocator,
    dram: PhysicalMemory,
    mm: Option<MemoryManager>,
}

impl Fixture {
    fn with_slab_capacity(large: usize, small: usize) -> Self {
        let mut slabs = BlockSlab::new(large, small);
        let mm = MemoryManager::new(&mut slabs, SlabPool::Small, AddressSpaceLayout::standard())
            .unwrap();
        Self {
            slabs,
            frames: FrameAllocator::new(DRAM),
            dram: PhysicalMemory::new(DRAM),
            mm: Some(mm),
        }
    }

    fn new() -> Self {
        Self::with_slab_capacity(16, 256)
    }

    fn parts(&mut self) -> (&mut MemoryManager, MemoryResources<'_>) {
        let mm = self.mm.as_mut().unwrap();
        (
            mm,
            MemoryResources {
                slabs: &mut self.slabs,
                frames: &mut self.frames,
                dram: &mut self.dram,
            },
        )
    }

    fn mm(&self) -> &MemoryManager {
        self.mm.as_ref().unwrap()
    }

    fn snapshot(&self) -> Vec<(u64, u64, BlockState)> {
        self.mm()
            .blocks(&self.slabs)
            .map(|b| (b.base.as_u64(), b.pages, b.state))
            .collect()
    }

    fn verify(&self) {
        self.mm().verify(&self.slabs).unwrap();
    }

    fn map_heap(&mut self, range: PageRange, permission: MemoryPermission) -> Result<(), KernelResult> {
        let (mm, mut res) = self.parts();
        mm.map(
            &mut res,
            range,
            Backing::Allocate,
            BlockState::new(MemoryState::Heap, permission),
        )
    }
}

fn heap_pages(offset_pages: u64, pages: u64) -> PageRange {
    let heap = AddressSpaceLayout::standard().heap.start();
    PageRange::from_pages(heap + offset_pages * PAGE_SIZE, pages)
}

#[test]
fn map_then_unmap_restores_exact_ledger() {
    let mut fx = Fixture::new();
    fx.map_heap(heap_pages(0, 4), MemoryPermission::ReadWrite).unwrap();
    let before = fx.snapshot();
    let nodes_before = fx.slabs.pool(SlabPool::Small).in_use();
    let free_before = fx.frames.free_frames();

    let range = heap_pages(10, 3);
    fx.map_heap(range, MemoryPermission::ReadWrite).unwrap();
    assert_ne!(fx.snapshot(), before);
    assert_eq!(fx.frames.free_frames(), free_before - 3);
    fx.verify();

    let (mm, mut res) = fx.parts();
    mm.unmap(&mut res, range, MemoryState::Heap).unwrap();
    assert_eq!(fx.snapshot(), before);
    assert_eq!(fx.slabs.pool(SlabPool::Small).in_use(), nodes_before);
    assert_eq!(fx.frames.free_frames(), free_before);
    fx.verify();
}

#[test]
fn protect_middle_third_splits_then_remerges() {
    let mut fx = Fixture::new();
    let range = heap_pages(0, 3);
    fx.map_heap(range, MemoryPermission::ReadWrite).unwrap();
    let uniform = fx.mm().block_count();

    let middle = heap_pages(1, 1);
    let (mm, res) = fx.parts();
    mm.protect(res.slabs, middle, MemoryPermission::Read).unwrap();
    assert_eq!(fx.mm().block_count(), uniform + 2);
    let blocks: Vec<_> = fx
        .mm()
        .blocks(&fx.slabs)
        .filter(|b| range.contains(b.base))
        .map(|b| (b.pages, b.state.permission))
        .collect();
    assert_eq!(
        blocks,
        [
            (1, MemoryPermission::ReadWrite),
            (1, MemoryPermission::Read),
            (1, MemoryPermission::ReadWrite),
        ]
    );
    fx.verify();

    let (mm, res) = fx.parts();
    mm.protect(res.slabs, middle, MemoryPermission::ReadWrite).unwrap();
    assert_eq!(fx.mm().block_count(), uniform);
    let info = fx.mm().query(&fx.slabs, range.start());
    assert_eq!(info.address, range.start().as_u64());
    assert_eq!(info.size, 3 * PAGE_SIZE);
    fx.verify();
}

#[test]
fn failed_operations_leave_ledger_untouched() {
    let mut fx = Fixture::new();
    fx.map_heap(heap_pages(0, 2), MemoryPermission::ReadWrite).unwrap();
    let before = fx.snapshot();

    // overlapping an existing mapping
    assert_eq!(
        fx.map_heap(heap_pages(1, 2), MemoryPermission::ReadWrite),
        Err(KernelResult::InvalidMemoryState)
    );
    // heap state outside the heap region
    let stack = AddressSpaceLayout::standard().stack.start();
    assert_eq!(
        fx.map_heap(PageRange::from_pages(stack, 1), MemoryPermission::ReadWrite),
        Err(KernelResult::InvalidMemoryRange)
    );
    // unmapping with the wrong expected state
    let (mm, mut res) = fx.parts();
    assert_eq!(
        mm.unmap(&mut res, heap_pages(0, 2), MemoryState::Stack),
        Err(KernelResult::InvalidMemoryState)
    );
    // unmapping a range that is only partly mapped
    assert_eq!(
        mm.unmap(&mut res, heap_pages(0, 3), MemoryState::Heap),
        Err(KernelResult::InvalidMemoryState)
    );
    // stack memory does not allow permission changes
    assert_eq!(
        mm.protect(res.slabs, PageRange::from_pages(stack, 1), MemoryPermission::Read),
        Err(KernelResult::InvalidMemoryState)
    );

    assert_eq!(fx.snapshot(), before);
    fx.verify();
}

#[test]
fn slab_exhaustion_is_reported_before_mutation() {
    // one node for the initial block, one spare: a split in the middle needs two
    let mut fx = Fixture::with_slab_capacity(0, 2);
    let before = fx.snapshot();
    let free = fx.frames.free_frames();
    assert_eq!(
        fx.map_heap(heap_pages(4, 1), MemoryPermission::ReadWrite),
        Err(KernelResult::OutOfResource)
    );
    assert_eq!(fx.snapshot(), before);
    assert_eq!(fx.frames.free_frames(), free);
}

#[test]
fn out_of_frames_is_out_of_memory() {
    let mut fx = Fixture::new();
    let too_many = DRAM / PAGE_SIZE + 1;
    assert_eq!(
        fx.map_heap(heap_pages(0, too_many), MemoryPermission::ReadWrite),
        Err(KernelResult::OutOfMemory)
    );
    fx.verify();
}

#[test]
fn query_covers_every_address() {
    let fx = Fixture::new();
    let layout = AddressSpaceLayout::standard();

    let inside = fx.mm().query(&fx.slabs, layout.heap.start());
    assert_eq!(inside.state, MemoryState::Unmapped);
    assert_eq!(inside.address, layout.address_space.start().as_u64());

    let below = fx.mm().query(&fx.slabs, VirtualAddress::new(0x1000));
    assert_eq!(below.state, MemoryState::Inaccessible);
    assert_eq!(below.address, 0);
    assert_eq!(below.size, layout.address_space.start().as_u64());

    let above = fx.mm().query(&fx.slabs, VirtualAddress::new(u64::MAX));
    assert_eq!(above.state, MemoryState::Inaccessible);
    assert_eq!(above.address, layout.address_space.end().as_u64());
    assert_eq!(above.address.wrapping_add(above.size), 0);
}

#[test]
fn physical_backing_is_not_freed_on_unmap() {
    let mut fx = Fixture::new();
    let io = AddressSpaceLayout::standard().tls_io.start();
    let range = PageRange::from_pages(io, 2);
    let (mm, mut res) = fx.parts();
    mm.map(
        &mut res,
        range,
        Backing::Physical(PhysicalAddress::new(0x10_000)),
        BlockState::new(MemoryState::Io, MemoryPermission::ReadWrite),
    )
    .unwrap();
    assert_eq!(mm.translate(io + 0x1004), Some(PhysicalAddress::new(0x11_004)));
    assert_eq!(mm.used_memory(), 0);
    mm.unmap(&mut res, range, MemoryState::Io).unwrap();
    assert_eq!(fx.frames.free_frames(), DRAM / PAGE_SIZE);

    let (mm, mut res) = fx.parts();
    assert_eq!(
        mm.map(
            &mut res,
            range,
            Backing::Physical(PhysicalAddress::new(DRAM - PAGE_SIZE)),
            BlockState::new(MemoryState::Io, MemoryPermission::ReadWrite),
        ),
        Err(KernelResult::InvalidMemoryRange)
    );
}

#[test]
fn heap_grows_and_shrinks() {
    let mut fx = Fixture::new();
    let (mm, mut res) = fx.parts();
    assert_eq!(mm.set_heap_size(&mut res, 0x1000), Err(KernelResult::InvalidSize));

    let base = mm.set_heap_size(&mut res, HEAP_SIZE_ALIGNMENT).unwrap();
    assert_eq!(base, AddressSpaceLayout::standard().heap.start());
    assert_eq!(mm.heap_size(), HEAP_SIZE_ALIGNMENT);
    assert_eq!(mm.used_memory(), HEAP_SIZE_ALIGNMENT);

    mm.set_heap_size(&mut res, 2 * HEAP_SIZE_ALIGNMENT).unwrap();
    mm.set_heap_size(&mut res, HEAP_SIZE_ALIGNMENT).unwrap();
    assert_eq!(mm.used_memory(), HEAP_SIZE_ALIGNMENT);
    let info = mm.query(res.slabs, base);
    assert_eq!(info.state, MemoryState::Heap);
    assert_eq!(info.size, HEAP_SIZE_ALIGNMENT);

    mm.set_heap_size(&mut res, 0).unwrap();
    assert_eq!(mm.used_memory(), 0);
    fx.verify();
}

#[test]
fn heap_shrink_rejects_reprotected_pages() {
    let mut fx = Fixture::new();
    let (mm, mut res) = fx.parts();
    let base = mm.set_heap_size(&mut res, 2 * HEAP_SIZE_ALIGNMENT).unwrap();
    let tail = PageRange::from_pages(base + HEAP_SIZE_ALIGNMENT, 1);
    mm.protect(res.slabs, tail, MemoryPermission::Read).unwrap();
    let before = fx.snapshot();

    let (mm, mut res) = fx.parts();
    assert_eq!(
        mm.set_heap_size(&mut res, HEAP_SIZE_ALIGNMENT),
        Err(KernelResult::InvalidMemoryState)
    );
    assert_eq!(mm.heap_size(), 2 * HEAP_SIZE_ALIGNMENT);
    assert_eq!(mm.used_memory(), 2 * HEAP_SIZE_ALIGNMENT);
    assert_eq!(fx.snapshot(), before);

    // restoring read-write lets the shrink through
    let (mm, mut res) = fx.parts();
    mm.protect(res.slabs, tail, MemoryPermission::ReadWrite).unwrap();
    mm.set_heap_size(&mut res, HEAP_SIZE_ALIGNMENT).unwrap();
    assert_eq!(mm.used_memory(), HEAP_SIZE_ALIGNMENT);
    fx.verify();
}

#[test]
fn alias_mapping_shares_pages_and_locks_source() {
    let mut fx = Fixture::new();
    let (mm, mut res) = fx.parts();
    let heap = mm.set_heap_size(&mut res, HEAP_SIZE_ALIGNMENT).unwrap();
    mm.write(res.slabs, res.dram, heap, b"guest bytes").unwrap();

    let src = PageRange::from_pages(heap, 2);
    let dst = PageRange::from_pages(AddressSpaceLayout::standard().stack.start(), 2);
    mm.map_alias(res.slabs, dst, src).unwrap();

    let mut buf = [0u8; 11];
    mm.read(res.slabs, res.dram, dst.start(), &mut buf).unwrap();
    assert_eq!(&buf, b"guest bytes");
    assert_eq!(
        mm.read(res.slabs, res.dram, heap, &mut buf),
        Err(MemoryAccessError::PermissionDenied {
            address: heap,
            access: AccessKind::Read
        })
    );
    // the locked source cannot be aliased twice or unmapped
    let dst2 = PageRange::from_pages(dst.end(), 2);
    assert_eq!(mm.map_alias(res.slabs, dst2, src), Err(KernelResult::InvalidMemoryState));
    assert_eq!(
        mm.set_heap_size(&mut res, 0),
        Err(KernelResult::InvalidMemoryState)
    );

    mm.unmap_alias(res.slabs, dst, src).unwrap();
    mm.read(res.slabs, res.dram, heap, &mut buf).unwrap();
    assert_eq!(&buf, b"guest bytes");
    assert_eq!(mm.query(res.slabs, dst.start()).state, MemoryState::Unmapped);
    assert_eq!(mm.query(res.slabs, heap).size, HEAP_SIZE_ALIGNMENT);
    fx.verify();
}

#[test]
fn unmap_alias_rejects_foreign_destination() {
    let mut fx = Fixture::new();
    let (mm, mut res) = fx.parts();
    let heap = mm.set_heap_size(&mut res, HEAP_SIZE_ALIGNMENT).unwrap();
    let src = PageRange::from_pages(heap, 1);
    let other = PageRange::from_pages(heap + PAGE_SIZE, 1);
    let dst = PageRange::from_pages(AddressSpaceLayout::standard().stack.start(), 1);
    mm.map_alias(res.slabs, dst, src).unwrap();
    assert!(mm.unmap_alias(res.slabs, dst, other).is_err());
    mm.unmap_alias(res.slabs, dst, src).unwrap();
}

#[test]
fn access_is_validated_against_ledger() {
    let mut fx = Fixture::new();
    let code = AddressSpaceLayout::standard().code.start();
    let (mm, mut res) = fx.parts();
    mm.map(
        &mut res,
        PageRange::from_pages(code, 1),
        Backing::Allocate,
        BlockState::new(MemoryState::CodeStatic, MemoryPermission::ReadExecute),
    )
    .unwrap();

    let mut buf = [0u8; 8];
    mm.read(res.slabs, res.dram, code, &mut buf).unwrap();
    assert_eq!(
        mm.write(res.slabs, res.dram, code, &buf),
        Err(MemoryAccessError::PermissionDenied {
            address: code,
            access: AccessKind::Write
        })
    );
    // the read runs off the end of the mapping into unmapped space
    let mut long = [0u8; 16];
    assert_eq!(
        mm.read(res.slabs, res.dram, code + (PAGE_SIZE - 8), &mut long),
        Err(MemoryAccessError::Unmapped {
            address: code + PAGE_SIZE
        })
    );
    assert_eq!(
        KernelResult::from(MemoryAccessError::Unmapped { address: code }),
        KernelResult::UserCopyFailed
    );
    // empty accesses always succeed
    mm.read(res.slabs, res.dram, VirtualAddress::new(0), &mut []).unwrap();
}

#[test]
fn spans_cross_page_boundaries() {
    let mut fx = Fixture::new();
    fx.map_heap(heap_pages(0, 2), MemoryPermission::ReadWrite).unwrap();
    let start = heap_pages(0, 2).start() + (PAGE_SIZE - 2);
    let (mm, res) = fx.parts();
    mm.with_span_mut(res.slabs, res.dram, start, 4, |bytes| {
        bytes.copy_from_slice(&[1, 2, 3, 4]);
    })
    .unwrap();
    let sum = mm
        .with_span(res.slabs, res.dram, start, 4, |bytes| {
            bytes.iter().map(|b| u32::from(*b)).sum::<u32>()
        })
        .unwrap();
    assert_eq!(sum, 10);
}

#[test]
fn random_sequences_keep_ledger_invariants() {
    let mut fx = Fixture::with_slab_capacity(0, 512);
    let mut seed = 0x2545_F491_4F6C_DD1D_u64;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };
    let perms = [
        MemoryPermission::None,
        MemoryPermission::Read,
        MemoryPermission::ReadWrite,
    ];

    for _ in 0..400 {
        let range = heap_pages(next() % 32, 1 + next() % 6);
        let (mm, mut res) = fx.parts();
        let _ = match next() % 3 {
            0 => mm.map(
                &mut res,
                range,
                Backing::Allocate,
                BlockState::new(MemoryState::Heap, MemoryPermission::ReadWrite),
            ),
            1 => mm.unmap(&mut res, range, MemoryState::Heap),
            _ => mm.protect(res.slabs, range, perms[(next() % 3) as usize]),
        };
        fx.verify();
    }
}

#[test]
fn release_returns_all_resources() {
    let mut fx = Fixture::new();
    fx.map_heap(heap_pages(0, 5), MemoryPermission::ReadWrite).unwrap();
    fx.map_heap(heap_pages(9, 2), MemoryPermission::Read).unwrap();
    let mm = fx.mm.take().unwrap();
    let mut res = MemoryResources {
        slabs: &mut fx.slabs,
        frames: &mut fx.frames,
        dram: &mut fx.dram,
    };
    mm.release(&mut res);
    assert_eq!(fx.slabs.pool(SlabPool::Small).in_use(), 0);
    assert_eq!(fx.frames.free_frames(), DRAM / PAGE_SIZE);
}
