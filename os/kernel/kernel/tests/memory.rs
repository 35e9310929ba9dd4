mod common;

use kernel::{GuestMemoryError, KernelResult, LimitableResource, ProcessCreationInfo, ProcessId};
use kernel_info::memory::{HEAP_SIZE_ALIGNMENT, PAGE_SIZE};
use kernel_vmem::{AddressSpaceLayout, MemoryAccessError, MemoryPermission, MemoryState};
use std::sync::Arc;

#[test]
fn heap_growth_is_charged_and_returned() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let limit = Arc::new(kernel::ResourceLimit::unlimited());
    let mut info = ProcessCreationInfo::new("heap");
    info.resource_limit = Some(Arc::clone(&limit));
    let process = ctx.create_process(info).unwrap();
    let code = limit.current(LimitableResource::PhysicalMemory);
    assert_eq!(code, PAGE_SIZE);

    let heap = ctx.set_heap_size(process, 2 * HEAP_SIZE_ALIGNMENT).unwrap();
    assert_eq!(heap, AddressSpaceLayout::standard().heap.start().as_u64());
    assert_eq!(
        limit.current(LimitableResource::PhysicalMemory),
        code + 2 * HEAP_SIZE_ALIGNMENT
    );
    assert_eq!(ctx.process_info(process).unwrap().heap_size, 2 * HEAP_SIZE_ALIGNMENT);

    assert_eq!(ctx.set_heap_size(process, 0x1000), Err(KernelResult::InvalidSize));
    ctx.set_heap_size(process, HEAP_SIZE_ALIGNMENT).unwrap();
    assert_eq!(limit.current(LimitableResource::PhysicalMemory), code + HEAP_SIZE_ALIGNMENT);
    assert_eq!(
        limit.peak(LimitableResource::PhysicalMemory),
        code + 2 * HEAP_SIZE_ALIGNMENT
    );
}

#[test]
fn heap_is_bounded_by_the_memory_limit() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let limit = Arc::new(kernel::ResourceLimit::with_limits([
        HEAP_SIZE_ALIGNMENT,
        u64::MAX,
        u64::MAX,
        u64::MAX,
        u64::MAX,
    ]));
    let mut info = ProcessCreationInfo::new("tight");
    info.resource_limit = Some(Arc::clone(&limit));
    let process = ctx.create_process(info).unwrap();

    assert_eq!(
        ctx.set_heap_size(process, HEAP_SIZE_ALIGNMENT),
        Err(KernelResult::ResourceLimitExceeded)
    );
    assert_eq!(limit.current(LimitableResource::PhysicalMemory), PAGE_SIZE);
    assert_eq!(ctx.process_info(process).unwrap().heap_size, 0);
}

fn with_heap(ctx: &kernel::KernelContext, name: &str) -> (ProcessId, u64) {
    let process = common::process(ctx, name);
    let heap = ctx.set_heap_size(process, HEAP_SIZE_ALIGNMENT).unwrap();
    (process, heap)
}

#[test]
fn host_accesses_cross_page_boundaries() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let (process, heap) = with_heap(ctx, "access");

    let at = heap + PAGE_SIZE - 2;
    ctx.write_memory(process, at, b"span").unwrap();
    let mut back = [0u8; 4];
    ctx.read_memory(process, at, &mut back).unwrap();
    assert_eq!(&back, b"span");

    ctx.write_bytes(process, heap, 0xAA, 16).unwrap();
    assert_eq!(ctx.read_u32(process, heap + 12).unwrap(), 0xAAAA_AAAA);
    ctx.write_u32(process, heap + 4, 0x1234_5678).unwrap();
    assert_eq!(ctx.read_u32(process, heap + 4).unwrap(), 0x1234_5678);

    let sum = ctx
        .with_span(process, heap, 16, |bytes| bytes.iter().map(|b| u32::from(*b)).sum::<u32>())
        .unwrap();
    assert_eq!(sum, 12 * 0xAA + 0x12 + 0x34 + 0x56 + 0x78);
}

#[test]
fn unmapped_and_protected_memory_is_refused() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let (process, heap) = with_heap(ctx, "refuse");
    let end = heap + HEAP_SIZE_ALIGNMENT;

    let mut buf = [0u8; 8];
    assert!(matches!(
        ctx.read_memory(process, end - 4, &mut buf),
        Err(GuestMemoryError::Access(MemoryAccessError::Unmapped { .. }))
    ));
    assert!(matches!(
        ctx.read_memory(ProcessId::new(9999), heap, &mut buf),
        Err(GuestMemoryError::NoSuchProcess(_))
    ));

    ctx.protect_memory(process, heap, PAGE_SIZE, MemoryPermission::Read)
        .unwrap();
    assert!(matches!(
        ctx.write_u32(process, heap, 1),
        Err(GuestMemoryError::Access(MemoryAccessError::PermissionDenied { .. }))
    ));
    assert_eq!(ctx.read_u32(process, heap).unwrap(), 0);
    assert_eq!(
        ctx.query_memory(process, heap).unwrap().permission,
        MemoryPermission::Read
    );
    assert_eq!(
        ctx.protect_memory(process, heap, PAGE_SIZE, MemoryPermission::ReadExecute),
        Err(KernelResult::InvalidPermission)
    );
    assert_eq!(
        ctx.protect_memory(process, heap + 1, PAGE_SIZE, MemoryPermission::None),
        Err(KernelResult::InvalidAddress)
    );
}

#[test]
fn aliases_share_frames_until_unmapped() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let (process, heap) = with_heap(ctx, "alias");
    let stack = AddressSpaceLayout::standard().stack.start().as_u64();
    let size = 2 * PAGE_SIZE;

    ctx.write_u32(process, heap, 0xCAFE).unwrap();
    ctx.map_memory(process, stack, heap, size).unwrap();
    assert_eq!(ctx.read_u32(process, stack).unwrap(), 0xCAFE);
    assert!(ctx.read_u32(process, heap).is_err());
    assert_eq!(ctx.query_memory(process, stack).unwrap().state, MemoryState::Stack);

    ctx.write_u32(process, stack + 4, 0xBEEF).unwrap();
    assert_eq!(
        ctx.unmap_memory(process, stack, heap + PAGE_SIZE, PAGE_SIZE),
        Err(KernelResult::InvalidMemoryRange)
    );
    ctx.unmap_memory(process, stack, heap, size).unwrap();
    assert_eq!(ctx.read_u32(process, heap + 4).unwrap(), 0xBEEF);
    assert_eq!(ctx.query_memory(process, stack).unwrap().state, MemoryState::Unmapped);
    assert!(ctx.audit().is_clean());
}

#[test]
fn code_image_is_readable_but_not_writable() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let mut info = ProcessCreationInfo::new("image");
    info.code_pages = 2;
    info.image = (0..=255).collect();
    let base = info.code_address;
    let process = ctx.create_process(info).unwrap();

    let mut bytes = [0u8; 4];
    ctx.read_memory(process, base + 252, &mut bytes).unwrap();
    assert_eq!(bytes, [252, 253, 254, 255]);
    assert_eq!(ctx.read_u32(process, base + PAGE_SIZE).unwrap(), 0);
    assert!(ctx.write_u32(process, base, 0).is_err());

    let blocks = ctx.memory_blocks(process).unwrap();
    let code = blocks
        .iter()
        .find(|b| b.state.state == MemoryState::CodeStatic)
        .unwrap();
    assert_eq!((code.base.as_u64(), code.pages), (base, 2));
    assert_eq!(code.state.permission, MemoryPermission::ReadExecute);
}
