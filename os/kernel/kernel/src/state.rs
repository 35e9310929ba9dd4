//! Everything guarded by the kernel's critical section.

use crate::config::KernelConfig;
use crate::handle_table::KernelObject;
use crate::ids::{IdCounter, ObjectId, ProcessId, ThreadId};
use crate::priority_queue::PriorityQueue;
use crate::process::ProcessRecord;
use crate::resource_limit::LimitableResource;
use crate::scheduler::CoreSlot;
use crate::sync_object::{SyncKind, SyncObject};
use crate::thread::{ThreadRecord, ThreadState};
use crate::time_manager::TimeQueue;
use kernel_alloc::{FrameAllocator, PhysicalMemory};
use kernel_info::KernelResult;
use kernel_info::scheduling::{
    CPU_CORES_COUNT, CURRENT_PROCESS_HANDLE, CURRENT_THREAD_HANDLE, core_bit, highest_core_in_mask,
};
use kernel_sync::CoreMask;
use kernel_vmem::BlockSlab;
use std::collections::BTreeMap;

pub(crate) struct KernelState {
    pub threads: BTreeMap<ThreadId, ThreadRecord>,
    pub processes: BTreeMap<ProcessId, ProcessRecord>,
    pub objects: BTreeMap<ObjectId, SyncObject>,
    pub queue: PriorityQueue,
    pub cores: [CoreSlot; CPU_CORES_COUNT],
    pub timers: TimeQueue,
    pub slabs: BlockSlab,
    pub frames: FrameAllocator,
    pub dram: PhysicalMemory,
    thread_ids: IdCounter,
    process_ids: IdCounter,
    object_ids: IdCounter,
    wait_seq: u64,
    pub dispatch_seq: u64,
}

impl KernelState {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            threads: BTreeMap::new(),
            processes: BTreeMap::new(),
            objects: BTreeMap::new(),
            queue: PriorityQueue::new(),
            cores: std::array::from_fn(|_| CoreSlot::default()),
            timers: TimeQueue::default(),
            slabs: BlockSlab::new(config.large_slab_blocks(), config.small_slab_blocks()),
            frames: FrameAllocator::new(config.dram_size()),
            dram: PhysicalMemory::new(config.dram_size()),
            thread_ids: IdCounter::new(),
            process_ids: IdCounter::new(),
            object_ids: IdCounter::new(),
            wait_seq: 0,
            dispatch_seq: 0,
        }
    }

    pub const fn next_thread_id(&mut self) -> ThreadId {
        ThreadId::new(self.thread_ids.next())
    }

    pub const fn next_process_id(&mut self) -> ProcessId {
        ProcessId::new(self.process_ids.next())
    }

    pub const fn next_wait_seq(&mut self) -> u64 {
        self.wait_seq += 1;
        self.wait_seq
    }

    pub const fn next_dispatch_seq(&mut self) -> u64 {
        self.dispatch_seq += 1;
        self.dispatch_seq
    }

    /// Creates an object with one reference held by the caller.
    pub fn create_object(&mut self, kind: SyncKind) -> ObjectId {
        let id = ObjectId::new(self.object_ids.next());
        let mut object = SyncObject::new(kind);
        object.refs = 1;
        self.objects.insert(id, object);
        id
    }

    pub fn retain_object(&mut self, id: ObjectId) {
        if let Some(object) = self.objects.get_mut(&id) {
            object.refs += 1;
        }
    }

    /// Drops one reference; the object disappears once unreferenced and unwaited.
    pub fn release_object(&mut self, id: ObjectId) {
        let Some(object) = self.objects.get_mut(&id) else {
            return;
        };
        object.refs = object.refs.saturating_sub(1);
        self.collect_object(id);
    }

    /// Removes `id` if nothing references or waits on it any more.
    pub fn collect_object(&mut self, id: ObjectId) {
        if !self.objects.get(&id).is_some_and(SyncObject::is_collectable) {
            return;
        }
        if let Some(object) = self.objects.remove(&id)
            && let Some(limit) = object.charge
        {
            limit.release(LimitableResource::Events, 1);
        }
    }

    pub fn thread(&self, id: ThreadId) -> Result<&ThreadRecord, KernelResult> {
        self.threads.get(&id).ok_or(KernelResult::InvalidHandle)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Result<&mut ThreadRecord, KernelResult> {
        self.threads.get_mut(&id).ok_or(KernelResult::InvalidHandle)
    }

    pub fn process(&self, id: ProcessId) -> Result<&ProcessRecord, KernelResult> {
        self.processes.get(&id).ok_or(KernelResult::InvalidHandle)
    }

    pub fn process_mut(&mut self, id: ProcessId) -> Result<&mut ProcessRecord, KernelResult> {
        self.processes.get_mut(&id).ok_or(KernelResult::InvalidHandle)
    }

    /// Resolves `handle` in the handle table of `caller`'s process.
    pub fn resolve_handle(&self, caller: ThreadId, handle: u32) -> Result<KernelObject, KernelResult> {
        let thread = self.thread(caller)?;
        let process = self.process(thread.process)?;
        match handle {
            CURRENT_THREAD_HANDLE => Ok(KernelObject::Thread(thread.object)),
            CURRENT_PROCESS_HANDLE => Ok(KernelObject::Process(process.object)),
            _ => process.handles.get(handle).ok_or(KernelResult::InvalidHandle),
        }
    }

    /// Resolves a handle that must name a live thread.
    pub fn resolve_thread(&self, caller: ThreadId, handle: u32) -> Result<ThreadId, KernelResult> {
        let KernelObject::Thread(object) = self.resolve_handle(caller, handle)? else {
            return Err(KernelResult::InvalidHandle);
        };
        match self.objects.get(&object).map(|o| o.kind) {
            Some(SyncKind::Thread { thread, .. }) if self.threads.contains_key(&thread) => Ok(thread),
            _ => Err(KernelResult::InvalidHandle),
        }
    }

    /// Resolves a handle that must name a live process.
    pub fn resolve_process(&self, caller: ThreadId, handle: u32) -> Result<ProcessId, KernelResult> {
        let KernelObject::Process(object) = self.resolve_handle(caller, handle)? else {
            return Err(KernelResult::InvalidHandle);
        };
        match self.objects.get(&object).map(|o| o.kind) {
            Some(SyncKind::Process { process, .. }) if self.processes.contains_key(&process) => {
                Ok(process)
            }
            _ => Err(KernelResult::InvalidHandle),
        }
    }

    /// Makes a thread runnable: queued on its preferred core, or paused.
    ///
    /// Returns the cores whose selection may change.
    pub fn make_ready(&mut self, id: ThreadId) -> CoreMask {
        let Some(thread) = self.threads.get_mut(&id) else {
            return 0;
        };
        if thread.paused {
            thread.state = ThreadState::Paused;
            return 0;
        }
        if thread.affinity & core_bit(thread.preferred_core) != 0 {
            thread.active_core = thread.preferred_core;
        } else if let Some(core) = highest_core_in_mask(thread.affinity) {
            thread.active_core = core;
        }
        thread.state = ThreadState::Ready;
        let (core, priority) = (thread.active_core, thread.priority);
        self.queue.enqueue(id, core, priority);
        core_bit(core)
    }

    /// Takes a thread out of the ready queue, returning the core it left.
    pub fn unschedule(&mut self, id: ThreadId) -> CoreMask {
        self.queue.remove(id).map_or(0, |slot| core_bit(slot.core))
    }
}
