//! Process and thread lifecycle.
//!
//! Creation validates everything before it takes the critical section and
//! charges the process's resource limit before it allocates. Teardown runs
//! in two steps: the records are removed under the critical section, then the
//! execution contexts of the removed threads are terminated outside it.

use crate::context::KernelContext;
use crate::execution::ThreadStart;
use crate::handle_table::HandleTable;
use crate::ids::{ProcessId, ThreadId};
use crate::process::{ProcessCreationInfo, ProcessInfo, ProcessRecord, ProcessState};
use crate::resource_limit::{LimitableResource, ResourceLimit};
use crate::state::KernelState;
use crate::sync_object::SyncKind;
use crate::thread::{GuestThread, ThreadInfo, ThreadRecord, ThreadState};
use kernel_info::KernelResult;
use kernel_info::memory::PAGE_SIZE;
use kernel_info::scheduling::{
    ALL_CORES_MASK, CORE_ID_NO_UPDATE, CORE_ID_PROCESS_DEFAULT, CPU_CORES_COUNT, core_bit,
};
use kernel_memory_addresses::{PageRange, VirtualAddress};
use kernel_sync::CoreMask;
use kernel_vmem::{
    AddressSpaceLayout, Backing, BlockState, MemoryManager, MemoryPermission, MemoryResources,
    MemoryState,
};
use log::{debug, info};
use std::collections::BTreeSet;
use std::sync::Arc;

type Result<T> = core::result::Result<T, KernelResult>;

/// Where and how a new thread starts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ThreadParams {
    pub entry: u64,
    pub argument: u64,
    pub stack_top: u64,
    pub priority: u8,
    /// A core id or [`CORE_ID_PROCESS_DEFAULT`].
    pub core: i32,
}

/// Threads removed from the kernel whose host contexts still need terminating.
#[derive(Debug, Default)]
#[must_use]
pub(crate) struct Removed {
    pub threads: Vec<GuestThread>,
    pub cores: CoreMask,
}

impl Removed {
    fn terminate(self) {
        for thread in self.threads {
            thread.terminate();
        }
    }
}

fn page_range(address: u64, pages: u64) -> Result<PageRange> {
    let size = pages.checked_mul(PAGE_SIZE).ok_or(KernelResult::InvalidSize)?;
    Ok(PageRange::try_new(VirtualAddress::new(address), size)?)
}

/// Copies `image` into freshly mapped frames starting at `base`.
///
/// The pages may not be writable for the guest, so this goes through the
/// page table directly.
fn load_image(memory: &MemoryManager, res: &mut MemoryResources<'_>, base: u64, image: &[u8]) {
    for (i, chunk) in image.chunks(PAGE_SIZE as usize).enumerate() {
        let page = VirtualAddress::new(base + i as u64 * PAGE_SIZE);
        let copied = memory
            .translate(page)
            .and_then(|frame| res.dram.slice_mut(frame, chunk.len()).ok())
            .map(|dst| dst.copy_from_slice(chunk));
        if copied.is_none() {
            log::error!("freshly mapped code page {page} has no usable frame");
            panic!("freshly mapped code page {page} has no usable frame");
        }
    }
}

impl KernelState {
    /// Borrows a process's address space together with the kernel memory pools.
    pub(crate) fn process_memory(
        &mut self,
        process: ProcessId,
    ) -> Result<(&mut MemoryManager, MemoryResources<'_>)> {
        let record = self
            .processes
            .get_mut(&process)
            .ok_or(KernelResult::InvalidHandle)?;
        Ok((
            &mut record.memory,
            MemoryResources {
                slabs: &mut self.slabs,
                frames: &mut self.frames,
                dram: &mut self.dram,
            },
        ))
    }

    fn build_address_space(
        &mut self,
        info: &ProcessCreationInfo,
        code: PageRange,
    ) -> Result<MemoryManager> {
        let mut memory = MemoryManager::new(
            &mut self.slabs,
            info.category.slab_pool(),
            AddressSpaceLayout::standard(),
        )?;
        let mut res = MemoryResources {
            slabs: &mut self.slabs,
            frames: &mut self.frames,
            dram: &mut self.dram,
        };
        let mapped = memory.map(
            &mut res,
            code,
            Backing::Allocate,
            BlockState::new(MemoryState::CodeStatic, MemoryPermission::ReadExecute),
        );
        if let Err(e) = mapped {
            memory.release(&mut res);
            return Err(e);
        }
        load_image(&memory, &mut res, code.start().as_u64(), &info.image);
        Ok(memory)
    }

    /// Maps `size` bytes of fresh memory in `state`, charged to the process limit.
    fn map_charged(
        &mut self,
        process: ProcessId,
        range: PageRange,
        state: BlockState,
    ) -> Result<()> {
        let limit = self.process(process)?.limit.clone();
        limit.try_reserve(LimitableResource::PhysicalMemory, range.size())?;
        let (memory, mut res) = self.process_memory(process)?;
        if let Err(e) = memory.map(&mut res, range, Backing::Allocate, state) {
            limit.release(LimitableResource::PhysicalMemory, range.size());
            return Err(e);
        }
        self.process_mut(process)?.reserved_memory += range.size();
        Ok(())
    }

    /// Resolves a guest core id argument against `process`.
    pub(crate) fn resolve_core(&self, process: ProcessId, core: i32) -> Result<usize> {
        let process = self.process(process)?;
        let core = if core == CORE_ID_PROCESS_DEFAULT {
            process.default_core
        } else {
            usize::try_from(core).map_err(|_| KernelResult::InvalidCoreId)?
        };
        if core >= CPU_CORES_COUNT || !process.allows_core(core) {
            return Err(KernelResult::InvalidCoreId);
        }
        Ok(core)
    }

    /// Removes a thread from every structure that refers to it and signals
    /// its thread object. The host context is returned for termination.
    pub(crate) fn remove_thread(&mut self, id: ThreadId) -> Removed {
        let Some(record) = self.threads.remove(&id) else {
            return Removed::default();
        };
        let mut cores = self.unschedule(id);
        self.timers.remove(id);
        for object in record.wait.iter().flat_map(|w| w.objects.iter()) {
            self.drop_waiter(*object, id);
        }
        cores |= self.signal_object(record.object, 1).unwrap_or(0);
        self.release_object(record.object);
        if let Some(process) = self.processes.get_mut(&record.process) {
            process.threads.remove(&id);
            process.limit.release(LimitableResource::Threads, 1);
        }
        info!("{id} of {} terminated", record.process);
        Removed {
            threads: vec![record.handle],
            cores,
        }
    }

    /// Destroys a process whose threads are all gone.
    pub(crate) fn finish_process(&mut self, id: ProcessId) -> CoreMask {
        let Some(mut process) = self.processes.remove(&id) else {
            return 0;
        };
        for handle in process.handles.drain() {
            self.release_object(handle.object());
        }
        process.memory.release(&mut MemoryResources {
            slabs: &mut self.slabs,
            frames: &mut self.frames,
            dram: &mut self.dram,
        });
        process
            .limit
            .release(LimitableResource::PhysicalMemory, process.reserved_memory);
        let cores = self.signal_object(process.object, 1).unwrap_or(0);
        self.release_object(process.object);
        info!("{id} ({}) destroyed", process.name);
        cores
    }

    /// Removes every thread of `id` and then the process itself.
    pub(crate) fn remove_process(&mut self, id: ProcessId) -> Result<Removed> {
        let threads: Vec<ThreadId> = self.process(id)?.threads.iter().copied().collect();
        let mut removed = Removed::default();
        for thread in threads {
            let r = self.remove_thread(thread);
            removed.threads.extend(r.threads);
            removed.cores |= r.cores;
        }
        removed.cores |= self.finish_process(id);
        Ok(removed)
    }

    /// Removes a thread and, if it was the last one of a started process,
    /// the process as well.
    pub(crate) fn exit_thread(&mut self, id: ThreadId) -> Removed {
        let process = self.threads.get(&id).map(|t| t.process);
        let mut removed = self.remove_thread(id);
        if let Some(process) = process
            && self
                .processes
                .get(&process)
                .is_some_and(|p| p.threads.is_empty() && p.state == ProcessState::Started)
        {
            removed.cores |= self.finish_process(process);
        }
        removed
    }

    pub(crate) fn set_priority(&mut self, id: ThreadId, priority: u8) -> Result<CoreMask> {
        let thread = self.thread(id)?;
        if !self.process(thread.process)?.allows_priority(priority) {
            return Err(KernelResult::InvalidPriority);
        }
        let thread = self.thread_mut(id)?;
        if thread.priority == priority {
            return Ok(0);
        }
        thread.priority = priority;
        let objects = thread.wait.as_ref().map(|w| w.objects.clone()).unwrap_or_default();
        for object in objects {
            if let Some(o) = self.objects.get_mut(&object) {
                o.reprioritize(id, priority);
            }
        }
        Ok(match self.queue.remove(id) {
            Some(slot) => {
                self.queue.enqueue(id, slot.core, priority);
                core_bit(slot.core)
            }
            None => 0,
        })
    }

    pub(crate) fn set_core_mask(&mut self, id: ThreadId, core: i32, mask: u64) -> Result<CoreMask> {
        let thread = self.thread(id)?;
        let process = self.process(thread.process)?;
        let preferred = match core {
            CORE_ID_NO_UPDATE => thread.preferred_core,
            CORE_ID_PROCESS_DEFAULT => process.default_core,
            _ => usize::try_from(core)
                .ok()
                .filter(|c| *c < CPU_CORES_COUNT)
                .ok_or(KernelResult::InvalidCoreId)?,
        };
        if mask & !(process.core_mask & ALL_CORES_MASK) != 0 {
            return Err(KernelResult::InvalidCoreId);
        }
        if mask == 0 || mask & core_bit(preferred) == 0 {
            return Err(KernelResult::InvalidCombination);
        }

        let thread = self.thread_mut(id)?;
        thread.preferred_core = preferred;
        thread.affinity = mask;
        if mask & core_bit(thread.active_core) != 0 {
            return Ok(0);
        }
        let from = thread.active_core;
        thread.active_core = preferred;
        let priority = thread.priority;
        debug!("{id} migrates from core {from} to core {preferred}");
        Ok(match self.queue.remove(id) {
            Some(slot) => {
                self.queue.enqueue(id, preferred, priority);
                core_bit(slot.core) | core_bit(preferred)
            }
            None => 0,
        })
    }

    pub(crate) fn set_activity(&mut self, caller: ThreadId, id: ThreadId, pause: bool) -> Result<CoreMask> {
        if caller == id || self.thread(caller)?.process != self.thread(id)?.process {
            return Err(KernelResult::InvalidHandle);
        }
        let thread = self.thread_mut(id)?;
        if pause {
            if thread.paused {
                return Err(KernelResult::InvalidState);
            }
            thread.paused = true;
            if thread.state.is_runnable() {
                thread.state = ThreadState::Paused;
                return Ok(self.unschedule(id));
            }
            Ok(0)
        } else {
            if !thread.paused {
                return Err(KernelResult::InvalidState);
            }
            thread.paused = false;
            if thread.state == ThreadState::Paused {
                // A wait that ended while paused is handed back now.
                thread.handle.wake_event().set();
                return Ok(self.make_ready(id));
            }
            Ok(0)
        }
    }
}

impl KernelContext {
    /// Creates a thread record and its host context in `Initialized` state.
    pub(crate) fn create_thread_locked(
        &self,
        state: &mut KernelState,
        process: ProcessId,
        params: ThreadParams,
    ) -> Result<GuestThread> {
        let record = state.process(process)?;
        if !record.allows_priority(params.priority) {
            return Err(KernelResult::InvalidPriority);
        }
        let core = state.resolve_core(process, params.core)?;
        let limit = state.process(process)?.limit.clone();
        limit.try_reserve(LimitableResource::Threads, 1)?;

        let id = state.next_thread_id();
        let context = self.factory().create(&ThreadStart {
            thread: id,
            process,
            entry: params.entry,
            argument: params.argument,
            stack_top: params.stack_top,
            priority: params.priority,
        });
        let handle = GuestThread::new(id, process, context);
        let object = state.create_object(SyncKind::Thread {
            thread: id,
            exited: false,
        });
        state.threads.insert(
            id,
            ThreadRecord {
                handle: handle.clone(),
                process,
                object,
                state: ThreadState::Initialized,
                priority: params.priority,
                preferred_core: core,
                affinity: core_bit(core),
                active_core: core,
                paused: false,
                pending_cancel: false,
                wait: None,
                wait_result: None,
                last_scheduled: None,
            },
        );
        state.process_mut(process)?.threads.insert(id);
        info!("{id} created in {process} on core {core} at priority {}", params.priority);
        Ok(handle)
    }

    /// Creates a process with its code mapped and loaded. No thread runs
    /// until [`start_process`](Self::start_process).
    ///
    /// # Errors
    /// * [`KernelResult::InvalidAddress`] for a misaligned code address.
    /// * [`KernelResult::InvalidSize`] for an empty code mapping or an image larger than it.
    /// * [`KernelResult::InvalidMemoryRange`] if the code leaves the code region.
    /// * [`KernelResult::InvalidCoreId`] for an empty or out-of-range core mask,
    ///   or a default core outside it.
    /// * [`KernelResult::InvalidPriority`] for an empty priority mask.
    /// * [`KernelResult::ResourceLimitExceeded`], [`KernelResult::OutOfMemory`] or
    ///   [`KernelResult::OutOfResource`] when resources run out.
    pub fn create_process(&self, info: ProcessCreationInfo) -> Result<ProcessId> {
        let code = page_range(info.code_address, info.code_pages)?;
        if !AddressSpaceLayout::standard().code.contains_range(&code) {
            return Err(KernelResult::InvalidMemoryRange);
        }
        if info.image.len() as u64 > code.size() {
            return Err(KernelResult::InvalidSize);
        }
        if info.core_mask == 0 || info.core_mask & !ALL_CORES_MASK != 0 {
            return Err(KernelResult::InvalidCoreId);
        }
        if info.default_core >= CPU_CORES_COUNT || info.core_mask & core_bit(info.default_core) == 0 {
            return Err(KernelResult::InvalidCoreId);
        }
        if info.priority_mask == 0 {
            return Err(KernelResult::InvalidPriority);
        }
        let limit = info
            .resource_limit
            .clone()
            .unwrap_or_else(|| Arc::new(ResourceLimit::unlimited()));

        let guard = self.critical_section().enter();
        let mut state = guard.state();
        limit.try_reserve(LimitableResource::PhysicalMemory, code.size())?;
        let memory = match state.build_address_space(&info, code) {
            Ok(memory) => memory,
            Err(e) => {
                limit.release(LimitableResource::PhysicalMemory, code.size());
                return Err(e);
            }
        };
        let id = state.next_process_id();
        let object = state.create_object(SyncKind::Process {
            process: id,
            signaled: false,
        });
        state.processes.insert(
            id,
            ProcessRecord {
                id,
                name: info.name.clone(),
                title_id: info.title_id,
                state: ProcessState::Created,
                entry_point: code.start().as_u64(),
                memory,
                handles: HandleTable::new(self.config().handle_table_size()),
                threads: BTreeSet::new(),
                object,
                core_mask: info.core_mask,
                priority_mask: info.priority_mask,
                default_core: info.default_core,
                limit,
                reserved_memory: code.size(),
                main_thread: None,
            },
        );
        info!("{id} ({}) created, title {:#018x}", info.name, info.title_id);
        Ok(id)
    }

    /// Maps the main stack at the top of the stack region and starts the
    /// main thread at the code base.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidState`] if the process was started already.
    /// * [`KernelResult::InvalidSize`] for an empty stack.
    /// * [`KernelResult::InvalidPriority`] if the process may not use `priority`.
    /// * Resource exhaustion as for [`create_process`](Self::create_process).
    pub fn start_process(&self, process: ProcessId, priority: u8, stack_pages: u64) -> Result<ThreadId> {
        let main = {
            let guard = self.critical_section().enter();
            let mut state = guard.state();
            let record = state.process(process)?;
            if record.state != ProcessState::Created {
                return Err(KernelResult::InvalidState);
            }
            if !record.allows_priority(priority) {
                return Err(KernelResult::InvalidPriority);
            }
            if stack_pages == 0 {
                return Err(KernelResult::InvalidSize);
            }
            let region = record.memory.layout().stack;
            let size = stack_pages.checked_mul(PAGE_SIZE).ok_or(KernelResult::InvalidSize)?;
            if size > region.size() {
                return Err(KernelResult::OutOfMemory);
            }
            let entry = record.entry_point;
            let stack = PageRange::try_new(VirtualAddress::new(region.end().as_u64() - size), size)?;
            state.map_charged(
                process,
                stack,
                BlockState::new(MemoryState::Stack, MemoryPermission::ReadWrite),
            )?;

            let params = ThreadParams {
                entry,
                argument: 0,
                stack_top: stack.end().as_u64(),
                priority,
                core: CORE_ID_PROCESS_DEFAULT,
            };
            let main = match self.create_thread_locked(&mut state, process, params) {
                Ok(main) => main,
                Err(e) => {
                    let unmapped = state.process_memory(process).is_ok_and(|(memory, mut res)| {
                        memory.unmap(&mut res, stack, MemoryState::Stack).is_ok()
                    });
                    if unmapped && let Ok(p) = state.process_mut(process) {
                        p.reserved_memory -= size;
                        p.limit.release(LimitableResource::PhysicalMemory, size);
                    }
                    return Err(e);
                }
            };
            let record = state.process_mut(process)?;
            record.state = ProcessState::Started;
            record.main_thread = Some(main.id());
            let cores = state.make_ready(main.id());
            guard.request_reschedule(cores);
            info!("{process} started, main thread {}", main.id());
            main
        };
        main.start();
        Ok(main.id())
    }

    /// Terminates every thread of `process` and destroys it.
    ///
    /// # Errors
    /// [`KernelResult::InvalidHandle`] if the process does not exist.
    pub fn terminate_process(&self, process: ProcessId) -> Result<()> {
        let removed = {
            let guard = self.critical_section().enter();
            let removed = guard.state().remove_process(process)?;
            guard.request_reschedule(removed.cores);
            removed
        };
        removed.terminate();
        Ok(())
    }

    /// Creates a thread of `process` in `Initialized` state.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidHandle`] if the process does not exist.
    /// * [`KernelResult::InvalidPriority`] / [`KernelResult::InvalidCoreId`]
    ///   if the process may not use the priority or core.
    /// * [`KernelResult::ResourceLimitExceeded`] if the process may not create more threads.
    pub fn create_thread(&self, process: ProcessId, params: ThreadParams) -> Result<ThreadId> {
        let guard = self.critical_section().enter();
        let mut state = guard.state();
        self.create_thread_locked(&mut state, process, params)
            .map(|t| t.id())
    }

    /// Makes an `Initialized` thread runnable.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidHandle`] if the thread does not exist.
    /// * [`KernelResult::InvalidState`] if it was started already.
    pub fn start_thread(&self, id: ThreadId) -> Result<()> {
        let handle = {
            let guard = self.critical_section().enter();
            let mut state = guard.state();
            let thread = state.thread(id)?;
            if thread.state != ThreadState::Initialized {
                return Err(KernelResult::InvalidState);
            }
            let handle = thread.handle.clone();
            let cores = state.make_ready(id);
            guard.request_reschedule(cores);
            handle
        };
        handle.start();
        Ok(())
    }

    /// Ends the calling thread. Its process goes with it if it was the last thread.
    pub fn exit_thread(&self, caller: &GuestThread) {
        let removed = {
            let guard = self.critical_section().enter();
            let removed = guard.state().exit_thread(caller.id());
            guard.request_reschedule(removed.cores);
            removed
        };
        removed.terminate();
    }

    /// # Errors
    /// * [`KernelResult::InvalidHandle`] if the thread does not exist.
    /// * [`KernelResult::InvalidPriority`] if its process may not use `priority`.
    pub fn set_thread_priority(&self, id: ThreadId, priority: u8) -> Result<()> {
        let guard = self.critical_section().enter();
        let cores = guard.state().set_priority(id, priority)?;
        guard.request_reschedule(cores);
        Ok(())
    }

    /// Changes preferred core and affinity; `core` may be a core id,
    /// [`CORE_ID_PROCESS_DEFAULT`] or [`CORE_ID_NO_UPDATE`].
    ///
    /// # Errors
    /// * [`KernelResult::InvalidCoreId`] for an unknown core or a mask outside the process mask.
    /// * [`KernelResult::InvalidCombination`] for an empty mask or a preferred core outside it.
    pub fn set_thread_core_mask(&self, id: ThreadId, core: i32, mask: u64) -> Result<()> {
        let guard = self.critical_section().enter();
        let cores = guard.state().set_core_mask(id, core, mask)?;
        guard.request_reschedule(cores);
        Ok(())
    }

    /// Pauses or resumes another thread of the caller's process.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidHandle`] for the caller itself or a thread of another process.
    /// * [`KernelResult::InvalidState`] when pausing a paused thread or resuming a running one.
    pub fn set_thread_activity(&self, caller: ThreadId, id: ThreadId, pause: bool) -> Result<()> {
        let guard = self.critical_section().enter();
        let cores = guard.state().set_activity(caller, id, pause)?;
        guard.request_reschedule(cores);
        Ok(())
    }

    /// # Errors
    /// [`KernelResult::InvalidHandle`] if the thread does not exist.
    pub fn thread_info(&self, id: ThreadId) -> Result<ThreadInfo> {
        self.critical_section()
            .with_lock(|state| state.thread(id).map(ThreadRecord::info))
    }

    /// The host handle of a live thread, for the JIT side.
    ///
    /// # Errors
    /// [`KernelResult::InvalidHandle`] if the thread does not exist.
    pub fn guest_thread(&self, id: ThreadId) -> Result<GuestThread> {
        self.critical_section()
            .with_lock(|state| state.thread(id).map(|t| t.handle.clone()))
    }

    /// # Errors
    /// [`KernelResult::InvalidHandle`] if the process does not exist.
    pub fn process_info(&self, id: ProcessId) -> Result<ProcessInfo> {
        self.critical_section()
            .with_lock(|state| state.process(id).map(ProcessRecord::info))
    }

    /// Threads of a process in creation order.
    ///
    /// # Errors
    /// [`KernelResult::InvalidHandle`] if the process does not exist.
    pub fn process_threads(&self, id: ProcessId) -> Result<Vec<ThreadId>> {
        self.critical_section().with_lock(|state| {
            state
                .process(id)
                .map(|p| p.threads.iter().copied().collect())
        })
    }

    /// The resource limit a process is charged against.
    ///
    /// # Errors
    /// [`KernelResult::InvalidHandle`] if the process does not exist.
    pub fn resource_limit(&self, id: ProcessId) -> Result<Arc<ResourceLimit>> {
        self.critical_section()
            .with_lock(|state| state.process(id).map(|p| p.limit.clone()))
    }
}
