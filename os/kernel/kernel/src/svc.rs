//! Supervisor call handlers.
//!
//! [`Svc`] holds the typed handlers, one method per guest call, bound to the
//! calling thread. [`KernelContext::dispatch_svc`] decodes the register frame
//! the JIT hands over on a trap and calls into them.

mod dispatch;
mod info;

pub use info::InfoType;

use crate::context::KernelContext;
use crate::handle_table::KernelObject;
use crate::ids::{ObjectId, ThreadId};
use crate::lifecycle::ThreadParams;
use crate::thread::GuestThread;
use kernel_info::KernelResult;
use kernel_info::scheduling::{MAX_WAIT_OBJECTS, PRIORITIES_COUNT};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{MemoryInfo, MemoryPermission};
use log::debug;

type Result<T> = core::result::Result<T, KernelResult>;

/// Argument of `SetThreadActivity`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadActivity {
    Runnable = 0,
    Paused = 1,
}

impl TryFrom<u32> for ThreadActivity {
    type Error = KernelResult;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Runnable),
            1 => Ok(Self::Paused),
            _ => Err(KernelResult::InvalidEnumValue),
        }
    }
}

fn parse_priority(value: u32) -> Result<u8> {
    u8::try_from(value)
        .ok()
        .filter(|p| usize::from(*p) < PRIORITIES_COUNT)
        .ok_or(KernelResult::InvalidPriority)
}

/// The supervisor calls of one guest thread.
pub struct Svc<'k> {
    ctx: &'k KernelContext,
    caller: &'k GuestThread,
}

impl KernelContext {
    /// Binds the typed supervisor call handlers to `caller`.
    #[must_use]
    pub const fn svc<'k>(&'k self, caller: &'k GuestThread) -> Svc<'k> {
        Svc { ctx: self, caller }
    }
}

impl Svc<'_> {
    fn with_state<R>(&self, f: impl FnOnce(&mut crate::state::KernelState) -> Result<R>) -> Result<R> {
        self.ctx.critical_section().with_lock(f)
    }

    fn thread_of(&self, handle: u32) -> Result<ThreadId> {
        let caller = self.caller.id();
        self.with_state(|state| state.resolve_thread(caller, handle))
    }

    pub fn set_heap_size(&self, size: u64) -> Result<u64> {
        self.ctx.set_heap_size(self.caller.process_id(), size)
    }

    pub fn set_memory_permission(&self, address: u64, size: u64, permission: u32) -> Result<()> {
        let permission =
            MemoryPermission::from_bits(permission).ok_or(KernelResult::InvalidPermission)?;
        self.ctx
            .protect_memory(self.caller.process_id(), address, size, permission)
    }

    pub fn map_memory(&self, dst: u64, src: u64, size: u64) -> Result<()> {
        self.ctx.map_memory(self.caller.process_id(), dst, src, size)
    }

    pub fn unmap_memory(&self, dst: u64, src: u64, size: u64) -> Result<()> {
        self.ctx.unmap_memory(self.caller.process_id(), dst, src, size)
    }

    /// Describes the block at `address` and stores the guest structure at `out`.
    pub fn query_memory(&self, out: u64, address: u64) -> Result<MemoryInfo> {
        let process = self.caller.process_id();
        let info = self.ctx.query_memory(process, address)?;
        self.ctx
            .write_memory(process, out, &info.to_guest_bytes())?;
        Ok(info)
    }

    pub fn exit_process(&self) -> Result<()> {
        self.ctx.terminate_process(self.caller.process_id())
    }

    /// Creates a thread of the caller's process and returns its handle.
    pub fn create_thread(
        &self,
        entry: u64,
        argument: u64,
        stack_top: u64,
        priority: u32,
        core: i32,
    ) -> Result<u32> {
        let process = self.caller.process_id();
        let params = ThreadParams {
            entry,
            argument,
            stack_top,
            priority: parse_priority(priority)?,
            core,
        };
        let guard = self.ctx.critical_section().enter();
        let mut state = guard.state();
        let thread = self.ctx.create_thread_locked(&mut state, process, params)?;
        let object = state.thread(thread.id())?.object;
        match state.install_handle(process, KernelObject::Thread(object)) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let removed = state.remove_thread(thread.id());
                guard.request_reschedule(removed.cores);
                drop(state);
                drop(guard);
                for t in removed.threads {
                    t.terminate();
                }
                Err(e)
            }
        }
    }

    pub fn start_thread(&self, handle: u32) -> Result<()> {
        let thread = self.thread_of(handle)?;
        self.ctx.start_thread(thread)
    }

    pub fn exit_thread(&self) {
        self.ctx.exit_thread(self.caller);
    }

    pub fn sleep_thread(&self, nanos: i64) -> Result<()> {
        self.ctx.sleep_thread(self.caller, nanos)
    }

    pub fn get_thread_priority(&self, handle: u32) -> Result<u32> {
        let caller = self.caller.id();
        self.with_state(|state| {
            let thread = state.resolve_thread(caller, handle)?;
            Ok(u32::from(state.thread(thread)?.priority))
        })
    }

    pub fn set_thread_priority(&self, handle: u32, priority: u32) -> Result<()> {
        let priority = parse_priority(priority)?;
        let thread = self.thread_of(handle)?;
        self.ctx.set_thread_priority(thread, priority)
    }

    /// Returns `(preferred core, affinity mask)`.
    pub fn get_thread_core_mask(&self, handle: u32) -> Result<(i32, u64)> {
        let caller = self.caller.id();
        self.with_state(|state| {
            let thread = state.thread(state.resolve_thread(caller, handle)?)?;
            let core = i32::try_from(thread.preferred_core).map_err(|_| KernelResult::InvalidCoreId)?;
            Ok((core, thread.affinity))
        })
    }

    pub fn set_thread_core_mask(&self, handle: u32, core: i32, mask: u64) -> Result<()> {
        let thread = self.thread_of(handle)?;
        self.ctx.set_thread_core_mask(thread, core, mask)
    }

    pub fn get_current_processor_number(&self) -> Result<u32> {
        let caller = self.caller.id();
        self.with_state(|state| {
            let core = state.thread(caller)?.active_core;
            u32::try_from(core).map_err(|_| KernelResult::InvalidCoreId)
        })
    }

    /// Signals an event through its writable handle.
    pub fn signal_event(&self, handle: u32) -> Result<()> {
        let caller = self.caller.id();
        let guard = self.ctx.critical_section().enter();
        let mut state = guard.state();
        let KernelObject::WritableEvent(object) = state.resolve_handle(caller, handle)? else {
            return Err(KernelResult::InvalidHandle);
        };
        let cores = state.signal_object(object, 1)?;
        guard.request_reschedule(cores);
        Ok(())
    }

    /// Clears an event through either of its handles.
    pub fn clear_event(&self, handle: u32) -> Result<()> {
        let caller = self.caller.id();
        self.with_state(|state| match state.resolve_handle(caller, handle)? {
            KernelObject::WritableEvent(object) | KernelObject::ReadableEvent(object) => state
                .objects
                .get_mut(&object)
                .ok_or(KernelResult::InvalidHandle)?
                .clear(),
            _ => Err(KernelResult::InvalidHandle),
        })
    }

    pub fn close_handle(&self, handle: u32) -> Result<()> {
        let process = self.caller.process_id();
        self.with_state(|state| state.close_handle(process, handle))
    }

    /// Clears the signal of a readable event or a process.
    pub fn reset_signal(&self, handle: u32) -> Result<()> {
        let caller = self.caller.id();
        self.with_state(|state| match state.resolve_handle(caller, handle)? {
            KernelObject::ReadableEvent(object) | KernelObject::Process(object) => state
                .objects
                .get_mut(&object)
                .ok_or(KernelResult::InvalidHandle)?
                .reset_signal(),
            _ => Err(KernelResult::InvalidHandle),
        })
    }

    /// Waits on up to 64 handles; returns the index of the one that was signaled.
    pub fn wait_synchronization(&self, handles: &[u32], timeout_ns: i64) -> Result<usize> {
        if handles.len() > MAX_WAIT_OBJECTS {
            return Err(KernelResult::MaximumExceeded);
        }
        let caller = self.caller.id();
        self.ctx.wait_with(self.caller, timeout_ns, |state| {
            resolve_waitables(state, caller, handles)
        })
    }

    /// [`wait_synchronization`](Self::wait_synchronization) with the handle
    /// array read from guest memory at `handles`.
    pub fn wait_synchronization_at(&self, handles: u64, count: u32, timeout_ns: i64) -> Result<usize> {
        let count = usize::try_from(count).map_err(|_| KernelResult::MaximumExceeded)?;
        if count > MAX_WAIT_OBJECTS {
            return Err(KernelResult::MaximumExceeded);
        }
        let caller = self.caller.id();
        let process = self.caller.process_id();
        self.ctx.wait_with(self.caller, timeout_ns, |state| {
            let mut raw = vec![0u8; count * 4];
            state.read_guest(process, VirtualAddress::new(handles), &mut raw)?;
            let handles: Vec<u32> = raw
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            resolve_waitables(state, caller, &handles)
        })
    }

    pub fn cancel_synchronization(&self, handle: u32) -> Result<()> {
        let caller = self.caller.id();
        let guard = self.ctx.critical_section().enter();
        let mut state = guard.state();
        let thread = state.resolve_thread(caller, handle)?;
        let cores = state.cancel_synchronization(thread)?;
        guard.request_reschedule(cores);
        Ok(())
    }

    pub fn get_thread_id(&self, handle: u32) -> Result<u64> {
        self.thread_of(handle).map(ThreadId::as_u64)
    }

    pub fn get_info(&self, id: u32, handle: u32, sub_id: u64) -> Result<u64> {
        let info = InfoType::try_from(id)?;
        if sub_id != 0 {
            return Err(KernelResult::InvalidCombination);
        }
        let caller = self.caller.id();
        let dram = self.ctx.config().dram_size();
        self.with_state(|state| {
            let process = state.process(state.resolve_process(caller, handle)?)?;
            Ok(info.query(process, dram))
        })
    }

    pub fn set_thread_activity(&self, handle: u32, activity: u32) -> Result<()> {
        let activity = ThreadActivity::try_from(activity)?;
        let thread = self.thread_of(handle)?;
        self.ctx
            .set_thread_activity(self.caller.id(), thread, activity == ThreadActivity::Paused)
    }

    /// Creates an event and returns `(writable, readable)` handles.
    pub fn create_event(&self) -> Result<(u32, u32)> {
        let process = self.caller.process_id();
        self.with_state(|state| state.create_event_pair(process))
    }

    pub fn terminate_process(&self, handle: u32) -> Result<()> {
        let caller = self.caller.id();
        let process = self.with_state(|state| state.resolve_process(caller, handle))?;
        debug!("{caller} terminates {process}");
        self.ctx.terminate_process(process)
    }
}

fn resolve_waitables(
    state: &crate::state::KernelState,
    caller: ThreadId,
    handles: &[u32],
) -> Result<Vec<ObjectId>> {
    handles
        .iter()
        .map(|handle| {
            let object = state.resolve_handle(caller, *handle)?;
            if object.is_waitable() && state.objects.contains_key(&object.object()) {
                Ok(object.object())
            } else {
                Err(KernelResult::InvalidHandle)
            }
        })
        .collect()
}
