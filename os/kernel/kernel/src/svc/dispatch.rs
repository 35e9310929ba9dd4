use crate::context::KernelContext;
use crate::thread::GuestThread;
use kernel_info::KernelResult;
use kernel_info::result::result_code;
use kernel_syscall::{SvcFrame, Sysno, UnknownSyscall};
use log::{debug, trace, warn};

impl KernelContext {
    /// Runs supervisor call `number` for `caller` on its argument registers.
    ///
    /// The result code lands in `w0` and outputs in `x1` and up, except for
    /// `GetCurrentProcessorNumber`, which returns the core in `x0`. Blocking
    /// calls return only once the caller is woken.
    ///
    /// # Errors
    /// [`UnknownSyscall`] for a call number the kernel does not implement; the
    /// frame is left untouched then.
    pub fn dispatch_svc(
        &self,
        caller: &GuestThread,
        number: u32,
        frame: &mut SvcFrame,
    ) -> Result<Sysno, UnknownSyscall> {
        let sysno = Sysno::try_from(number)
            .inspect_err(|e| warn!("{}: {e}", caller.id()))?;
        trace!("{}: {sysno:?}", caller.id());
        let svc = self.svc(caller);
        let f = &mut *frame;
        let result: Result<(), KernelResult> = match sysno {
            Sysno::SetHeapSize => svc.set_heap_size(f.arg(1)).map(|a| f.set_output(1, a)),
            Sysno::SetMemoryPermission => {
                svc.set_memory_permission(f.arg(0), f.arg(1), f.arg_u32(2))
            }
            Sysno::MapMemory => svc.map_memory(f.arg(0), f.arg(1), f.arg(2)),
            Sysno::UnmapMemory => svc.unmap_memory(f.arg(0), f.arg(1), f.arg(2)),
            Sysno::QueryMemory => svc
                .query_memory(f.arg(0), f.arg(2))
                .map(|_| f.set_output(1, 0)),
            Sysno::ExitProcess => svc.exit_process(),
            Sysno::CreateThread => svc
                .create_thread(f.arg(1), f.arg(2), f.arg(3), f.arg_u32(4), f.arg_i32(5))
                .map(|h| f.set_output(1, u64::from(h))),
            Sysno::StartThread => svc.start_thread(f.arg_u32(0)),
            Sysno::ExitThread => {
                svc.exit_thread();
                Ok(())
            }
            Sysno::SleepThread => svc.sleep_thread(f.arg_i64(0)),
            Sysno::GetThreadPriority => svc
                .get_thread_priority(f.arg_u32(1))
                .map(|p| f.set_output(1, u64::from(p))),
            Sysno::SetThreadPriority => svc.set_thread_priority(f.arg_u32(0), f.arg_u32(1)),
            Sysno::GetThreadCoreMask => {
                svc.get_thread_core_mask(f.arg_u32(2)).map(|(core, mask)| {
                    f.set_output(1, u64::from(core.cast_unsigned()));
                    f.set_output(2, mask);
                })
            }
            Sysno::SetThreadCoreMask => {
                svc.set_thread_core_mask(f.arg_u32(0), f.arg_i32(1), f.arg(2))
            }
            Sysno::GetCurrentProcessorNumber => {
                let core = svc.get_current_processor_number().unwrap_or(0);
                f.set_output(0, u64::from(core));
                return Ok(sysno);
            }
            Sysno::SignalEvent => svc.signal_event(f.arg_u32(0)),
            Sysno::ClearEvent => svc.clear_event(f.arg_u32(0)),
            Sysno::CloseHandle => svc.close_handle(f.arg_u32(0)),
            Sysno::ResetSignal => svc.reset_signal(f.arg_u32(0)),
            Sysno::WaitSynchronization => svc
                .wait_synchronization_at(f.arg(1), f.arg_u32(2), f.arg_i64(3))
                .map(|index| f.set_output(1, index as u64)),
            Sysno::CancelSynchronization => svc.cancel_synchronization(f.arg_u32(0)),
            Sysno::GetThreadId => svc
                .get_thread_id(f.arg_u32(1))
                .map(|id| f.set_output(1, id)),
            Sysno::GetInfo => svc
                .get_info(f.arg_u32(1), f.arg_u32(2), f.arg(3))
                .map(|v| f.set_output(1, v)),
            Sysno::SetThreadActivity => svc.set_thread_activity(f.arg_u32(0), f.arg_u32(1)),
            Sysno::CreateEvent => svc.create_event().map(|(writable, readable)| {
                f.set_output(1, u64::from(writable));
                f.set_output(2, u64::from(readable));
            }),
            Sysno::TerminateProcess => svc.terminate_process(f.arg_u32(0)),
        };
        if let Err(e) = result {
            debug!("{}: {sysno:?} failed: {e} ({:#x})", caller.id(), e.code());
        }
        frame.set_result(result_code(&result));
        Ok(sysno)
    }
}
