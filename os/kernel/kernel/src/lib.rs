//! # Guest Kernel
//!
//! A high-level emulation of a console microkernel. Guest code runs in a JIT
//! on host threads; this crate decides which guest thread owns which of the
//! four emulated cores and implements the supervisor calls guest code makes.
//!
//! All kernel state sits behind one reentrant critical section. Operations
//! mutate the state while holding it; leaving the outermost section runs
//! thread selection and wakes the dispatcher threads of cores whose selection
//! changed. The dispatchers then call [`ExecutionContext::resume`] and
//! [`ExecutionContext::suspend`] on the JIT side.
//!
//! ```
//! # use kernel::{Kernel, KernelConfig, NullContextFactory, ProcessCreationInfo};
//! # use std::sync::Arc;
//! let kernel = Kernel::boot(KernelConfig::default(), Arc::new(NullContextFactory))?;
//! let ctx = kernel.context();
//! let process = ctx.create_process(ProcessCreationInfo::new("demo"))?;
//! let main = ctx.start_process(process, 44, 4)?;
//! assert_eq!(ctx.thread_info(main)?.priority, 44);
//! kernel.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod audit;
mod config;
mod context;
mod event;
mod execution;
mod handle_table;
mod ids;
mod lifecycle;
mod memory;
mod priority_queue;
mod process;
mod resource_limit;
mod scheduler;
mod state;
mod svc;
mod sync_object;
mod synchronization;
mod thread;
mod time_manager;

pub use audit::AuditReport;
pub use config::KernelConfig;
pub use context::{BootError, Kernel, KernelContext};
pub use event::{HleSemaphore, WaitableEvent};
pub use execution::{ContextFactory, ExecutionContext, NullContextFactory, ThreadStart};
pub use handle_table::{KernelObject, MAX_HANDLE_TABLE_SIZE};
pub use ids::{ObjectId, ProcessId, ThreadId};
pub use kernel_info::KernelResult;
pub use lifecycle::ThreadParams;
pub use memory::GuestMemoryError;
pub use process::{ProcessCategory, ProcessCreationInfo, ProcessInfo, ProcessState};
pub use resource_limit::{LimitableResource, ResourceLimit};
pub use scheduler::CoreStats;
pub use svc::{InfoType, Svc, ThreadActivity};
pub use sync_object::ResetMode;
pub use thread::{GuestThread, ThreadInfo, ThreadState};
