//! The seam between the scheduler and the JIT.
//!
//! The kernel decides which guest thread runs on which core; the JIT owns
//! how a guest thread actually executes on the host. Each thread gets one
//! [`ExecutionContext`] from the boot-time [`ContextFactory`], and the
//! per-core dispatchers drive it with `resume` and `suspend`.

use crate::ids::{ProcessId, ThreadId};

/// Host-side execution of one guest thread.
///
/// All calls are notifications made outside the critical section. They are
/// delivered in decision order per thread: a stale `suspend` never follows a
/// newer `resume`.
pub trait ExecutionContext: Send + Sync {
    /// The thread was started. Guest code must not run before the first `resume`.
    fn start(&self);

    /// The thread was selected to run on `core`.
    fn resume(&self, core: usize);

    /// The thread lost its core and must stop at the next safe point.
    fn suspend(&self);

    /// The thread is gone; no further calls follow.
    fn terminate(&self);
}

/// What the JIT needs to set up a new guest thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ThreadStart {
    pub thread: ThreadId,
    pub process: ProcessId,
    pub entry: u64,
    pub argument: u64,
    pub stack_top: u64,
    pub priority: u8,
}

/// Creates execution contexts for new guest threads.
pub trait ContextFactory: Send + Sync {
    fn create(&self, start: &ThreadStart) -> Box<dyn ExecutionContext>;
}

/// A factory whose contexts ignore every call. Useful for HLE-only threads.
#[derive(Debug, Default, Copy, Clone)]
pub struct NullContextFactory;

#[derive(Debug)]
struct NullContext;

impl ExecutionContext for NullContext {
    fn start(&self) {}
    fn resume(&self, _core: usize) {}
    fn suspend(&self) {}
    fn terminate(&self) {}
}

impl ContextFactory for NullContextFactory {
    fn create(&self, _start: &ThreadStart) -> Box<dyn ExecutionContext> {
        Box::new(NullContext)
    }
}
