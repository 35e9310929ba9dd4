//! Guest threads.

use crate::execution::ExecutionContext;
use crate::ids::{ObjectId, ProcessId, ThreadId};
use kernel_info::KernelResult;
use kernel_sync::HostEvent;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Scheduling state of a guest thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// Created, not started yet.
    Initialized,
    /// Queued on its active core, not selected.
    Ready,
    /// Selected as the current thread of its active core.
    Running,
    /// Held back by `SetThreadActivity`.
    Paused,
    /// Blocked on synchronization objects, possibly with a timeout.
    WaitingSync,
    /// Sleeping until a deadline.
    WaitingTimer,
    Terminated,
}

impl ThreadState {
    /// Ready and running threads sit in the priority queue.
    #[inline]
    #[must_use]
    pub const fn is_runnable(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    #[inline]
    #[must_use]
    pub const fn is_waiting(self) -> bool {
        matches!(self, Self::WaitingSync | Self::WaitingTimer)
    }
}

/// Desired and applied host execution state of a thread.
#[derive(Debug, Default)]
struct Gate {
    applied: u64,
    running_on: Option<usize>,
    started: bool,
    terminated: bool,
}

struct ThreadShared {
    id: ThreadId,
    process: ProcessId,
    wake: HostEvent,
    gate: Mutex<Gate>,
    context: Box<dyn ExecutionContext>,
}

/// Cloneable handle to a guest thread, used by the JIT and by HLE code.
#[derive(Clone)]
pub struct GuestThread {
    shared: Arc<ThreadShared>,
}

impl GuestThread {
    pub(crate) fn new(id: ThreadId, process: ProcessId, context: Box<dyn ExecutionContext>) -> Self {
        Self {
            shared: Arc::new(ThreadShared {
                id,
                process,
                wake: HostEvent::new(false),
                gate: Mutex::new(Gate::default()),
                context,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.shared.id
    }

    #[inline]
    #[must_use]
    pub fn process_id(&self) -> ProcessId {
        self.shared.process
    }

    pub(crate) fn wake_event(&self) -> &HostEvent {
        &self.shared.wake
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.shared.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn start(&self) {
        let mut gate = self.gate();
        if gate.started || gate.terminated {
            return;
        }
        gate.started = true;
        self.shared.context.start();
        if let Some(core) = gate.running_on {
            self.shared.context.resume(core);
        }
    }

    /// Applies scheduling decision `seq` unless a newer one was applied already.
    pub(crate) fn dispatch(&self, seq: u64, run_on: Option<usize>) {
        let mut gate = self.gate();
        if gate.terminated || seq <= gate.applied {
            return;
        }
        gate.applied = seq;
        gate.running_on = run_on;
        if !gate.started {
            return;
        }
        match run_on {
            Some(core) => self.shared.context.resume(core),
            None => self.shared.context.suspend(),
        }
    }

    pub(crate) fn terminate(&self) {
        let mut gate = self.gate();
        if gate.terminated {
            return;
        }
        gate.terminated = true;
        gate.running_on = None;
        self.shared.context.terminate();
        drop(gate);
        self.shared.wake.set();
    }
}

impl PartialEq for GuestThread {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for GuestThread {}

impl fmt::Debug for GuestThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestThread")
            .field("id", &self.shared.id)
            .field("process", &self.shared.process)
            .finish_non_exhaustive()
    }
}

/// Objects a blocked thread waits on.
#[derive(Debug, Clone)]
pub(crate) struct WaitRecord {
    pub objects: Vec<ObjectId>,
}

/// Kernel-side bookkeeping of a live thread. Only touched under the critical section.
#[derive(Debug)]
pub(crate) struct ThreadRecord {
    pub handle: GuestThread,
    pub process: ProcessId,
    /// The thread's own synchronization object, signaled on exit.
    pub object: ObjectId,
    pub state: ThreadState,
    pub priority: u8,
    pub preferred_core: usize,
    pub affinity: u64,
    pub active_core: usize,
    pub paused: bool,
    pub pending_cancel: bool,
    pub wait: Option<WaitRecord>,
    pub wait_result: Option<Result<usize, KernelResult>>,
    pub last_scheduled: Option<Instant>,
}

impl ThreadRecord {
    pub fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.handle.id(),
            process: self.process,
            state: self.state,
            priority: self.priority,
            preferred_core: self.preferred_core,
            affinity: self.affinity,
            active_core: self.active_core,
            paused: self.paused,
            last_scheduled: self.last_scheduled,
        }
    }
}

/// Snapshot of a thread's scheduling attributes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub process: ProcessId,
    pub state: ThreadState,
    pub priority: u8,
    pub preferred_core: usize,
    pub affinity: u64,
    pub active_core: usize,
    pub paused: bool,
    pub last_scheduled: Option<Instant>,
}
