#![allow(dead_code)]

use kernel::{
    ContextFactory, ExecutionContext, Kernel, KernelConfig, KernelContext, ProcessCreationInfo,
    ProcessId, ThreadId, ThreadParams, ThreadStart,
};
use kernel_log::HostLogger;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

pub const PATIENCE: Duration = Duration::from_secs(5);

/// A call the kernel made on an execution context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Call {
    Start,
    Resume(usize),
    Suspend,
    Terminate,
}

/// Every execution context call, in arrival order.
#[derive(Debug, Default)]
pub struct Journal {
    calls: Mutex<Vec<(ThreadId, Call)>>,
    changed: Condvar,
}

impl Journal {
    fn push(&self, thread: ThreadId, call: Call) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((thread, call));
        self.changed.notify_all();
    }

    pub fn calls_of(&self, thread: ThreadId) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(t, _)| *t == thread)
            .map(|(_, c)| *c)
            .collect()
    }

    /// Blocks until `thread` received `call`, giving up after [`PATIENCE`].
    pub fn wait_for(&self, thread: ThreadId, call: Call) -> bool {
        let deadline = Instant::now() + PATIENCE;
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if calls.iter().any(|entry| *entry == (thread, call)) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            calls = self
                .changed
                .wait_timeout(calls, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

struct Recorder {
    thread: ThreadId,
    journal: Arc<Journal>,
}

impl ExecutionContext for Recorder {
    fn start(&self) {
        self.journal.push(self.thread, Call::Start);
    }

    fn resume(&self, core: usize) {
        self.journal.push(self.thread, Call::Resume(core));
    }

    fn suspend(&self) {
        self.journal.push(self.thread, Call::Suspend);
    }

    fn terminate(&self) {
        self.journal.push(self.thread, Call::Terminate);
    }
}

struct RecordingFactory(Arc<Journal>);

impl ContextFactory for RecordingFactory {
    fn create(&self, start: &ThreadStart) -> Box<dyn ExecutionContext> {
        Box::new(Recorder {
            thread: start.thread,
            journal: Arc::clone(&self.0),
        })
    }
}

/// Boots a kernel without the preemption thread; tests tick by hand.
pub fn boot() -> (Kernel, Arc<Journal>) {
    boot_with(KernelConfig::default())
}

/// Like [`boot`] with other tunables; the preemption thread stays off.
pub fn boot_with(config: KernelConfig) -> (Kernel, Arc<Journal>) {
    HostLogger::try_init_for_tests();
    let journal = Arc::new(Journal::default());
    let config = config.with_run_preemption_thread(false);
    let kernel = Kernel::boot(config, Arc::new(RecordingFactory(Arc::clone(&journal))))
        .expect("kernel boots");
    (kernel, journal)
}

pub fn process(ctx: &KernelContext, name: &str) -> ProcessId {
    ctx.create_process(ProcessCreationInfo::new(name))
        .expect("process is created")
}

pub const fn params(priority: u8, core: i32) -> ThreadParams {
    ThreadParams {
        entry: 0x20_0000,
        argument: 0,
        stack_top: 0,
        priority,
        core,
    }
}

/// Creates and starts a thread of `process`.
pub fn spawn(ctx: &KernelContext, process: ProcessId, priority: u8, core: i32) -> ThreadId {
    let id = ctx
        .create_thread(process, params(priority, core))
        .expect("thread is created");
    ctx.start_thread(id).expect("thread starts");
    id
}

/// Polls `condition` until it holds, giving up after [`PATIENCE`].
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
