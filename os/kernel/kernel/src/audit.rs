//! Full-state consistency scan.
//!
//! Walks every structure that can refer to a thread or an object and checks
//! it against the records. Used by tests and, in debug builds, on shutdown.

use crate::context::KernelContext;
use crate::ids::ThreadId;
use crate::state::KernelState;
use crate::thread::GuestThread;
use kernel_info::scheduling::CPU_CORES_COUNT;
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of [`KernelContext::audit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub threads: usize,
    pub processes: usize,
    pub objects: usize,
    pub queued: usize,
    pub timers: usize,
    pub waiters: usize,
    /// Guest DRAM currently handed out to address spaces.
    pub used_dram: u64,
    /// Every thread id some queue, slot, wait list or timer refers to.
    pub referenced_threads: BTreeSet<ThreadId>,
    /// Human-readable descriptions of every broken invariant.
    pub violations: Vec<String>,
}

impl AuditReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    #[must_use]
    pub fn references(&self, thread: ThreadId) -> bool {
        self.referenced_threads.contains(&thread)
    }
}

impl KernelState {
    pub(crate) fn audit(&self) -> AuditReport {
        let mut violations = Vec::new();
        let mut violation = |message: String| violations.push(message);
        let mut referenced = BTreeSet::new();
        let mut waiters = 0;

        if let Err(e) = self.queue.check() {
            violation(e);
        }
        for (thread, slot) in self.queue.iter() {
            referenced.insert(thread);
            match self.threads.get(&thread) {
                None => violation(format!("{thread} is queued but has no record")),
                Some(r) if !r.state.is_runnable() => {
                    violation(format!("{thread} is queued in state {:?}", r.state));
                }
                Some(r) if r.active_core != slot.core || r.priority != slot.priority => {
                    violation(format!("{thread} is queued at {slot:?} but belongs elsewhere"));
                }
                Some(_) => {}
            }
        }
        for (id, record) in &self.threads {
            if record.state.is_runnable() && self.queue.slot(*id).is_none() {
                violation(format!("{id} is {:?} but not queued", record.state));
            }
            if !self.objects.contains_key(&record.object) {
                violation(format!("{id} lost its thread object"));
            }
            if !self
                .processes
                .get(&record.process)
                .is_some_and(|p| p.threads.contains(id))
            {
                violation(format!("{id} is missing from {}", record.process));
            }
        }

        let mut running_on: BTreeMap<ThreadId, usize> = BTreeMap::new();
        for core in 0..CPU_CORES_COUNT {
            let current = self.cores[core].current.as_ref().map(GuestThread::id);
            if current != self.queue.select_next(core) {
                violation(format!("core {core} runs {current:?} but selects another thread"));
            }
            let Some(thread) = current else {
                continue;
            };
            referenced.insert(thread);
            if let Some(other) = running_on.insert(thread, core) {
                violation(format!("{thread} is current on cores {other} and {core}"));
            }
        }

        for (_, thread) in self.timers.iter() {
            referenced.insert(thread);
            if !self.threads.get(&thread).is_some_and(|t| t.state.is_waiting()) {
                violation(format!("{thread} has a timer but is not waiting"));
            }
        }

        for (id, object) in &self.objects {
            if object.is_collectable() {
                violation(format!("{id} is unreferenced but still alive"));
            }
            for waiter in object.waiters() {
                waiters += 1;
                referenced.insert(waiter.thread);
                let listed = self
                    .threads
                    .get(&waiter.thread)
                    .and_then(|t| t.wait.as_ref())
                    .is_some_and(|w| w.objects.contains(id));
                if !listed {
                    violation(format!("{} waits on {id} without a matching wait record", waiter.thread));
                }
            }
        }

        for (pid, process) in &self.processes {
            for thread in &process.threads {
                if !self.threads.contains_key(thread) {
                    violation(format!("{pid} lists {thread}, which has no record"));
                }
            }
            for handle in process.handles.objects() {
                if !self.objects.contains_key(&handle.object()) {
                    violation(format!("{pid} holds a handle to missing {}", handle.object()));
                }
            }
            if let Err(e) = process.memory.verify(&self.slabs) {
                violation(format!("{pid}: {e}"));
            }
        }

        AuditReport {
            threads: self.threads.len(),
            processes: self.processes.len(),
            objects: self.objects.len(),
            queued: self.queue.len(),
            timers: self.timers.len(),
            waiters,
            used_dram: self.frames.used_bytes(),
            referenced_threads: referenced,
            violations,
        }
    }
}

impl KernelContext {
    /// Scans the whole kernel state for dangling references and broken invariants.
    #[must_use]
    pub fn audit(&self) -> AuditReport {
        self.critical_section().with_lock(|state| state.audit())
    }
}
