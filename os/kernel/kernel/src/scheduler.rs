//! Per-core thread selection and dispatch.
//!
//! Selection runs every time the critical section is released: each core's
//! current thread becomes the head of its best non-empty bucket. Cores whose
//! selection changed get a batch of transitions and their dispatcher host
//! thread is woken to hand them to the execution contexts.
//!
//! A core left without work pulls over a thread that may run on it and waits
//! on another core. Preemption ticks and the load-balancing yields migrate
//! waiting threads the same way; threads of priority 0 and 1 stay put.
//!
//! ```text
//!  syscall / HLE / timer            release handler              dispatcher (core n)
//!  ─────────────────────            ───────────────              ───────────────────
//!  enter CS, mutate state  ──────▶  select_threads()   ──set──▶  take transitions
//!  leave CS                         queue transitions            suspend / resume
//! ```

use crate::context::KernelContext;
use crate::ids::ThreadId;
use crate::state::KernelState;
use crate::thread::{GuestThread, ThreadState};
use kernel_info::scheduling::{
    ALL_CORES_MASK, CPU_CORES_COUNT, IDLE_PRIORITY, LOAD_BALANCING_MIN_PRIORITY, core_bit,
};
use kernel_sync::{CoreMask, HostEvent, ReleaseHandler};
use log::{debug, error, trace};
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Instant;

pub(crate) fn cores_in(mask: CoreMask) -> impl Iterator<Item = usize> {
    (0..CPU_CORES_COUNT).filter(move |core| mask & core_bit(*core) != 0)
}

/// One scheduling decision for one thread: run on a core, or stop.
#[derive(Debug, Clone)]
pub(crate) struct Transition {
    pub thread: GuestThread,
    pub seq: u64,
    pub run_on: Option<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct CoreSlot {
    pub current: Option<GuestThread>,
    pub switches: u64,
    pub last_switch: Option<Instant>,
    /// Decisions not yet picked up by the core's dispatcher.
    pub transitions: Vec<Transition>,
}

/// Scheduling counters of one core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CoreStats {
    pub core: usize,
    pub current: Option<ThreadId>,
    /// Priority of the current thread, [`IDLE_PRIORITY`] when idle.
    pub current_priority: u8,
    pub switches: u64,
    pub last_switch: Option<Instant>,
}

impl CoreStats {
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.current.is_none()
    }
}

impl KernelState {
    /// Points every core's slot at the head of its queue.
    ///
    /// Returns the cores whose current thread changed.
    pub fn select_threads(&mut self) -> CoreMask {
        self.balance_idle_cores();
        let selected: [Option<ThreadId>; CPU_CORES_COUNT] =
            std::array::from_fn(|core| self.queue.select_next(core));

        let mut changed: CoreMask = 0;
        for (core, next) in selected.iter().enumerate() {
            let current = self.cores[core].current.as_ref().map(GuestThread::id);
            if current == *next {
                // Blocked and woken again within one section: still the current thread.
                if let Some(id) = current
                    && let Some(thread) = self.threads.get_mut(&id)
                    && thread.state == ThreadState::Ready
                {
                    thread.state = ThreadState::Running;
                }
            } else {
                changed |= core_bit(core);
            }
        }
        if changed == 0 {
            return 0;
        }

        // Outgoing decisions are numbered before incoming ones, so a thread
        // moving between cores ends up resumed whichever dispatcher runs first.
        for core in cores_in(changed) {
            let Some(old) = self.cores[core].current.take() else {
                continue;
            };
            if !selected.contains(&Some(old.id()))
                && let Some(thread) = self.threads.get_mut(&old.id())
                && thread.state == ThreadState::Running
            {
                thread.state = ThreadState::Ready;
            }
            let seq = self.next_dispatch_seq();
            self.cores[core].transitions.push(Transition {
                thread: old,
                seq,
                run_on: None,
            });
        }

        let now = Instant::now();
        for core in cores_in(changed) {
            let incoming = match selected[core] {
                Some(id) => {
                    let Some(thread) = self.threads.get_mut(&id) else {
                        error!("{id} is queued on core {core} but has no record");
                        panic!("{id} is queued on core {core} but has no record");
                    };
                    thread.state = ThreadState::Running;
                    thread.last_scheduled = Some(now);
                    Some(thread.handle.clone())
                }
                None => None,
            };
            let seq = self.next_dispatch_seq();
            let slot = &mut self.cores[core];
            slot.switches += 1;
            slot.last_switch = Some(now);
            match incoming {
                Some(thread) => {
                    trace!("core {core}: switching to {}", thread.id());
                    slot.transitions.push(Transition {
                        thread: thread.clone(),
                        seq,
                        run_on: Some(core),
                    });
                    slot.current = Some(thread);
                }
                None => trace!("core {core}: idle"),
            }
        }
        changed
    }

    /// Moves each core's current thread behind its equal-priority peers and
    /// pulls over threads of other cores that have waited longer. A thread
    /// moves at most once per tick.
    pub fn rotate_current_threads(&mut self) -> CoreMask {
        let mut moved = Vec::new();
        for core in 0..CPU_CORES_COUNT {
            let Some(current) = self.cores[core].current.as_ref().map(GuestThread::id) else {
                continue;
            };
            let Some(slot) = self.queue.slot(current).filter(|slot| slot.core == core) else {
                continue;
            };
            let priority = slot.priority;
            self.queue.rotate(core, priority);
            let next = self.queue.bucket(core, priority).next().unwrap_or(current);
            let next_scheduled = self.last_scheduled(next);

            let worth_moving = |state: &Self, moved: &[ThreadId], candidate: ThreadId| {
                !moved.contains(&candidate)
                    && (next == current || next_scheduled >= state.last_scheduled(candidate))
            };
            let peer = self
                .migration_candidates(core)
                .into_iter()
                .find(|(t, p)| *p == priority && worth_moving(self, &moved, *t));
            if let Some((dst, _)) = peer {
                self.transfer_to_core(dst, core);
                moved.push(dst);
            }

            let Some(best) = self.head_priority(core).filter(|best| *best >= priority) else {
                continue;
            };
            let better = self
                .migration_candidates(core)
                .into_iter()
                .find(|(t, p)| *p < best && worth_moving(self, &moved, *t));
            if let Some((dst, _)) = better {
                self.transfer_to_core(dst, core);
                moved.push(dst);
            }
        }
        ALL_CORES_MASK
    }

    /// Sends a runnable thread to the back of its bucket.
    pub fn yield_thread(&mut self, id: ThreadId) -> CoreMask {
        match self.queue.slot(id) {
            Some(slot) => {
                self.queue.move_to_back(id);
                core_bit(slot.core)
            }
            None => 0,
        }
    }

    /// Yields like [`yield_thread`](Self::yield_thread), then pulls over a
    /// thread of at least the caller's priority that waits on another core.
    pub fn yield_with_load_balancing(&mut self, id: ThreadId) -> CoreMask {
        let Some(slot) = self.queue.slot(id) else {
            return 0;
        };
        let (core, priority) = (slot.core, slot.priority);
        self.queue.move_to_back(id);
        let next = self.queue.bucket(core, priority).next().unwrap_or(id);
        let next_scheduled = self.last_scheduled(next);

        let dst = self
            .migration_candidates(core)
            .into_iter()
            .filter(|(t, p)| self.last_scheduled(*t) <= next_scheduled || *p < priority)
            .find(|(_, p)| *p <= priority);
        core_bit(core) | dst.map_or(0, |(dst, _)| self.transfer_to_core(dst, core))
    }

    /// Gives the caller's core up to any thread. A core left empty pulls over
    /// a waiting thread of another core. The caller moves to a core of its
    /// mask where it preempts nobody, or back behind its own core's threads
    /// when there is none.
    pub fn yield_to_any_thread(&mut self, id: ThreadId) -> CoreMask {
        let Some(slot) = self.queue.remove(id) else {
            return 0;
        };
        let (core, priority) = (slot.core, slot.priority);
        let mut cores = core_bit(core);

        if self.queue.select_next(core).is_none() {
            let pulled = self
                .suggested_threads(core)
                .into_iter()
                .find(|t| !self.is_head(*t));
            if let Some(pulled) = pulled
                && self
                    .queue
                    .slot(pulled)
                    .and_then(|s| self.head_priority(s.core))
                    .is_none_or(|p| p >= LOAD_BALANCING_MIN_PRIORITY)
            {
                cores |= self.transfer_to_core(pulled, core);
            }
        }

        let affinity = self.threads.get(&id).map_or(0, |t| t.affinity);
        let target = cores_in(affinity)
            .filter(|c| *c != core)
            .filter(|c| self.head_priority(*c).is_none_or(|p| p <= priority))
            .min_by_key(|c| Reverse(self.head_priority(*c).map_or(u16::MAX, u16::from)))
            .unwrap_or(core);
        self.queue.enqueue(id, target, priority);
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.active_core = target;
        }
        if target != core {
            trace!("{id} yields core {core} and moves to core {target}");
        }
        cores | core_bit(target)
    }

    /// Lets every core without work pull over a thread that may run on it.
    ///
    /// A thread that waits on its own core is taken first. When every
    /// candidate is running, one whose core has a second thread to run moves
    /// over and leaves its old core to that thread.
    fn balance_idle_cores(&mut self) {
        for core in 0..CPU_CORES_COUNT {
            if self.queue.select_next(core).is_some() {
                continue;
            }
            let mut running_on = Vec::new();
            let mut waiting = None;
            for candidate in self.suggested_threads(core) {
                match self.queue.slot(candidate) {
                    Some(slot) if self.is_head(candidate) => running_on.push(slot.core),
                    Some(slot) => {
                        waiting = Some((candidate, slot.priority));
                        break;
                    }
                    None => {}
                }
            }
            if let Some((candidate, priority)) = waiting {
                if priority >= LOAD_BALANCING_MIN_PRIORITY {
                    self.transfer_to_core(candidate, core);
                }
                continue;
            }
            let source = running_on
                .into_iter()
                .find(|source| self.queue.scheduled(*source).nth(1).is_some());
            if let Some(head) = source.and_then(|source| self.queue.select_next(source)) {
                self.transfer_to_core(head, core);
            }
        }
    }

    /// Threads queued on other cores whose mask allows `core`, best priority first.
    fn suggested_threads(&self, core: usize) -> Vec<ThreadId> {
        self.queue
            .queued_elsewhere(core)
            .filter(|t| {
                self.threads
                    .get(t)
                    .is_some_and(|r| r.affinity & core_bit(core) != 0)
            })
            .collect()
    }

    /// Suggested threads that wait on their core, with their priorities.
    /// Cores running a thread of a priority below
    /// [`LOAD_BALANCING_MIN_PRIORITY`] give nothing away.
    fn migration_candidates(&self, core: usize) -> Vec<(ThreadId, u8)> {
        self.suggested_threads(core)
            .into_iter()
            .filter_map(|t| self.queue.slot(t).map(|slot| (t, slot)))
            .filter(|(t, slot)| {
                !self.is_head(*t)
                    && self
                        .head_priority(slot.core)
                        .is_none_or(|p| p >= LOAD_BALANCING_MIN_PRIORITY)
            })
            .map(|(t, slot)| (t, slot.priority))
            .collect()
    }

    /// Whether `id` is the thread its core selects.
    fn is_head(&self, id: ThreadId) -> bool {
        self.queue
            .slot(id)
            .is_some_and(|slot| self.queue.select_next(slot.core) == Some(id))
    }

    fn head_priority(&self, core: usize) -> Option<u8> {
        self.queue
            .select_next(core)
            .and_then(|t| self.queue.slot(t))
            .map(|slot| slot.priority)
    }

    fn last_scheduled(&self, id: ThreadId) -> Option<Instant> {
        self.threads.get(&id).and_then(|t| t.last_scheduled)
    }

    /// Moves a queued thread to `core`, returning both cores involved.
    fn transfer_to_core(&mut self, id: ThreadId, core: usize) -> CoreMask {
        let Some(from) = self.queue.transfer(id, core) else {
            return 0;
        };
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.active_core = core;
        }
        trace!("{id} moves from core {} to core {core}", from.core);
        core_bit(from.core) | core_bit(core)
    }

    pub fn core_stats(&self, core: usize) -> CoreStats {
        let slot = &self.cores[core];
        let current = slot.current.as_ref().map(GuestThread::id);
        CoreStats {
            core,
            current,
            current_priority: current
                .and_then(|id| self.threads.get(&id))
                .map_or(IDLE_PRIORITY, |t| t.priority),
            switches: slot.switches,
            last_switch: slot.last_switch,
        }
    }
}

/// Runs selection when the critical section is released and wakes the
/// dispatchers of the affected cores afterwards.
pub(crate) struct Reschedule {
    events: Arc<[HostEvent; CPU_CORES_COUNT]>,
}

impl Reschedule {
    pub const fn new(events: Arc<[HostEvent; CPU_CORES_COUNT]>) -> Self {
        Self { events }
    }
}

impl ReleaseHandler<KernelState> for Reschedule {
    fn before_release(&self, state: &mut KernelState, requested: CoreMask) -> CoreMask {
        state.select_threads() | requested
    }

    fn after_release(&self, cores: CoreMask) {
        for core in cores_in(cores) {
            self.events[core].set();
        }
    }
}

/// Body of the dispatcher host thread of `core`.
///
/// Sleeps until the core is marked, then hands the queued decisions to the
/// execution contexts outside the critical section.
pub(crate) fn run_dispatcher(ctx: &KernelContext, core: usize) {
    debug!("core {core}: dispatcher running");
    let event = ctx.core_event(core);
    loop {
        event.wait_and_reset();
        if ctx.is_shutting_down() {
            break;
        }
        let batch = ctx
            .critical_section()
            .with_lock(|state| std::mem::take(&mut state.cores[core].transitions));
        for transition in batch {
            transition.thread.dispatch(transition.seq, transition.run_on);
        }
    }
    debug!("core {core}: dispatcher stopped");
}

/// Body of the preemption host thread.
pub(crate) fn run_preemption(ctx: &KernelContext) {
    let quantum = ctx.config().preemption_quantum();
    debug!("preemption thread running every {quantum:?}");
    while !ctx.shutdown_event().wait_timeout(quantum) {
        ctx.preemption_tick();
    }
    debug!("preemption thread stopped");
}

impl KernelContext {
    /// Rotates equal-priority threads on every core, as one preemption tick does.
    pub fn preemption_tick(&self) {
        let guard = self.critical_section().enter();
        let cores = guard.state().rotate_current_threads();
        guard.request_reschedule(cores);
    }

    /// The thread currently selected on `core`.
    ///
    /// # Panics
    /// If `core` is not an emulated core.
    #[must_use]
    pub fn current_thread(&self, core: usize) -> Option<ThreadId> {
        self.critical_section()
            .with_lock(|state| state.cores[core].current.as_ref().map(GuestThread::id))
    }

    /// # Panics
    /// If `core` is not an emulated core.
    #[must_use]
    pub fn core_stats(&self, core: usize) -> CoreStats {
        self.critical_section().with_lock(|state| state.core_stats(core))
    }
}
