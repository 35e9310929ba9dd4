//! Wait and signal.
//!
//! Checking for a signal and joining the wait lists happen in one critical
//! section, so a signal can never slip in between. A blocked thread sleeps on
//! its host wake event outside the section; whoever ends the wait (signal,
//! timeout, cancel, termination) stores the result in the thread record and
//! sets that event.

use crate::context::KernelContext;
use crate::ids::{ObjectId, ThreadId};
use crate::state::KernelState;
use crate::sync_object::Waiter;
use crate::thread::{GuestThread, ThreadState, WaitRecord};
use crate::time_manager::deadline_after;
use kernel_info::KernelResult;
use kernel_info::scheduling::{YIELD_TO_ANY_THREAD, YIELD_WITH_LOAD_BALANCING};
use kernel_sync::{CoreMask, CriticalSectionGuard};
use log::{error, trace};
use std::time::Instant;

type Result<T> = core::result::Result<T, KernelResult>;

impl KernelState {
    /// Removes `thread` from the wait list of `object`, collecting the object
    /// if that was the last thing keeping it alive.
    pub(crate) fn drop_waiter(&mut self, object: ObjectId, thread: ThreadId) {
        if let Some(o) = self.objects.get_mut(&object) {
            o.remove_waiter(thread);
            self.collect_object(object);
        }
    }

    /// Ends the wait of `id` with `result`: leaves every wait list and the
    /// time queue, becomes runnable again and is woken on the host.
    pub fn wake_thread(&mut self, id: ThreadId, result: Result<usize>) -> CoreMask {
        let Some(thread) = self.threads.get_mut(&id) else {
            return 0;
        };
        if !thread.state.is_waiting() {
            return 0;
        }
        let wait = thread.wait.take();
        thread.wait_result = Some(result);
        let handle = thread.handle.clone();
        for object in wait.into_iter().flat_map(|w| w.objects) {
            self.drop_waiter(object, id);
        }
        self.timers.remove(id);
        let cores = self.make_ready(id);
        handle.wake_event().set();
        cores
    }

    /// Signals `object` and hands the signal to as many waiters as it allows,
    /// best priority first.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidHandle`] if the object is gone.
    /// * [`KernelResult::MaximumExceeded`] if a semaphore would overflow.
    pub fn signal_object(&mut self, object: ObjectId, amount: u32) -> Result<CoreMask> {
        self.objects
            .get_mut(&object)
            .ok_or(KernelResult::InvalidHandle)?
            .signal(amount)?;
        let mut cores = 0;
        loop {
            let Some(o) = self.objects.get_mut(&object) else {
                break;
            };
            let Some(waiter) = o.first_waiter() else {
                break;
            };
            if !o.try_consume_signal() {
                break;
            }
            o.remove_waiter(waiter.thread);
            let index = self
                .threads
                .get(&waiter.thread)
                .and_then(|t| t.wait.as_ref())
                .and_then(|w| w.objects.iter().position(|o| *o == object))
                .unwrap_or(0);
            trace!("{object}: signal delivered to {}", waiter.thread);
            cores |= self.wake_thread(waiter.thread, Ok(index));
        }
        Ok(cores)
    }

    /// Wakes a thread blocked in a synchronization wait with
    /// [`KernelResult::Cancelled`], or arms the cancel for its next wait.
    pub fn cancel_synchronization(&mut self, id: ThreadId) -> Result<CoreMask> {
        let thread = self.thread_mut(id)?;
        if thread.state == ThreadState::WaitingSync {
            return Ok(self.wake_thread(id, Err(KernelResult::Cancelled)));
        }
        thread.pending_cancel = true;
        Ok(0)
    }

    /// Parks `id` until woken. The caller arms a timer if the wait is bounded.
    fn block(&mut self, id: ThreadId, state: ThreadState, objects: Vec<ObjectId>) -> CoreMask {
        let seq = self.next_wait_seq();
        let Some(thread) = self.threads.get_mut(&id) else {
            return 0;
        };
        let waiter = Waiter {
            thread: id,
            priority: thread.priority,
            seq,
        };
        thread.state = state;
        thread.wait_result = None;
        thread.wait = (!objects.is_empty()).then(|| WaitRecord {
            objects: objects.clone(),
        });
        for object in objects {
            if let Some(o) = self.objects.get_mut(&object) {
                o.insert_waiter(waiter);
            }
        }
        self.unschedule(id)
    }
}

/// What a blocking call does once it holds the critical section.
enum Outcome {
    Done(Result<usize>),
    Blocked,
}

impl KernelContext {
    /// Enters the critical section for a call that may block the host thread.
    fn enter_for_blocking(&self) -> CriticalSectionGuard<'_, KernelState> {
        let guard = self.critical_section().enter();
        if guard.depth() > 1 {
            error!("blocking wait entered with the critical section already held");
            panic!("blocking wait entered with the critical section already held");
        }
        guard
    }

    /// Sleeps on the caller's wake event until its wait result is posted.
    ///
    /// A thread woken while paused keeps sleeping until it is resumed; its
    /// result stays posted in the meantime.
    fn await_wake(&self, caller: &GuestThread) -> Result<usize> {
        loop {
            caller.wake_event().wait();
            let guard = self.critical_section().enter();
            let mut state = guard.state();
            let Some(thread) = state.threads.get_mut(&caller.id()) else {
                return Err(KernelResult::ThreadTerminating);
            };
            if thread.state != ThreadState::Paused
                && let Some(result) = thread.wait_result.take()
            {
                return result;
            }
            caller.wake_event().reset();
        }
    }

    fn run_blocking(
        &self,
        caller: &GuestThread,
        attempt: impl FnOnce(&Self, &mut KernelState) -> (Outcome, CoreMask),
    ) -> Result<usize> {
        {
            let guard = self.enter_for_blocking();
            let mut state = guard.state();
            let (outcome, cores) = attempt(self, &mut state);
            guard.request_reschedule(cores);
            match outcome {
                Outcome::Done(result) => return result,
                Outcome::Blocked => caller.wake_event().reset(),
            }
        }
        self.await_wake(caller)
    }

    /// Waits until one of `objects` is signaled, the timeout passes or the
    /// wait is cancelled. `resolve` runs under the critical section and
    /// produces the object list, typically from guest handles.
    ///
    /// A timeout of `0` only polls; a negative timeout waits forever.
    ///
    /// # Errors
    /// * [`KernelResult::TimedOut`] when the deadline passes.
    /// * [`KernelResult::Cancelled`] when cancelled, or a cancel was pending.
    /// * [`KernelResult::ThreadTerminating`] if the caller is being terminated.
    /// * Anything `resolve` returns.
    pub(crate) fn wait_with(
        &self,
        caller: &GuestThread,
        timeout_ns: i64,
        resolve: impl FnOnce(&KernelState) -> Result<Vec<ObjectId>>,
    ) -> Result<usize> {
        let id = caller.id();
        self.run_blocking(caller, |ctx, state| {
            let objects = match resolve(state) {
                Ok(objects) => objects,
                Err(e) => return (Outcome::Done(Err(e)), 0),
            };
            let Some(thread) = state.threads.get_mut(&id) else {
                return (Outcome::Done(Err(KernelResult::ThreadTerminating)), 0);
            };
            if std::mem::take(&mut thread.pending_cancel) {
                return (Outcome::Done(Err(KernelResult::Cancelled)), 0);
            }
            for (index, object) in objects.iter().enumerate() {
                if state
                    .objects
                    .get_mut(object)
                    .is_some_and(|o| o.try_consume_signal())
                {
                    return (Outcome::Done(Ok(index)), 0);
                }
            }
            if timeout_ns == 0 {
                return (Outcome::Done(Err(KernelResult::TimedOut)), 0);
            }
            let cores = state.block(id, ThreadState::WaitingSync, objects);
            if timeout_ns > 0
                && let Some(deadline) = deadline_after(Instant::now(), timeout_ns)
            {
                ctx.arm_timer(state, id, deadline);
            }
            trace!("{id}: waiting, timeout {timeout_ns}ns");
            (Outcome::Blocked, cores)
        })
    }

    /// Waits on kernel objects directly, bypassing handle resolution. Meant
    /// for HLE code that holds a [`WaitableEvent`](crate::WaitableEvent).
    ///
    /// A timeout of `0` only polls; a negative timeout waits forever.
    ///
    /// # Errors
    /// * [`KernelResult::TimedOut`], [`KernelResult::Cancelled`] or
    ///   [`KernelResult::ThreadTerminating`] as for `WaitSynchronization`.
    /// * [`KernelResult::InvalidHandle`] if an object is gone.
    pub fn wait_objects(
        &self,
        caller: &GuestThread,
        objects: &[ObjectId],
        timeout_ns: i64,
    ) -> Result<usize> {
        self.wait_with(caller, timeout_ns, |state| {
            if objects.iter().all(|o| state.objects.contains_key(o)) {
                Ok(objects.to_vec())
            } else {
                Err(KernelResult::InvalidHandle)
            }
        })
    }

    /// Puts the caller to sleep for `ns` nanoseconds.
    ///
    /// Non-positive values yield instead: `-1` also pulls over a waiting
    /// thread from another core, `-2` gives the core up to any thread and
    /// every other value yields to equal-priority threads of the own core.
    ///
    /// # Errors
    /// [`KernelResult::ThreadTerminating`] if the caller is being terminated.
    pub fn sleep_thread(&self, caller: &GuestThread, ns: i64) -> Result<()> {
        let id = caller.id();
        if ns <= 0 {
            let guard = self.critical_section().enter();
            let cores = {
                let mut state = guard.state();
                match ns {
                    YIELD_WITH_LOAD_BALANCING => state.yield_with_load_balancing(id),
                    YIELD_TO_ANY_THREAD => state.yield_to_any_thread(id),
                    _ => state.yield_thread(id),
                }
            };
            guard.request_reschedule(cores);
            return Ok(());
        }
        self.run_blocking(caller, |ctx, state| {
            if !state.threads.contains_key(&id) {
                return (Outcome::Done(Err(KernelResult::ThreadTerminating)), 0);
            }
            let cores = state.block(id, ThreadState::WaitingTimer, Vec::new());
            if let Some(deadline) = deadline_after(Instant::now(), ns) {
                ctx.arm_timer(state, id, deadline);
            }
            (Outcome::Blocked, cores)
        })
        .map(|_| ())
    }

    /// Signals an object from outside the guest, e.g. an HLE service.
    pub(crate) fn signal(&self, object: ObjectId, amount: u32) -> Result<()> {
        let guard = self.critical_section().enter();
        let cores = guard.state().signal_object(object, amount)?;
        guard.request_reschedule(cores);
        Ok(())
    }
}
