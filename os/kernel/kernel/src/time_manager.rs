//! Deadline wake-ups for timed waits and sleeps.
//!
//! Every bounded wait registers `(deadline, thread)`. One host thread sleeps
//! until the earliest deadline and then, under the critical section, wakes
//! every thread whose deadline has passed with [`KernelResult::TimedOut`]
//! (or success for a plain sleep).

use crate::context::KernelContext;
use crate::ids::ThreadId;
use crate::state::KernelState;
use crate::thread::ThreadState;
use kernel_info::KernelResult;
use log::{debug, trace};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Pending deadlines, at most one per thread.
#[derive(Debug, Default)]
pub(crate) struct TimeQueue {
    by_deadline: BTreeSet<(Instant, ThreadId)>,
    by_thread: HashMap<ThreadId, Instant>,
}

impl TimeQueue {
    pub fn len(&self) -> usize {
        self.by_thread.len()
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.by_thread.contains_key(&thread)
    }

    /// Registers `deadline` for `thread`, replacing an earlier registration.
    pub fn insert(&mut self, thread: ThreadId, deadline: Instant) {
        if let Some(old) = self.by_thread.insert(thread, deadline) {
            self.by_deadline.remove(&(old, thread));
        }
        self.by_deadline.insert((deadline, thread));
    }

    pub fn remove(&mut self, thread: ThreadId) -> bool {
        match self.by_thread.remove(&thread) {
            Some(deadline) => self.by_deadline.remove(&(deadline, thread)),
            None => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.first().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every thread whose deadline is not after `now`,
    /// earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<ThreadId> {
        let mut expired = Vec::new();
        while let Some(&(deadline, thread)) = self.by_deadline.first() {
            if deadline > now {
                break;
            }
            self.by_deadline.pop_first();
            self.by_thread.remove(&thread);
            expired.push(thread);
        }
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = (Instant, ThreadId)> + '_ {
        self.by_deadline.iter().copied()
    }
}

/// Turns a relative guest timeout into an absolute deadline.
///
/// `None` for a timeout too large to represent, which is then treated as infinite.
pub(crate) fn deadline_after(now: Instant, nanos: i64) -> Option<Instant> {
    let nanos = u64::try_from(nanos).ok()?;
    now.checked_add(Duration::from_nanos(nanos))
}

impl KernelState {
    /// Wakes every thread whose deadline passed and returns the cores to reschedule.
    pub fn expire_timers(&mut self, now: Instant) -> kernel_sync::CoreMask {
        let mut cores = 0;
        for thread in self.timers.pop_expired(now) {
            let result = match self.threads.get(&thread).map(|t| t.state) {
                Some(ThreadState::WaitingTimer) => Ok(0),
                Some(ThreadState::WaitingSync) => Err(KernelResult::TimedOut),
                _ => continue,
            };
            trace!("{thread}: deadline expired");
            cores |= self.wake_thread(thread, result);
        }
        cores
    }
}

impl KernelContext {
    /// Registers a deadline and makes sure the time manager sees it.
    pub(crate) fn arm_timer(&self, state: &mut KernelState, thread: ThreadId, deadline: Instant) {
        state.timers.insert(thread, deadline);
        self.timer_event().set();
    }
}

/// Body of the time manager host thread.
pub(crate) fn run_time_manager(ctx: &KernelContext) {
    debug!("time manager running");
    let event = ctx.timer_event();
    loop {
        event.reset();
        if ctx.is_shutting_down() {
            break;
        }
        let next = {
            let guard = ctx.critical_section().enter();
            let mut state = guard.state();
            let cores = state.expire_timers(Instant::now());
            let next = state.timers.next_deadline();
            drop(state);
            guard.request_reschedule(cores);
            next
        };
        match next {
            Some(deadline) => {
                event.wait_until(deadline);
            }
            None => event.wait(),
        }
    }
    debug!("time manager stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: u64) -> ThreadId {
        ThreadId::new(n)
    }

    #[test]
    fn expires_in_deadline_order() {
        let now = Instant::now();
        let mut q = TimeQueue::default();
        q.insert(t(1), now + Duration::from_millis(30));
        q.insert(t(2), now + Duration::from_millis(10));
        q.insert(t(3), now + Duration::from_millis(20));
        assert_eq!(q.next_deadline(), Some(now + Duration::from_millis(10)));
        assert_eq!(q.pop_expired(now + Duration::from_millis(25)), vec![t(2), t(3)]);
        assert_eq!(q.len(), 1);
        assert!(q.contains(t(1)));
    }

    #[test]
    fn reinsert_replaces_deadline() {
        let now = Instant::now();
        let mut q = TimeQueue::default();
        q.insert(t(1), now + Duration::from_secs(10));
        q.insert(t(1), now);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_expired(now), vec![t(1)]);
        assert!(q.next_deadline().is_none());
    }

    #[test]
    fn removed_entries_never_fire() {
        let now = Instant::now();
        let mut q = TimeQueue::default();
        q.insert(t(1), now);
        assert!(q.remove(t(1)));
        assert!(!q.remove(t(1)));
        assert!(q.pop_expired(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn huge_timeouts_are_infinite() {
        let now = Instant::now();
        assert!(deadline_after(now, -1).is_none());
        assert_eq!(deadline_after(now, 5), Some(now + Duration::from_nanos(5)));
    }
}
