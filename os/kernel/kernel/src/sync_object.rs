//! Waitable kernel objects.
//!
//! Every kind answers the same three questions: can a waiter consume the
//! current signal, how does a signal change the object, and in which order
//! are waiters served. The synchronization manager only ever talks to objects
//! through these.

use crate::ids::{ProcessId, ThreadId};
use crate::resource_limit::ResourceLimit;
use kernel_info::KernelResult;
use std::sync::Arc;

/// What happens to an event's signal when a waiter consumes it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResetMode {
    /// The first consumer clears the signal, so a signal wakes one waiter.
    Auto,
    /// The signal stays until cleared, so a signal wakes every waiter.
    Manual,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SyncKind {
    Event { signaled: bool, reset: ResetMode },
    Semaphore { count: u32, max: u32 },
    /// Signaled once the thread has exited.
    Thread { thread: ThreadId, exited: bool },
    /// Signaled on a process state change, i.e. its exit.
    Process { process: ProcessId, signaled: bool },
}

/// A thread blocked on an object, ordered by priority then arrival.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Waiter {
    pub thread: ThreadId,
    pub priority: u8,
    pub seq: u64,
}

impl Waiter {
    #[inline]
    pub const fn ordering(&self) -> (u8, u64) {
        (self.priority, self.seq)
    }
}

#[derive(Debug)]
pub(crate) struct SyncObject {
    pub kind: SyncKind,
    waiters: Vec<Waiter>,
    /// Handles and host-side holders keeping the object alive.
    pub refs: usize,
    /// Limit charged one `Events` unit for this object, returned on collection.
    pub charge: Option<Arc<ResourceLimit>>,
}

impl SyncObject {
    pub const fn new(kind: SyncKind) -> Self {
        Self {
            kind,
            waiters: Vec::new(),
            refs: 0,
            charge: None,
        }
    }

    pub const fn is_signaled(&self) -> bool {
        match self.kind {
            SyncKind::Event { signaled, .. } | SyncKind::Process { signaled, .. } => signaled,
            SyncKind::Semaphore { count, .. } => count > 0,
            SyncKind::Thread { exited, .. } => exited,
        }
    }

    /// Takes the signal for one waiter if there is one.
    pub const fn try_consume_signal(&mut self) -> bool {
        match &mut self.kind {
            SyncKind::Event { signaled, reset } => {
                let was = *signaled;
                if matches!(reset, ResetMode::Auto) {
                    *signaled = false;
                }
                was
            }
            SyncKind::Semaphore { count, .. } => {
                if *count == 0 {
                    return false;
                }
                *count -= 1;
                true
            }
            SyncKind::Thread { exited, .. } => *exited,
            SyncKind::Process { signaled, .. } => *signaled,
        }
    }

    /// Puts the object into its signaled state.
    ///
    /// # Errors
    /// [`KernelResult::MaximumExceeded`] if a semaphore would exceed its maximum.
    pub const fn signal(&mut self, amount: u32) -> Result<(), KernelResult> {
        match &mut self.kind {
            SyncKind::Event { signaled, .. } | SyncKind::Process { signaled, .. } => {
                *signaled = true;
            }
            SyncKind::Semaphore { count, max } => match count.checked_add(amount) {
                Some(next) if next <= *max => *count = next,
                _ => return Err(KernelResult::MaximumExceeded),
            },
            SyncKind::Thread { exited, .. } => *exited = true,
        }
        Ok(())
    }

    /// Clears an event unconditionally.
    ///
    /// # Errors
    /// [`KernelResult::InvalidHandle`] for anything but an event.
    pub const fn clear(&mut self) -> Result<(), KernelResult> {
        match &mut self.kind {
            SyncKind::Event { signaled, .. } => {
                *signaled = false;
                Ok(())
            }
            _ => Err(KernelResult::InvalidHandle),
        }
    }

    /// Clears a pending signal of an event or process.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidState`] if nothing was signaled.
    /// * [`KernelResult::InvalidHandle`] for threads and semaphores.
    pub const fn reset_signal(&mut self) -> Result<(), KernelResult> {
        match &mut self.kind {
            SyncKind::Event { signaled, .. } | SyncKind::Process { signaled, .. } => {
                if !*signaled {
                    return Err(KernelResult::InvalidState);
                }
                *signaled = false;
                Ok(())
            }
            _ => Err(KernelResult::InvalidHandle),
        }
    }

    pub fn waiters(&self) -> &[Waiter] {
        &self.waiters
    }

    /// Inserts behind every waiter that orders before or equal to it.
    pub fn insert_waiter(&mut self, waiter: Waiter) {
        let pos = self
            .waiters
            .partition_point(|w| w.ordering() <= waiter.ordering());
        self.waiters.insert(pos, waiter);
    }

    pub fn remove_waiter(&mut self, thread: ThreadId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.thread != thread);
        self.waiters.len() != before
    }

    /// Re-sorts a waiter whose thread changed priority. Its arrival order is kept.
    pub fn reprioritize(&mut self, thread: ThreadId, priority: u8) {
        if let Some(pos) = self.waiters.iter().position(|w| w.thread == thread) {
            let mut waiter = self.waiters.remove(pos);
            waiter.priority = priority;
            self.insert_waiter(waiter);
        }
    }

    pub fn first_waiter(&self) -> Option<Waiter> {
        self.waiters.first().copied()
    }

    /// No handle refers to the object and no thread waits on it.
    pub fn is_collectable(&self) -> bool {
        self.refs == 0 && self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(reset: ResetMode) -> SyncObject {
        SyncObject::new(SyncKind::Event {
            signaled: false,
            reset,
        })
    }

    fn waiter(thread: u64, priority: u8, seq: u64) -> Waiter {
        Waiter {
            thread: ThreadId::new(thread),
            priority,
            seq,
        }
    }

    #[test]
    fn auto_reset_is_consumed_once() {
        let mut e = event(ResetMode::Auto);
        e.signal(1).unwrap();
        assert!(e.try_consume_signal());
        assert!(!e.try_consume_signal());
    }

    #[test]
    fn manual_reset_stays_signaled() {
        let mut e = event(ResetMode::Manual);
        e.signal(1).unwrap();
        assert!(e.try_consume_signal());
        assert!(e.try_consume_signal());
        e.clear().unwrap();
        assert!(!e.is_signaled());
        assert_eq!(e.reset_signal(), Err(KernelResult::InvalidState));
    }

    #[test]
    fn semaphore_counts_down_and_caps() {
        let mut s = SyncObject::new(SyncKind::Semaphore { count: 0, max: 2 });
        s.signal(2).unwrap();
        assert_eq!(s.signal(1), Err(KernelResult::MaximumExceeded));
        assert!(s.try_consume_signal());
        assert!(s.try_consume_signal());
        assert!(!s.try_consume_signal());
    }

    #[test]
    fn waiters_order_by_priority_then_arrival() {
        let mut e = event(ResetMode::Manual);
        e.insert_waiter(waiter(1, 10, 1));
        e.insert_waiter(waiter(2, 5, 2));
        e.insert_waiter(waiter(3, 10, 3));
        e.insert_waiter(waiter(4, 5, 4));
        let order: Vec<_> = e.waiters().iter().map(|w| w.thread.as_u64()).collect();
        assert_eq!(order, [2, 4, 1, 3]);

        e.reprioritize(ThreadId::new(3), 0);
        assert_eq!(e.first_waiter().map(|w| w.thread), Some(ThreadId::new(3)));
        assert!(e.remove_waiter(ThreadId::new(3)));
        assert!(!e.remove_waiter(ThreadId::new(3)));
    }
}
