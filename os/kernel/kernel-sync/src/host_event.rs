use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Manual-reset event for parking host threads.
///
/// Stays set until [`reset`](Self::reset); a `set` that happens before a
/// `wait` is never lost.
#[derive(Debug, Default)]
pub struct HostEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl HostEvent {
    pub const fn new(initially_set: bool) -> Self {
        Self {
            signaled: Mutex::new(initially_set),
            cond: Condvar::new(),
        }
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self) {
        *self.flag() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.flag() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag()
    }

    /// Blocks until the event is set.
    pub fn wait(&self) {
        let mut set = self.flag();
        while !*set {
            set = self.cond.wait(set).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the event is set, then clears it.
    pub fn wait_and_reset(&self) {
        let mut set = self.flag();
        while !*set {
            set = self.cond.wait(set).unwrap_or_else(PoisonError::into_inner);
        }
        *set = false;
    }

    /// Blocks until the event is set or `timeout` elapses; returns whether it was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline),
            None => {
                self.wait();
                true
            }
        }
    }

    /// Blocks until the event is set or `deadline` passes; returns whether it was set.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut set = self.flag();
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            set = self
                .cond
                .wait_timeout(set, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}
