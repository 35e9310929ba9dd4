use std::cell::{RefCell, RefMut};
use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

/// A bit set of emulated cores; bit `n` stands for core `n`.
pub type CoreMask = u64;

/// Hook invoked when the outermost owner leaves a [`CriticalSection`].
pub trait ReleaseHandler<T>: Send + Sync {
    /// Runs while the section is still owned, with exclusive access to the
    /// protected state. `requested` holds the cores marked via
    /// [`CriticalSectionGuard::request_reschedule`]. Returns the cores whose
    /// dispatchers must be notified.
    fn before_release(&self, state: &mut T, requested: CoreMask) -> CoreMask;

    /// Runs after the section has been released. Called at most once per
    /// release and only with a non-empty mask.
    fn after_release(&self, cores: CoreMask);
}

struct Ownership {
    owner: Option<ThreadId>,
    depth: usize,
    pending: CoreMask,
}

/// Reentrant lock owned by one host thread at a time.
///
/// Every `enter` on the owning thread increments a depth counter; only the
/// outermost guard actually releases the lock. The protected value is reached
/// through [`CriticalSectionGuard::state`], which hands out a checked mutable
/// borrow so nested guards on the same thread cannot alias it.
pub struct CriticalSection<T> {
    ownership: Mutex<Ownership>,
    released: Condvar,
    data: RefCell<T>,
    handler: Option<Box<dyn ReleaseHandler<T>>>,
}

// Safety: `data` is only borrowed by the thread recorded in `ownership.owner`,
// and ownership changes hands through `ownership`'s mutex, which orders the
// borrow flag updates between threads. Only `T: Send` may cross threads.
unsafe impl<T: Send> Sync for CriticalSection<T> {}

impl<T> CriticalSection<T> {
    pub const fn new(data: T) -> Self {
        Self {
            ownership: Mutex::new(Ownership {
                owner: None,
                depth: 0,
                pending: 0,
            }),
            released: Condvar::new(),
            data: RefCell::new(data),
            handler: None,
        }
    }

    pub fn with_release_handler(data: T, handler: Box<dyn ReleaseHandler<T>>) -> Self {
        Self {
            handler: Some(handler),
            ..Self::new(data)
        }
    }

    fn ownership(&self) -> MutexGuard<'_, Ownership> {
        self.ownership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the calling thread owns the section.
    pub fn enter(&self) -> CriticalSectionGuard<'_, T> {
        let me = thread::current().id();
        let mut own = self.ownership();
        if own.owner == Some(me) {
            own.depth += 1;
        } else {
            while own.owner.is_some() {
                own = self
                    .released
                    .wait(own)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            own.owner = Some(me);
            own.depth = 1;
        }
        CriticalSectionGuard {
            section: self,
            _not_send: PhantomData,
        }
    }

    /// Takes the section only if nobody else owns it.
    pub fn try_enter(&self) -> Option<CriticalSectionGuard<'_, T>> {
        let me = thread::current().id();
        let mut own = self.ownership();
        match own.owner {
            Some(owner) if owner == me => own.depth += 1,
            Some(_) => return None,
            None => {
                own.owner = Some(me);
                own.depth = 1;
            }
        }
        Some(CriticalSectionGuard {
            section: self,
            _not_send: PhantomData,
        })
    }

    /// Nesting depth held by the calling thread; `0` if it does not own the section.
    pub fn held_depth(&self) -> usize {
        let own = self.ownership();
        if own.owner == Some(thread::current().id()) {
            own.depth
        } else {
            0
        }
    }

    /// Closure convenience, built on the guard.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let guard = self.enter();
        let mut state = guard.state();
        f(&mut state)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn leave(&self) {
        let me = thread::current().id();
        let mut own = self.ownership();
        if own.owner != Some(me) || own.depth == 0 {
            log::error!("critical section released by a thread that does not own it");
            drop(own);
            panic!("critical section released by a thread that does not own it");
        }
        if own.depth > 1 {
            own.depth -= 1;
            return;
        }

        let requested = std::mem::take(&mut own.pending);
        drop(own);

        let notify = match &self.handler {
            Some(handler) => {
                let Ok(mut data) = self.data.try_borrow_mut() else {
                    log::error!("critical section state still borrowed at release");
                    panic!("critical section state still borrowed at release");
                };
                handler.before_release(&mut data, requested)
            }
            None => requested,
        };

        let mut own = self.ownership();
        own.owner = None;
        own.depth = 0;
        drop(own);
        self.released.notify_one();

        if notify != 0
            && let Some(handler) = &self.handler
        {
            handler.after_release(notify);
        }
    }
}

/// Proof of ownership of a [`CriticalSection`]; dropping it leaves one level.
///
/// Not `Send`: ownership is tied to the host thread that entered.
pub struct CriticalSectionGuard<'a, T> {
    section: &'a CriticalSection<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> CriticalSectionGuard<'_, T> {
    /// Borrows the protected state.
    ///
    /// # Panics
    /// If another borrow taken on this thread is still alive.
    pub fn state(&self) -> RefMut<'_, T> {
        match self.section.data.try_borrow_mut() {
            Ok(state) => state,
            Err(_) => {
                log::error!("critical section state borrowed twice");
                panic!("critical section state borrowed twice");
            }
        }
    }

    /// Marks `cores` for rescheduling when the outermost guard is dropped.
    pub fn request_reschedule(&self, cores: CoreMask) {
        self.section.ownership().pending |= cores;
    }

    /// Nesting depth of the calling thread, this guard included.
    pub fn depth(&self) -> usize {
        self.section.ownership().depth
    }
}

impl<T> Drop for CriticalSectionGuard<'_, T> {
    fn drop(&mut self) {
        self.section.leave();
    }
}
