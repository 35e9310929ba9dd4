//! Waitable objects for host-side subsystems.
//!
//! An HLE service or device backend gets a [`WaitableEvent`] (or an
//! [`HleSemaphore`]) whose waitable side sits in a guest process's handle
//! table. Signaling it from any host thread wakes guest threads waiting on
//! that handle.

use crate::context::KernelContext;
use crate::handle_table::KernelObject;
use crate::ids::{ObjectId, ProcessId};
use crate::resource_limit::LimitableResource;
use crate::state::KernelState;
use crate::sync_object::{ResetMode, SyncKind};
use kernel_info::KernelResult;
use log::trace;
use std::fmt;
use std::sync::Arc;

type Result<T> = core::result::Result<T, KernelResult>;

/// One host-side reference to a kernel object, returned on drop.
///
/// Dropping takes the critical section, so a reference must not be dropped
/// while the same thread holds a borrow of the kernel state; that panics
/// with "critical section state borrowed twice". Holding a bare guard is
/// fine.
struct ObjectRef {
    context: Arc<KernelContext>,
    object: ObjectId,
}

impl ObjectRef {
    fn retain(&self) -> Self {
        self.context
            .critical_section()
            .with_lock(|state| state.retain_object(self.object));
        Self {
            context: self.context.clone(),
            object: self.object,
        }
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        self.context
            .critical_section()
            .with_lock(|state| state.release_object(self.object));
    }
}

/// An event whose readable side lives in a guest handle table.
///
/// # Panics
/// Dropping the last clone inside a closure that borrows the kernel state,
/// such as one passed to a critical section's `with_lock`.
pub struct WaitableEvent {
    inner: ObjectRef,
    process: ProcessId,
    readable: u32,
}

impl WaitableEvent {
    /// Signals the event, waking one waiter (auto reset) or all (manual reset).
    ///
    /// # Errors
    /// [`KernelResult::InvalidHandle`] if the event no longer exists.
    pub fn signal(&self) -> Result<()> {
        trace!("{}: signaled by host", self.inner.object);
        self.inner.context.signal(self.inner.object, 1)
    }

    /// # Errors
    /// [`KernelResult::InvalidHandle`] if the event no longer exists.
    pub fn clear(&self) -> Result<()> {
        self.inner.context.critical_section().with_lock(|state| {
            state
                .objects
                .get_mut(&self.inner.object)
                .ok_or(KernelResult::InvalidHandle)?
                .clear()
        })
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.inner.context.critical_section().with_lock(|state| {
            state
                .objects
                .get(&self.inner.object)
                .is_some_and(|o| o.is_signaled())
        })
    }

    /// The guest handle of the waitable side.
    #[must_use]
    pub const fn readable_handle(&self) -> u32 {
        self.readable
    }

    #[must_use]
    pub const fn process(&self) -> ProcessId {
        self.process
    }

    #[must_use]
    pub const fn object(&self) -> ObjectId {
        self.inner.object
    }
}

impl Clone for WaitableEvent {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.retain(),
            process: self.process,
            readable: self.readable,
        }
    }
}

impl fmt::Debug for WaitableEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitableEvent")
            .field("object", &self.inner.object)
            .field("process", &self.process)
            .field("readable", &self.readable)
            .finish()
    }
}

/// A counting semaphore released from the host and awaited by the guest.
///
/// # Panics
/// On drop under the same conditions as [`WaitableEvent`].
pub struct HleSemaphore {
    inner: ObjectRef,
    handle: u32,
}

impl HleSemaphore {
    /// Adds `count` to the semaphore, waking up to `count` waiters.
    ///
    /// # Errors
    /// [`KernelResult::MaximumExceeded`] if the count would pass the maximum.
    pub fn release(&self, count: u32) -> Result<()> {
        self.inner.context.signal(self.inner.object, count)
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.inner.context.critical_section().with_lock(|state| {
            match state.objects.get(&self.inner.object).map(|o| o.kind) {
                Some(SyncKind::Semaphore { count, .. }) => count,
                _ => 0,
            }
        })
    }

    /// The guest handle of the semaphore.
    #[must_use]
    pub const fn handle(&self) -> u32 {
        self.handle
    }
}

impl fmt::Debug for HleSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HleSemaphore")
            .field("object", &self.inner.object)
            .field("handle", &self.handle)
            .finish()
    }
}

impl KernelState {
    /// Creates an object charged to `process`'s `Events` limit. The caller
    /// holds the returned object's only reference.
    pub(crate) fn create_limited_object(
        &mut self,
        process: ProcessId,
        kind: SyncKind,
    ) -> Result<ObjectId> {
        let limit = self.process(process)?.limit.clone();
        limit.try_reserve(LimitableResource::Events, 1)?;
        let object = self.create_object(kind);
        if let Some(o) = self.objects.get_mut(&object) {
            o.charge = Some(limit);
        }
        Ok(object)
    }

    /// Installs `handle` for `object` in `process`, taking a reference for it.
    pub(crate) fn install_handle(&mut self, process: ProcessId, handle: KernelObject) -> Result<u32> {
        let raw = self.process_mut(process)?.handles.insert(handle)?;
        self.retain_object(handle.object());
        Ok(raw)
    }

    /// Closes a handle of `process` and drops its reference.
    pub(crate) fn close_handle(&mut self, process: ProcessId, handle: u32) -> Result<()> {
        let object = self
            .process_mut(process)?
            .handles
            .remove(handle)
            .ok_or(KernelResult::InvalidHandle)?;
        self.release_object(object.object());
        Ok(())
    }

    /// Creates a guest event pair and returns `(writable, readable)` handles.
    pub(crate) fn create_event_pair(&mut self, process: ProcessId) -> Result<(u32, u32)> {
        let object = self.create_limited_object(
            process,
            SyncKind::Event {
                signaled: false,
                reset: ResetMode::Manual,
            },
        )?;
        let handles = self
            .install_handle(process, KernelObject::WritableEvent(object))
            .and_then(|writable| {
                match self.install_handle(process, KernelObject::ReadableEvent(object)) {
                    Ok(readable) => Ok((writable, readable)),
                    Err(e) => {
                        if let Err(close) = self.close_handle(process, writable) {
                            log::warn!("{process}: writable event handle {writable:#x} leaked: {close}");
                        }
                        Err(e)
                    }
                }
            });
        self.release_object(object);
        handles
    }
}

impl KernelContext {
    /// Creates a manual-reset event for an HLE service and installs its
    /// readable side in `process`.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidHandle`] if the process does not exist.
    /// * [`KernelResult::ResourceLimitExceeded`] if the process may not create more events.
    /// * [`KernelResult::HandleTableFull`] if its handle table is full.
    pub fn create_event(self: &Arc<Self>, process: ProcessId) -> Result<WaitableEvent> {
        self.create_event_with(process, ResetMode::Manual)
    }

    /// Like [`create_event`](Self::create_event) with a chosen reset mode.
    ///
    /// # Errors
    /// As [`create_event`](Self::create_event).
    pub fn create_event_with(
        self: &Arc<Self>,
        process: ProcessId,
        reset: ResetMode,
    ) -> Result<WaitableEvent> {
        let (object, readable) = self.critical_section().with_lock(|state| {
            let object = state.create_limited_object(
                process,
                SyncKind::Event {
                    signaled: false,
                    reset,
                },
            )?;
            match state.install_handle(process, KernelObject::ReadableEvent(object)) {
                Ok(handle) => Ok((object, handle)),
                Err(e) => {
                    state.release_object(object);
                    Err(e)
                }
            }
        })?;
        Ok(WaitableEvent {
            inner: ObjectRef {
                context: self.clone(),
                object,
            },
            process,
            readable,
        })
    }

    /// Creates a semaphore with `initial` of `max` units and installs it in `process`.
    ///
    /// # Errors
    /// * [`KernelResult::InvalidCombination`] if `initial > max` or `max == 0`.
    /// * Otherwise as [`create_event`](Self::create_event).
    pub fn create_semaphore(
        self: &Arc<Self>,
        process: ProcessId,
        initial: u32,
        max: u32,
    ) -> Result<HleSemaphore> {
        if max == 0 || initial > max {
            return Err(KernelResult::InvalidCombination);
        }
        let (object, handle) = self.critical_section().with_lock(|state| {
            let object = state.create_limited_object(
                process,
                SyncKind::Semaphore {
                    count: initial,
                    max,
                },
            )?;
            match state.install_handle(process, KernelObject::Semaphore(object)) {
                Ok(handle) => Ok((object, handle)),
                Err(e) => {
                    state.release_object(object);
                    Err(e)
                }
            }
        })?;
        Ok(HleSemaphore {
            inner: ObjectRef {
                context: self.clone(),
                object,
            },
            handle,
        })
    }
}
