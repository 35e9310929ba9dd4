//! # Kernel synchronization primitives
//!
//! * [`CriticalSection`]: the single reentrant lock guarding every piece of
//!   scheduler-visible kernel state, with a deferred [`ReleaseHandler`] that
//!   runs when the outermost owner leaves.
//! * [`HostEvent`]: a manual-reset event that parks a host thread until it is
//!   set, optionally with a timeout.

#![allow(unsafe_code)]

mod critical_section;
mod host_event;

pub use critical_section::{CoreMask, CriticalSection, CriticalSectionGuard, ReleaseHandler};
pub use host_event::HostEvent;
