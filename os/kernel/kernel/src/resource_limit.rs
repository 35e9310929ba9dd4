//! Per-process resource accounting.

use kernel_info::KernelResult;
use std::sync::atomic::{AtomicU64, Ordering};

/// Resources a [`ResourceLimit`] caps.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum LimitableResource {
    PhysicalMemory = 0,
    Threads = 1,
    Events = 2,
    TransferMemory = 3,
    Sessions = 4,
}

impl LimitableResource {
    pub const COUNT: usize = 5;

    pub const ALL: [Self; Self::COUNT] = [
        Self::PhysicalMemory,
        Self::Threads,
        Self::Events,
        Self::TransferMemory,
        Self::Sessions,
    ];

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

/// Limits with lock-free current and peak values, shared between processes
/// through an `Arc`.
#[derive(Debug)]
pub struct ResourceLimit {
    limit: [AtomicU64; LimitableResource::COUNT],
    current: [AtomicU64; LimitableResource::COUNT],
    peak: [AtomicU64; LimitableResource::COUNT],
}

impl ResourceLimit {
    /// A limit that caps nothing.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::with_limits([u64::MAX; LimitableResource::COUNT])
    }

    /// Limits indexed in [`LimitableResource::ALL`] order.
    #[must_use]
    pub fn with_limits(limits: [u64; LimitableResource::COUNT]) -> Self {
        Self {
            limit: limits.map(AtomicU64::new),
            current: std::array::from_fn(|_| AtomicU64::new(0)),
            peak: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn limit(&self, resource: LimitableResource) -> u64 {
        self.limit[resource.index()].load(Ordering::Acquire)
    }

    #[must_use]
    pub fn current(&self, resource: LimitableResource) -> u64 {
        self.current[resource.index()].load(Ordering::Acquire)
    }

    #[must_use]
    pub fn peak(&self, resource: LimitableResource) -> u64 {
        self.peak[resource.index()].load(Ordering::Acquire)
    }

    /// Changes a limit.
    ///
    /// # Errors
    /// [`KernelResult::InvalidState`] if more than `value` is in use.
    pub fn set_limit(&self, resource: LimitableResource, value: u64) -> Result<(), KernelResult> {
        if self.current(resource) > value {
            return Err(KernelResult::InvalidState);
        }
        self.limit[resource.index()].store(value, Ordering::Release);
        Ok(())
    }

    /// Reserves `amount` units.
    ///
    /// # Errors
    /// [`KernelResult::ResourceLimitExceeded`] if the reservation would pass the limit.
    pub fn try_reserve(&self, resource: LimitableResource, amount: u64) -> Result<(), KernelResult> {
        let i = resource.index();
        let limit = self.limit[i].load(Ordering::Acquire);
        let reserved = self.current[i]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(amount).filter(|next| *next <= limit)
            })
            .map_err(|_| KernelResult::ResourceLimitExceeded)?;
        self.peak[i].fetch_max(reserved + amount, Ordering::AcqRel);
        Ok(())
    }

    /// Returns `amount` units.
    ///
    /// # Panics
    /// If more is released than was reserved.
    pub fn release(&self, resource: LimitableResource, amount: u64) {
        let released = self.current[resource.index()].fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |current| current.checked_sub(amount),
        );
        if released.is_err() {
            log::error!("released {amount} {resource:?} more than reserved");
            panic!("resource limit released more {resource:?} than reserved");
        }
    }
}

impl Default for ResourceLimit {
    fn default() -> Self {
        Self::unlimited()
    }
}
