use crate::VirtualAddress;
use core::fmt;
use kernel_info::KernelResult;
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};

/// Why a raw `(address, size)` pair was rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("address {0} is not page aligned")]
    MisalignedAddress(VirtualAddress),
    #[error("size {0:#x} is zero or not page aligned")]
    InvalidSize(u64),
    #[error("range at {0} with size {1:#x} wraps around the address space")]
    Overflow(VirtualAddress, u64),
}

impl From<RangeError> for KernelResult {
    fn from(value: RangeError) -> Self {
        match value {
            RangeError::MisalignedAddress(_) => Self::InvalidAddress,
            RangeError::InvalidSize(_) => Self::InvalidSize,
            RangeError::Overflow(..) => Self::InvalidMemoryRange,
        }
    }
}

/// A non-empty, page-aligned range of guest virtual pages `[start, end)`.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PageRange {
    start: VirtualAddress,
    pages: u64,
}

impl PageRange {
    /// Validates a guest-supplied `(address, size)` pair.
    ///
    /// # Errors
    /// * [`RangeError::MisalignedAddress`] if `address` is not page aligned.
    /// * [`RangeError::InvalidSize`] if `size` is zero or not page aligned.
    /// * [`RangeError::Overflow`] if `address + size` wraps.
    pub const fn try_new(address: VirtualAddress, size: u64) -> Result<Self, RangeError> {
        if !address.is_page_aligned() {
            return Err(RangeError::MisalignedAddress(address));
        }
        if size == 0 || size & (PAGE_SIZE - 1) != 0 {
            return Err(RangeError::InvalidSize(size));
        }
        if address.checked_add(size).is_none() {
            return Err(RangeError::Overflow(address, size));
        }
        Ok(Self {
            start: address,
            pages: size >> PAGE_SHIFT,
        })
    }

    /// Builds a range from an aligned start and a page count.
    ///
    /// # Panics
    /// If `start` is misaligned, `pages` is zero, or the range wraps. These are
    /// kernel-internal construction bugs.
    #[must_use]
    pub const fn from_pages(start: VirtualAddress, pages: u64) -> Self {
        assert!(start.is_page_aligned(), "range start must be page aligned");
        assert!(pages > 0, "range must not be empty");
        assert!(
            start.as_u64().checked_add((pages << PAGE_SHIFT) - 1).is_some(),
            "range must not wrap"
        );
        Self { start, pages }
    }

    /// Builds the range `[start, end)`; `None` if empty or misaligned.
    #[must_use]
    pub const fn between(start: VirtualAddress, end: VirtualAddress) -> Option<Self> {
        if !start.is_page_aligned() || !end.is_page_aligned() || end.as_u64() <= start.as_u64() {
            return None;
        }
        Some(Self {
            start,
            pages: (end.as_u64() - start.as_u64()) >> PAGE_SHIFT,
        })
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// First address past the range.
    ///
    /// For a range ending at the top of the 64-bit space this wraps to zero;
    /// use [`last`](Self::last) for comparisons in that case.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64().wrapping_add(self.size()))
    }

    /// Last byte address inside the range.
    #[inline]
    #[must_use]
    pub const fn last(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64() + (self.size() - 1))
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.pages
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.pages << PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, address: VirtualAddress) -> bool {
        address.as_u64() >= self.start.as_u64() && address.as_u64() <= self.last().as_u64()
    }

    /// Whether `other` lies entirely inside `self`.
    #[inline]
    #[must_use]
    pub const fn contains_range(&self, other: &Self) -> bool {
        other.start.as_u64() >= self.start.as_u64()
            && other.last().as_u64() <= self.last().as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start.as_u64() <= other.last().as_u64()
            && other.start.as_u64() <= self.last().as_u64()
    }

    /// Page base addresses in ascending order.
    pub fn iter_pages(&self) -> impl Iterator<Item = VirtualAddress> + use<> {
        let start = self.start.as_u64();
        (0..self.pages).map(move |i| VirtualAddress::new(start + (i << PAGE_SHIFT)))
    }
}

impl fmt::Debug for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PageRange({}..={}, {} pages)",
            self.start,
            self.last(),
            self.pages
        )
    }
}
