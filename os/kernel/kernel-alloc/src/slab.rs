use alloc::vec::Vec;
use core::fmt;

/// Handle to an occupied slot of a [`SlabHeap`].
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlabIndex(u32);

impl SlabIndex {
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SlabIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("slab pool of {capacity} nodes is exhausted")]
pub struct SlabExhausted {
    pub capacity: usize,
}

enum Slot<T> {
    Free { next: Option<u32> },
    Used(T),
}

/// A bounded pool of `T` slots allocated once up front.
///
/// Free slots form an intrusive singly linked list threaded through the slot
/// array, so allocation and release are O(1) and never touch the host heap.
pub struct SlabHeap<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    used: usize,
    peak: usize,
}

impl<T> SlabHeap<T> {
    /// Pre-allocates `capacity` slots.
    ///
    /// # Panics
    /// If `capacity` does not fit a `u32` index.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let Ok(count) = u32::try_from(capacity) else {
            panic!("slab capacity {capacity} exceeds the index range");
        };
        let slots = (0..count)
            .map(|i| Slot::Free {
                next: (i + 1 < count).then_some(i + 1),
            })
            .collect();
        Self {
            slots,
            free_head: (count > 0).then_some(0),
            used: 0,
            peak: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    #[must_use]
    pub const fn in_use(&self) -> usize {
        self.used
    }

    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity() - self.used
    }

    /// Highest number of slots ever in use at once.
    #[inline]
    #[must_use]
    pub const fn peak(&self) -> usize {
        self.peak
    }

    /// Whether `count` more slots can be handed out.
    #[inline]
    #[must_use]
    pub fn can_allocate(&self, count: usize) -> bool {
        self.available() >= count
    }

    /// Stores `value` in a free slot.
    ///
    /// # Errors
    /// [`SlabExhausted`] if every slot is taken.
    pub fn allocate(&mut self, value: T) -> Result<SlabIndex, SlabExhausted> {
        let Some(index) = self.free_head else {
            return Err(SlabExhausted {
                capacity: self.capacity(),
            });
        };
        let slot = &mut self.slots[index as usize];
        let Slot::Free { next } = *slot else {
            panic!("slab free list points at an occupied slot #{index}");
        };
        *slot = Slot::Used(value);
        self.free_head = next;
        self.used += 1;
        self.peak = self.peak.max(self.used);
        Ok(SlabIndex(index))
    }

    /// Returns the slot to the pool and hands back its value.
    ///
    /// # Panics
    /// On double free.
    pub fn free(&mut self, index: SlabIndex) -> T {
        let slot = core::mem::replace(
            &mut self.slots[index.as_usize()],
            Slot::Free {
                next: self.free_head,
            },
        );
        match slot {
            Slot::Used(value) => {
                self.free_head = Some(index.0);
                self.used -= 1;
                value
            }
            Slot::Free { .. } => {
                log::error!("slab slot {index:?} released twice");
                panic!("slab slot {index:?} released twice");
            }
        }
    }

    /// # Panics
    /// If `index` does not name an occupied slot.
    #[must_use]
    pub fn get(&self, index: SlabIndex) -> &T {
        match &self.slots[index.as_usize()] {
            Slot::Used(value) => value,
            Slot::Free { .. } => panic!("dangling slab index {index:?}"),
        }
    }

    /// # Panics
    /// If `index` does not name an occupied slot.
    pub fn get_mut(&mut self, index: SlabIndex) -> &mut T {
        match &mut self.slots[index.as_usize()] {
            Slot::Used(value) => value,
            Slot::Free { .. } => panic!("dangling slab index {index:?}"),
        }
    }
}

impl<T> fmt::Debug for SlabHeap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabHeap")
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .field("peak", &self.peak)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_until_exhausted_then_reuse() {
        let mut slab = SlabHeap::with_capacity(3);
        let a = slab.allocate('a').unwrap();
        let b = slab.allocate('b').unwrap();
        let c = slab.allocate('c').unwrap();
        assert!(!slab.can_allocate(1));
        assert_eq!(slab.allocate('d'), Err(SlabExhausted { capacity: 3 }));

        assert_eq!(slab.free(b), 'b');
        assert!(slab.can_allocate(1));
        let d = slab.allocate('d').unwrap();
        assert_eq!(d, b, "freed slot is reused first");
        assert_eq!(*slab.get(a), 'a');
        assert_eq!(*slab.get(c), 'c');
        assert_eq!(slab.peak(), 3);
    }

    #[test]
    fn get_mut_updates_in_place() {
        let mut slab = SlabHeap::with_capacity(1);
        let i = slab.allocate(10_u32).unwrap();
        *slab.get_mut(i) += 5;
        assert_eq!(slab.free(i), 15);
        assert_eq!(slab.in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn double_free_is_fatal() {
        let mut slab = SlabHeap::with_capacity(2);
        let i = slab.allocate(()).unwrap();
        slab.free(i);
        slab.free(i);
    }

    #[test]
    fn zero_capacity_is_always_exhausted() {
        let mut slab = SlabHeap::<u8>::with_capacity(0);
        assert!(slab.can_allocate(0));
        assert!(slab.allocate(1).is_err());
    }
}
