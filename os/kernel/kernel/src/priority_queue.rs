//! Ready threads per core and priority.
//!
//! Each core owns 64 FIFO buckets plus a bit mask of the non-empty ones, so
//! selection is a `trailing_zeros` away. Runnable threads stay queued while
//! they run: the current thread of a core is the head of its best bucket.

use crate::ids::ThreadId;
use kernel_info::scheduling::{CPU_CORES_COUNT, PRIORITIES_COUNT};
use std::collections::{HashMap, VecDeque};

/// Where a queued thread sits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct QueueSlot {
    pub core: usize,
    pub priority: u8,
}

pub(crate) struct PriorityQueue {
    buckets: [[VecDeque<ThreadId>; PRIORITIES_COUNT]; CPU_CORES_COUNT],
    present: [u64; CPU_CORES_COUNT],
    slots: HashMap<ThreadId, QueueSlot>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| std::array::from_fn(|_| VecDeque::new())),
            present: [0; CPU_CORES_COUNT],
            slots: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, thread: ThreadId) -> Option<QueueSlot> {
        self.slots.get(&thread).copied()
    }

    /// Appends `thread` to the tail of its bucket.
    ///
    /// # Panics
    /// If the thread is queued already; a thread lives in exactly one bucket.
    pub fn enqueue(&mut self, thread: ThreadId, core: usize, priority: u8) {
        if let Some(slot) = self.slots.get(&thread) {
            log::error!("{thread} queued twice (already on {slot:?})");
            panic!("{thread} queued twice");
        }
        let p = usize::from(priority);
        self.buckets[core][p].push_back(thread);
        self.present[core] |= 1 << p;
        self.slots.insert(thread, QueueSlot { core, priority });
    }

    /// Removes `thread` from wherever it is queued.
    pub fn remove(&mut self, thread: ThreadId) -> Option<QueueSlot> {
        let slot = self.slots.remove(&thread)?;
        let p = usize::from(slot.priority);
        let bucket = &mut self.buckets[slot.core][p];
        if let Some(pos) = bucket.iter().position(|t| *t == thread) {
            bucket.remove(pos);
        }
        if bucket.is_empty() {
            self.present[slot.core] &= !(1 << p);
        }
        Some(slot)
    }

    /// Head of the best non-empty bucket of `core`, `None` when the core is idle.
    pub fn select_next(&self, core: usize) -> Option<ThreadId> {
        let mask = self.present[core];
        if mask == 0 {
            return None;
        }
        let p = mask.trailing_zeros() as usize;
        self.buckets[core][p].front().copied()
    }

    /// Threads queued on `core` in selection order.
    pub fn scheduled(&self, core: usize) -> impl Iterator<Item = ThreadId> + '_ {
        set_bits(self.present[core]).flat_map(move |p| self.buckets[core][p].iter().copied())
    }

    /// Threads queued on every core but `core`, best priority first and in
    /// core order within one priority.
    pub fn queued_elsewhere(&self, core: usize) -> impl Iterator<Item = ThreadId> + '_ {
        let others = move || (0..CPU_CORES_COUNT).filter(move |c| *c != core);
        let present = others().fold(0, |mask, c| mask | self.present[c]);
        set_bits(present)
            .flat_map(move |p| others().flat_map(move |c| self.buckets[c][p].iter().copied()))
    }

    /// Moves `thread` to the tail of its bucket on `core`, returning where it was.
    pub fn transfer(&mut self, thread: ThreadId, core: usize) -> Option<QueueSlot> {
        let slot = self.remove(thread)?;
        self.enqueue(thread, core, slot.priority);
        Some(slot)
    }

    /// Moves the head of `core`'s `priority` bucket to its tail.
    pub fn rotate(&mut self, core: usize, priority: u8) {
        let bucket = &mut self.buckets[core][usize::from(priority)];
        if bucket.len() > 1 {
            bucket.rotate_left(1);
        }
    }

    /// Moves `thread` behind every other thread of its bucket.
    pub fn move_to_back(&mut self, thread: ThreadId) {
        let Some(slot) = self.slots.get(&thread) else {
            return;
        };
        let bucket = &mut self.buckets[slot.core][usize::from(slot.priority)];
        if let Some(pos) = bucket.iter().position(|t| *t == thread) {
            bucket.remove(pos);
            bucket.push_back(thread);
        }
    }

    /// Threads of one bucket in queue order.
    pub fn bucket(&self, core: usize, priority: u8) -> impl Iterator<Item = ThreadId> + '_ {
        self.buckets[core][usize::from(priority)].iter().copied()
    }

    /// Every queued thread with its slot.
    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, QueueSlot)> + '_ {
        self.slots.iter().map(|(t, s)| (*t, *s))
    }

    /// Checks that buckets, presence masks and the slot index agree.
    pub fn check(&self) -> Result<(), String> {
        let mut seen = 0;
        for core in 0..CPU_CORES_COUNT {
            for (p, bucket) in self.buckets[core].iter().enumerate() {
                if bucket.is_empty() == (self.present[core] & (1 << p) != 0) {
                    return Err(format!("presence bit of core {core} priority {p} is stale"));
                }
                for thread in bucket {
                    seen += 1;
                    let expected = QueueSlot {
                        core,
                        priority: u8::try_from(p).unwrap_or(u8::MAX),
                    };
                    if self.slots.get(thread) != Some(&expected) {
                        return Err(format!("{thread} is queued on core {core} priority {p} but indexed elsewhere"));
                    }
                }
            }
        }
        if seen == self.slots.len() {
            Ok(())
        } else {
            Err(format!("{seen} queued entries for {} indexed threads", self.slots.len()))
        }
    }
}

/// Indices of the set bits of `mask`, lowest first.
fn set_bits(mut mask: u64) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let bit = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        Some(bit)
    })
}

impl std::fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("present", &self.present)
            .field("queued", &self.slots.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: u64) -> ThreadId {
        ThreadId::new(n)
    }

    #[test]
    fn selects_highest_priority_first() {
        let mut q = PriorityQueue::new();
        q.enqueue(t(1), 0, 10);
        q.enqueue(t(2), 0, 5);
        q.enqueue(t(3), 1, 0);
        assert_eq!(q.select_next(0), Some(t(2)));
        assert_eq!(q.select_next(1), Some(t(3)));
        assert_eq!(q.select_next(2), None);
        q.check().unwrap();
    }

    #[test]
    fn equal_priority_is_fifo_and_rotates() {
        let mut q = PriorityQueue::new();
        q.enqueue(t(1), 0, 1);
        q.enqueue(t(2), 0, 1);
        assert_eq!(q.select_next(0), Some(t(1)));
        q.rotate(0, 1);
        assert_eq!(q.select_next(0), Some(t(2)));
        q.move_to_back(t(2));
        assert_eq!(q.select_next(0), Some(t(1)));
        assert_eq!(q.bucket(0, 1).collect::<Vec<_>>(), [t(1), t(2)]);
    }

    #[test]
    fn remove_clears_presence() {
        let mut q = PriorityQueue::new();
        q.enqueue(t(1), 3, 63);
        assert_eq!(q.remove(t(1)), Some(QueueSlot { core: 3, priority: 63 }));
        assert_eq!(q.remove(t(1)), None);
        assert_eq!(q.select_next(3), None);
        assert_eq!(q.len(), 0);
        q.check().unwrap();
    }

    #[test]
    fn other_cores_are_listed_by_priority() {
        let mut q = PriorityQueue::new();
        q.enqueue(t(1), 0, 30);
        q.enqueue(t(2), 2, 10);
        q.enqueue(t(3), 1, 30);
        q.enqueue(t(4), 1, 10);
        q.enqueue(t(5), 3, 5);
        assert_eq!(q.queued_elsewhere(3).collect::<Vec<_>>(), [t(4), t(2), t(1), t(3)]);
        assert_eq!(q.scheduled(1).collect::<Vec<_>>(), [t(4), t(3)]);
    }

    #[test]
    fn transfer_appends_on_the_new_core() {
        let mut q = PriorityQueue::new();
        q.enqueue(t(1), 0, 7);
        q.enqueue(t(2), 1, 7);
        assert_eq!(q.transfer(t(1), 1), Some(QueueSlot { core: 0, priority: 7 }));
        assert_eq!(q.bucket(1, 7).collect::<Vec<_>>(), [t(2), t(1)]);
        assert_eq!(q.select_next(0), None);
        assert_eq!(q.transfer(t(9), 0), None);
        q.check().unwrap();
    }

    #[test]
    #[should_panic(expected = "queued twice")]
    fn double_enqueue_is_fatal() {
        let mut q = PriorityQueue::new();
        q.enqueue(t(1), 0, 1);
        q.enqueue(t(1), 1, 1);
    }
}
