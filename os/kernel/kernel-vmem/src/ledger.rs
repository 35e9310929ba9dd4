//! Address-ordered block ledger.
//!
//! The ledger is a doubly linked list of [`MemoryBlock`]s whose nodes live in a
//! bounded [`SlabHeap`]. It always partitions its range exactly: no gaps, no
//! overlaps, and no two neighbours with the same [`BlockState`].

use crate::block::MemoryBlock;
use crate::state::BlockState;
use kernel_alloc::{SlabExhausted, SlabHeap, SlabIndex};
use kernel_info::memory::PAGE_SHIFT;
use kernel_memory_addresses::{PageRange, VirtualAddress};

/// A ledger list node; only ever handled through a [`LedgerSlab`].
#[derive(Debug)]
pub struct LedgerNode {
    block: MemoryBlock,
    prev: Option<SlabIndex>,
    next: Option<SlabIndex>,
}

pub type LedgerSlab = SlabHeap<LedgerNode>;

/// A broken ledger invariant found by [`BlockLedger::verify`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerViolation {
    #[error("ledger starts at {found} instead of {expected}")]
    Start {
        expected: VirtualAddress,
        found: VirtualAddress,
    },
    #[error("ledger ends at {found} instead of {expected}")]
    End {
        expected: VirtualAddress,
        found: VirtualAddress,
    },
    #[error("block ending at {left_end} is followed by a block at {right}")]
    Discontinuity {
        left_end: VirtualAddress,
        right: VirtualAddress,
    },
    #[error("empty block at {0}")]
    Empty(VirtualAddress),
    #[error("adjacent blocks meeting at {0} share one state")]
    Unmerged(VirtualAddress),
    #[error("back link of block at {0} is broken")]
    BrokenLink(VirtualAddress),
    #[error("ledger holds {found} blocks but counts {expected}")]
    Count { expected: usize, found: usize },
}

#[derive(Debug)]
pub struct BlockLedger {
    head: SlabIndex,
    range: PageRange,
    count: usize,
}

impl BlockLedger {
    /// Creates a ledger describing `range` as one unmapped block.
    ///
    /// # Errors
    /// If the slab cannot supply the first node.
    pub fn new(slab: &mut LedgerSlab, range: PageRange) -> Result<Self, SlabExhausted> {
        let head = slab.allocate(LedgerNode {
            block: MemoryBlock {
                base: range.start(),
                pages: range.pages(),
                state: BlockState::UNMAPPED,
            },
            prev: None,
            next: None,
        })?;
        Ok(Self {
            head,
            range,
            count: 1,
        })
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> PageRange {
        self.range
    }

    #[inline]
    #[must_use]
    pub const fn block_count(&self) -> usize {
        self.count
    }

    /// Blocks in address order.
    #[must_use]
    pub fn iter<'a>(&self, slab: &'a LedgerSlab) -> Blocks<'a> {
        Blocks {
            slab,
            next: Some(self.head),
            until: None,
        }
    }

    /// Blocks overlapping `range`, in address order.
    #[must_use]
    pub fn overlapping<'a>(&self, slab: &'a LedgerSlab, range: PageRange) -> Blocks<'a> {
        Blocks {
            slab,
            next: self.find(slab, range.start()),
            until: Some(range.end()),
        }
    }

    fn find(&self, slab: &LedgerSlab, address: VirtualAddress) -> Option<SlabIndex> {
        if !self.range.contains(address) {
            return None;
        }
        let mut cursor = Some(self.head);
        while let Some(index) = cursor {
            let node = slab.get(index);
            if node.block.contains(address) {
                return Some(index);
            }
            cursor = node.next;
        }
        None
    }

    /// The block covering `address`, if it lies inside the ledger.
    #[must_use]
    pub fn block_at(&self, slab: &LedgerSlab, address: VirtualAddress) -> Option<MemoryBlock> {
        self.find(slab, address).map(|index| slab.get(index).block)
    }

    /// Returns the state of `range` if a single block covers all of it and
    /// that state passes `check`.
    ///
    /// Since neighbours never share a state, a range with homogeneous state is
    /// always covered by exactly one block.
    #[must_use]
    pub fn check_range(
        &self,
        slab: &LedgerSlab,
        range: PageRange,
        check: impl FnOnce(&BlockState) -> bool,
    ) -> Option<BlockState> {
        if !self.range.contains_range(&range) {
            return None;
        }
        let block = self.block_at(slab, range.start())?;
        if block.end().as_u64() < range.end().as_u64() {
            return None;
        }
        check(&block.state).then_some(block.state)
    }

    /// Overwrites `range` with `state`, splitting boundary blocks and merging
    /// equal neighbours.
    ///
    /// The caller must have verified that `slab` can hand out
    /// [`MAX_BLOCKS_NEEDED_FOR_INSERTION`](kernel_info::memory::MAX_BLOCKS_NEEDED_FOR_INSERTION)
    /// nodes.
    ///
    /// # Panics
    /// If `range` is outside the ledger or the slab runs dry.
    pub fn update(&mut self, slab: &mut LedgerSlab, range: PageRange, state: BlockState) {
        assert!(
            self.range.contains_range(&range),
            "ledger update {range:?} outside of {:?}",
            self.range
        );
        let Some(mut first) = self.find(slab, range.start()) else {
            log::error!("ledger does not cover {}", range.start());
            panic!("ledger does not cover {}", range.start());
        };
        if slab.get(first).block.base != range.start() {
            first = self.split(slab, first, range.start());
        }

        let end = range.end().as_u64();
        loop {
            let node_end = slab.get(first).block.end().as_u64();
            if node_end == end {
                break;
            }
            if node_end > end {
                self.split(slab, first, range.end());
                break;
            }
            let Some(next) = slab.get(first).next else {
                log::error!("ledger ends inside {range:?}");
                panic!("ledger ends inside {range:?}");
            };
            let absorbed = self.unlink(slab, next);
            slab.get_mut(first).block.pages += absorbed.pages;
        }

        slab.get_mut(first).block.state = state;
        let first = self.merge_with_prev(slab, first);
        self.merge_with_next(slab, first);

        #[cfg(debug_assertions)]
        if let Err(violation) = self.verify(slab) {
            log::error!("ledger corrupted by update of {range:?}: {violation}");
            panic!("ledger corrupted by update of {range:?}: {violation}");
        }
    }

    /// Splits the node at `at`; the original node keeps the lower part.
    /// Returns the node holding the upper part.
    fn split(&mut self, slab: &mut LedgerSlab, index: SlabIndex, at: VirtualAddress) -> SlabIndex {
        let node = slab.get(index);
        let block = node.block;
        let old_next = node.next;
        let lower_pages = (at - block.base) >> PAGE_SHIFT;
        debug_assert!(lower_pages > 0 && lower_pages < block.pages);

        let upper = LedgerNode {
            block: MemoryBlock {
                base: at,
                pages: block.pages - lower_pages,
                state: block.state,
            },
            prev: Some(index),
            next: old_next,
        };
        let upper = match slab.allocate(upper) {
            Ok(upper) => upper,
            Err(e) => {
                log::error!("ledger split at {at} failed after capacity check: {e}");
                panic!("ledger split at {at} failed after capacity check: {e}");
            }
        };
        if let Some(next) = old_next {
            slab.get_mut(next).prev = Some(upper);
        }
        let node = slab.get_mut(index);
        node.block.pages = lower_pages;
        node.next = Some(upper);
        self.count += 1;
        upper
    }

    fn unlink(&mut self, slab: &mut LedgerSlab, index: SlabIndex) -> MemoryBlock {
        let LedgerNode { block, prev, next } = slab.free(index);
        match (prev, next) {
            (Some(prev), _) => slab.get_mut(prev).next = next,
            (None, Some(next)) => self.head = next,
            (None, None) => panic!("ledger must keep at least one block"),
        }
        if let Some(next) = next {
            slab.get_mut(next).prev = prev;
        }
        self.count -= 1;
        block
    }

    fn merge_with_prev(&mut self, slab: &mut LedgerSlab, index: SlabIndex) -> SlabIndex {
        let node = slab.get(index);
        if let Some(prev) = node.prev
            && slab.get(prev).block.state == node.block.state
        {
            let removed = self.unlink(slab, index);
            slab.get_mut(prev).block.pages += removed.pages;
            return prev;
        }
        index
    }

    fn merge_with_next(&mut self, slab: &mut LedgerSlab, index: SlabIndex) {
        let node = slab.get(index);
        if let Some(next) = node.next
            && slab.get(next).block.state == node.block.state
        {
            let removed = self.unlink(slab, next);
            slab.get_mut(index).block.pages += removed.pages;
        }
    }

    /// Full scan of the partition and merge invariants.
    ///
    /// # Errors
    /// The first violation found.
    pub fn verify(&self, slab: &LedgerSlab) -> Result<(), LedgerViolation> {
        let head = slab.get(self.head);
        if head.block.base != self.range.start() {
            return Err(LedgerViolation::Start {
                expected: self.range.start(),
                found: head.block.base,
            });
        }
        if head.prev.is_some() {
            return Err(LedgerViolation::BrokenLink(head.block.base));
        }

        let mut found = 0;
        let mut previous: Option<(SlabIndex, MemoryBlock)> = None;
        let mut cursor = Some(self.head);
        while let Some(index) = cursor {
            let node = slab.get(index);
            let block = node.block;
            found += 1;
            if block.pages == 0 {
                return Err(LedgerViolation::Empty(block.base));
            }
            if let Some((prev_index, prev)) = previous {
                if node.prev != Some(prev_index) {
                    return Err(LedgerViolation::BrokenLink(block.base));
                }
                if prev.end() != block.base {
                    return Err(LedgerViolation::Discontinuity {
                        left_end: prev.end(),
                        right: block.base,
                    });
                }
                if prev.state == block.state {
                    return Err(LedgerViolation::Unmerged(block.base));
                }
            }
            previous = Some((index, block));
            cursor = node.next;
        }

        if let Some((_, last)) = previous
            && last.end() != self.range.end()
        {
            return Err(LedgerViolation::End {
                expected: self.range.end(),
                found: last.end(),
            });
        }
        if found != self.count {
            return Err(LedgerViolation::Count {
                expected: self.count,
                found,
            });
        }
        Ok(())
    }

    /// Returns every node to the slab.
    pub fn release(self, slab: &mut LedgerSlab) {
        let mut cursor = Some(self.head);
        while let Some(index) = cursor {
            cursor = slab.free(index).next;
        }
    }
}

/// Iterator over ledger blocks.
pub struct Blocks<'a> {
    slab: &'a LedgerSlab,
    next: Option<SlabIndex>,
    until: Option<VirtualAddress>,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = &'a MemoryBlock;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        let node = self.slab.get(index);
        if let Some(until) = self.until
            && node.block.base >= until
        {
            self.next = None;
            return None;
        }
        self.next = node.next;
        Some(&node.block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryPermission, MemoryState};

    fn range(start: u64, pages: u64) -> PageRange {
        PageRange::from_pages(VirtualAddress::new(start), pages)
    }

    fn heap(permission: MemoryPermission) -> BlockState {
        BlockState::new(MemoryState::Heap, permission)
    }

    fn layout(ledger: &BlockLedger, slab: &LedgerSlab) -> Vec<(u64, u64, BlockState)> {
        ledger
            .iter(slab)
            .map(|b| (b.base.as_u64(), b.pages, b.state))
            .collect()
    }

    #[test]
    fn update_splits_and_merges() {
        let mut slab = LedgerSlab::with_capacity(16);
        let mut ledger = BlockLedger::new(&mut slab, range(0x10_000, 16)).unwrap();

        ledger.update(&mut slab, range(0x14_000, 4), heap(MemoryPermission::ReadWrite));
        assert_eq!(ledger.block_count(), 3);
        ledger.verify(&slab).unwrap();

        // adjacent update with the same state merges into one block
        ledger.update(&mut slab, range(0x18_000, 2), heap(MemoryPermission::ReadWrite));
        assert_eq!(
            layout(&ledger, &slab),
            [
                (0x10_000, 4, BlockState::UNMAPPED),
                (0x14_000, 6, heap(MemoryPermission::ReadWrite)),
                (0x1A_000, 6, BlockState::UNMAPPED),
            ]
        );

        // overwriting across several blocks collapses them
        ledger.update(&mut slab, range(0x10_000, 16), BlockState::UNMAPPED);
        assert_eq!(ledger.block_count(), 1);
        assert_eq!(slab.in_use(), 1);
        ledger.verify(&slab).unwrap();
    }

    #[test]
    fn update_at_ledger_edges() {
        let mut slab = LedgerSlab::with_capacity(8);
        let mut ledger = BlockLedger::new(&mut slab, range(0x0, 4)).unwrap();
        ledger.update(&mut slab, range(0x0, 1), heap(MemoryPermission::Read));
        ledger.update(&mut slab, range(0x3000, 1), heap(MemoryPermission::Read));
        assert_eq!(ledger.block_count(), 3);
        ledger.update(&mut slab, range(0x1000, 2), heap(MemoryPermission::Read));
        assert_eq!(ledger.block_count(), 1);
        ledger.verify(&slab).unwrap();
    }

    #[test]
    fn check_range_requires_single_block() {
        let mut slab = LedgerSlab::with_capacity(8);
        let mut ledger = BlockLedger::new(&mut slab, range(0x10_000, 8)).unwrap();
        ledger.update(&mut slab, range(0x12_000, 2), heap(MemoryPermission::ReadWrite));

        let is_heap = |s: &BlockState| s.state == MemoryState::Heap;
        assert!(ledger.check_range(&slab, range(0x12_000, 2), is_heap).is_some());
        assert!(ledger.check_range(&slab, range(0x12_000, 3), is_heap).is_none());
        assert!(ledger.check_range(&slab, range(0x11_000, 2), is_heap).is_none());
        assert!(ledger.check_range(&slab, range(0x20_000, 1), |_| true).is_none());
    }

    #[test]
    fn overlapping_stops_at_range_end() {
        let mut slab = LedgerSlab::with_capacity(8);
        let mut ledger = BlockLedger::new(&mut slab, range(0x10_000, 8)).unwrap();
        ledger.update(&mut slab, range(0x12_000, 2), heap(MemoryPermission::ReadWrite));
        let bases: Vec<_> = ledger
            .overlapping(&slab, range(0x11_000, 2))
            .map(|b| b.base.as_u64())
            .collect();
        assert_eq!(bases, [0x10_000, 0x12_000]);
    }

    #[test]
    fn release_returns_every_node() {
        let mut slab = LedgerSlab::with_capacity(8);
        let mut ledger = BlockLedger::new(&mut slab, range(0x10_000, 8)).unwrap();
        ledger.update(&mut slab, range(0x12_000, 2), heap(MemoryPermission::ReadWrite));
        assert_eq!(slab.in_use(), 3);
        ledger.release(&mut slab);
        assert_eq!(slab.in_use(), 0);
    }
}
