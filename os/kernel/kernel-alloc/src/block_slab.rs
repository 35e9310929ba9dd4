use crate::{SlabExhausted, SlabHeap, SlabIndex};

/// Which pool a process draws its ledger nodes from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SlabPool {
    /// System processes: sized for many small mappings.
    Large,
    /// Applications.
    Small,
}

/// The two bounded node pools shared by all process memory managers.
#[derive(Debug)]
pub struct BlockSlabManager<T> {
    large: SlabHeap<T>,
    small: SlabHeap<T>,
}

impl<T> BlockSlabManager<T> {
    #[must_use]
    pub fn new(large_blocks: usize, small_blocks: usize) -> Self {
        log::debug!("block slab pools: {large_blocks} large, {small_blocks} small");
        Self {
            large: SlabHeap::with_capacity(large_blocks),
            small: SlabHeap::with_capacity(small_blocks),
        }
    }

    #[must_use]
    pub const fn pool(&self, pool: SlabPool) -> &SlabHeap<T> {
        match pool {
            SlabPool::Large => &self.large,
            SlabPool::Small => &self.small,
        }
    }

    pub const fn pool_mut(&mut self, pool: SlabPool) -> &mut SlabHeap<T> {
        match pool {
            SlabPool::Large => &mut self.large,
            SlabPool::Small => &mut self.small,
        }
    }

    #[must_use]
    pub fn can_allocate(&self, pool: SlabPool, count: usize) -> bool {
        self.pool(pool).can_allocate(count)
    }

    /// # Errors
    /// [`SlabExhausted`] if the selected pool is empty.
    pub fn allocate(&mut self, pool: SlabPool, value: T) -> Result<SlabIndex, SlabExhausted> {
        self.pool_mut(pool).allocate(value)
    }

    pub fn free(&mut self, pool: SlabPool, index: SlabIndex) -> T {
        self.pool_mut(pool).free(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pools_are_independent() {
        let mut slabs = BlockSlabManager::new(2, 1);
        let s = slabs.allocate(SlabPool::Small, 1).unwrap();
        assert!(!slabs.can_allocate(SlabPool::Small, 1));
        assert!(slabs.can_allocate(SlabPool::Large, 2));
        assert!(slabs.allocate(SlabPool::Small, 2).is_err());
        assert_eq!(slabs.free(SlabPool::Small, s), 1);
        assert!(slabs.can_allocate(SlabPool::Small, 1));
    }
}
