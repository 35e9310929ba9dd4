//! Bitmap allocator for guest DRAM page frames.

use alloc::vec;
use alloc::vec::Vec;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::PhysicalAddress;

/// Tracks free/used 4 KiB frames of guest DRAM with one bit per frame.
#[derive(Debug)]
pub struct FrameAllocator {
    /// Bit set means the frame is in use.
    bitmap: Vec<u64>,
    frames: u64,
    free: u64,
    /// Word index where the next search starts.
    hint: usize,
}

impl FrameAllocator {
    /// Manages `size` bytes of DRAM starting at physical address zero.
    #[must_use]
    pub fn new(size: u64) -> Self {
        let frames = size / PAGE_SIZE;
        let words = usize::try_from(frames.div_ceil(64)).unwrap_or(usize::MAX);
        let mut bitmap = vec![0u64; words];
        // mark the tail bits past the last frame as used
        let tail = frames % 64;
        if tail != 0
            && let Some(last) = bitmap.last_mut()
        {
            *last = !((1u64 << tail) - 1);
        }
        Self {
            bitmap,
            frames,
            free: frames,
            hint: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.frames
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.free
    }

    #[inline]
    #[must_use]
    pub const fn used_bytes(&self) -> u64 {
        (self.frames - self.free) * PAGE_SIZE
    }

    /// Allocates one frame.
    pub fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        if self.free == 0 {
            return None;
        }
        let words = self.bitmap.len();
        for step in 0..words {
            let w = (self.hint + step) % words;
            let word = self.bitmap[w];
            if word != u64::MAX {
                let bit = (!word).trailing_zeros();
                self.bitmap[w] |= 1 << bit;
                self.free -= 1;
                self.hint = w;
                let frame = (w as u64) * 64 + u64::from(bit);
                return Some(PhysicalAddress::from_frame_number(frame));
            }
        }
        None
    }

    /// Allocates `count` frames, not necessarily contiguous. All or nothing.
    pub fn alloc_many(&mut self, count: u64) -> Option<Vec<PhysicalAddress>> {
        if count > self.free {
            return None;
        }
        let mut frames = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
        for _ in 0..count {
            match self.alloc_4k() {
                Some(pa) => frames.push(pa),
                None => {
                    for pa in frames {
                        self.free_4k(pa);
                    }
                    return None;
                }
            }
        }
        Some(frames)
    }

    /// Returns a frame to the pool.
    ///
    /// # Panics
    /// If the frame is out of range or already free.
    pub fn free_4k(&mut self, pa: PhysicalAddress) {
        let frame = pa.frame_number();
        assert!(frame < self.frames, "frame {pa} outside of guest DRAM");
        let (w, bit) = ((frame / 64) as usize, frame % 64);
        assert!(self.bitmap[w] & (1 << bit) != 0, "frame {pa} freed twice");
        self.bitmap[w] &= !(1 << bit);
        self.free += 1;
    }

    #[must_use]
    pub fn is_allocated(&self, pa: PhysicalAddress) -> bool {
        let frame = pa.frame_number();
        frame < self.frames && self.bitmap[(frame / 64) as usize] & (1 << (frame % 64)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_every_frame_exactly_once() {
        let mut fa = FrameAllocator::new(70 * PAGE_SIZE);
        let mut seen = std::collections::HashSet::new();
        while let Some(pa) = fa.alloc_4k() {
            assert!(pa.is_page_aligned());
            assert!(seen.insert(pa));
        }
        assert_eq!(seen.len(), 70);
        assert_eq!(fa.free_frames(), 0);
    }

    #[test]
    fn alloc_many_is_all_or_nothing() {
        let mut fa = FrameAllocator::new(4 * PAGE_SIZE);
        assert!(fa.alloc_many(5).is_none());
        assert_eq!(fa.free_frames(), 4);
        let frames = fa.alloc_many(3).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(fa.used_bytes(), 3 * PAGE_SIZE);
        for pa in frames {
            assert!(fa.is_allocated(pa));
            fa.free_4k(pa);
        }
        assert_eq!(fa.free_frames(), 4);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_is_fatal() {
        let mut fa = FrameAllocator::new(PAGE_SIZE);
        let pa = fa.alloc_4k().unwrap();
        fa.free_4k(pa);
        fa.free_4k(pa);
    }
}
