//! # Kernel Memory Allocation
//!
//! Allocation infrastructure behind the guest memory manager. Nothing here
//! grows after construction: every pool is sized once when the kernel context
//! boots, so guest memory operations never trigger unbounded host allocation.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  BlockSlabManager                        │
//! │   • large pool (system processes)        │
//! │   • small pool (applications)            │
//! └──────────────┬───────────────────────────┘
//!                │ SlabHeap<T>: fixed array + index free list
//! ┌──────────────▼───────────────────────────┐
//! │  FrameAllocator                          │
//! │   • bitmap over guest DRAM page frames   │
//! └──────────────┬───────────────────────────┘
//!                │ PhysicalAddress
//! ┌──────────────▼───────────────────────────┐
//! │  PhysicalMemory                          │
//! │   • host bytes backing guest DRAM        │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Exhaustion
//!
//! Slab exhaustion is reported as [`SlabExhausted`]. Callers are expected to
//! check [`SlabHeap::can_allocate`] before mutating anything and to turn a
//! failed check into a guest-visible `OutOfResource`; an allocation failing
//! after a successful check is a kernel bug.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod block_slab;
mod frame_alloc;
mod physical_memory;
mod slab;

pub use block_slab::{BlockSlabManager, SlabPool};
pub use frame_alloc::FrameAllocator;
pub use physical_memory::{PhysicalAccessError, PhysicalMemory};
pub use slab::{SlabExhausted, SlabHeap, SlabIndex};
