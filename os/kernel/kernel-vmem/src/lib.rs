//! # Guest Virtual Memory
//!
//! The emulated kernel does not use the host MMU to enforce guest memory
//! rules. Instead every process owns a [`MemoryManager`] whose
//! [`BlockLedger`] is the source of truth for the state, permission and
//! attributes of every guest page, and whose page table translates guest pages
//! to frames of emulated DRAM.
//!
//! ## Ledger
//!
//! The ledger partitions the address space into [`MemoryBlock`]s:
//!
//! ```text
//!  ADDRESS_SPACE_START                                      ADDRESS_SPACE_END
//!  ├── Unmapped ──┼── CodeStatic RX ──┼── Unmapped ──┼── Heap RW ──┼── ... ──┤
//! ```
//!
//! * blocks never overlap and leave no gaps,
//! * neighbouring blocks always differ in [`BlockState`],
//! * nodes come from a bounded slab pool; an operation that could run the
//!   pool dry is rejected with `OutOfResource` before it mutates anything.
//!
//! ## Operations
//!
//! | Operation | Guest call |
//! |-----------|------------|
//! | [`MemoryManager::map`] / [`MemoryManager::unmap`] | process loading, heap |
//! | [`MemoryManager::protect`] | `SetMemoryPermission` |
//! | [`MemoryManager::map_alias`] / [`MemoryManager::unmap_alias`] | `MapMemory` / `UnmapMemory` |
//! | [`MemoryManager::set_heap_size`] | `SetHeapSize` |
//! | [`MemoryManager::query`] | `QueryMemory` |
//!
//! Guest memory is read and written through [`MemoryManager::read`],
//! [`MemoryManager::write`] and the span helpers, which validate the access
//! against the ledger first.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod access;
mod block;
mod layout;
mod ledger;
mod manager;
mod page_table;
mod state;

pub use access::{AccessKind, MemoryAccessError};
pub use block::{MemoryBlock, MemoryInfo};
pub use layout::AddressSpaceLayout;
pub use ledger::{BlockLedger, Blocks, LedgerNode, LedgerSlab, LedgerViolation};
pub use manager::{Backing, BlockSlab, MemoryManager, MemoryResources};
pub use page_table::{GuestPageTable, PageEntry};
pub use state::{BlockState, MemoryAttribute, MemoryPermission, MemoryState, MemoryStateFlags};
