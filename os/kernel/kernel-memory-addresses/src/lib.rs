//! # Guest Virtual and Physical Address Types
//!
//! Strongly typed wrappers for guest addresses used by the memory manager and
//! the guest memory access paths.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`VirtualAddress`] | An address in a guest process address space. |
//! | [`PhysicalAddress`] | An offset into emulated guest DRAM. |
//! | [`PageRange`] | A validated, page-granular, non-empty virtual range. |
//!
//! Guest pages are always [`PAGE_SIZE`](kernel_info::memory::PAGE_SIZE) bytes.
//! Ranges handed to the kernel must already be page aligned; nothing in this
//! crate rounds silently.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let range = PageRange::try_new(VirtualAddress::new(0x1000_0000), 0x3000).unwrap();
//! assert_eq!(range.pages(), 3);
//! assert_eq!(range.end(), VirtualAddress::new(0x1000_3000));
//!
//! assert_eq!(
//!     PageRange::try_new(VirtualAddress::new(0x1000_0800), 0x1000),
//!     Err(RangeError::MisalignedAddress(VirtualAddress::new(0x1000_0800)))
//! );
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

mod page_range;
mod physical_address;
mod virtual_address;

pub use page_range::{PageRange, RangeError};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;
