//! # Guest Kernel Constants and Result Codes
//!
//! This crate is the single source of truth for the fixed parameters of the
//! emulated guest kernel. The guest software was compiled against one specific
//! kernel, so these values are not configuration in the usual sense: core count,
//! priority range and address-space layout are part of the contract guest
//! binaries rely on.
//!
//! ## Modules
//!
//! ### Scheduling ([`scheduling`])
//! * **Cores**: number of emulated CPU cores and the core mask helpers
//! * **Priorities**: the guest priority range and the idle sentinel
//! * **Preemption**: the default round-robin quantum
//!
//! ### Memory Layout ([`memory`])
//! * **Pages**: guest page size and alignment
//! * **Address Space**: the 39-bit guest address space and its regions
//! * **Slab Pools**: the bounded number of ledger nodes per pool
//!
//! ### Result Codes ([`result`])
//! The guest-visible [`KernelResult`](result::KernelResult) codes returned from
//! supervisor calls. Guest code branches on these values, so every variant
//! encodes the exact 32-bit value the guest expects.
//!
//! ## Compile-Time Validation
//!
//! Layout constants are checked with `const` assertions so an inconsistent
//! edit fails the build instead of corrupting a guest address space:
//!
//! ```rust
//! use kernel_info::memory::{ADDRESS_SPACE_END, ADDRESS_SPACE_START, PAGE_SIZE};
//!
//! assert!(ADDRESS_SPACE_START < ADDRESS_SPACE_END);
//! assert!(ADDRESS_SPACE_START.is_multiple_of(PAGE_SIZE));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
pub mod result;
pub mod scheduling;

pub use result::KernelResult;
