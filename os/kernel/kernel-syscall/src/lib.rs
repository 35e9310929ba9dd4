//! # Guest Supervisor Calls
//!
//! The JIT traps a guest `svc #imm` and hands the kernel the immediate plus
//! the guest's argument registers. This crate names the immediates the kernel
//! implements ([`Sysno`]) and defines the register frame ([`SvcFrame`]) through
//! which arguments come in and results go out.
//!
//! Results follow the guest ABI: `x0` carries the result code (`0` on
//! success) and any further outputs occupy `x1` onwards.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod frame;
mod syscall;

pub use frame::SvcFrame;
pub use syscall::{Sysno, UnknownSyscall};
