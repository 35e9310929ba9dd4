//! # Host Logging for the Guest Kernel
//!
//! The guest kernel runs as ordinary host threads, so its diagnostics go to
//! the host's standard error. This crate provides the [`log::Log`]
//! implementation the kernel installs at boot.
//!
//! ## Output Format
//!
//! Every record is written as one line:
//!
//! ```text
//! [LEVEL] target: message
//! ```
//!
//! A line is formatted completely before it is written, so lines from
//! different host threads never interleave.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kernel_log::HostLogger;
//! use log::{LevelFilter, info};
//!
//! HostLogger::new(LevelFilter::Debug).init().expect("logger initialization");
//! info!("kernel booted");
//! ```
//!
//! Tests call [`HostLogger::try_init_for_tests`], which tolerates a logger
//! installed by an earlier test in the same binary.

mod logger;

pub use logger::{HostLogger, write_record};

