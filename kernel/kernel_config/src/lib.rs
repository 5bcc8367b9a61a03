//! Configuration constants shared across the kernel.
//!
//! Everything here is a `pub const`; this crate exists so that the memory,
//! interrupt, and storage crates agree on layout without depending on each
//! other.

#![no_std]

pub mod memory;
pub mod interrupts;

/// The maximum number of CPUs the per-CPU structures are sized for.
pub const MAX_CPUS: usize = 64;
