//! Firmware-facing layer of the loader.
//!
//! Raw UEFI table bindings, the `Firmware` trait implementation backed by
//! them, the hybrid global allocator and the loader entry point. The final
//! EFI binary declares the `#[global_allocator]` and panic handler itself
//! and calls into `entry::xtldr_main`; keeping both out of this crate lets
//! the rest of the workspace run its tests on the host.

#![no_std]

extern crate alloc;

pub mod allocator;
pub mod entry;
pub mod firmware;
pub mod tables;

pub use allocator::HybridAllocator;
pub use firmware::UefiFirmware;
