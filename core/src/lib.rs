//! XTLDR core primitives.
//!
//! Shared foundation for the XTLDR boot loader crates: EFI primitive types
//! and status codes, the firmware capability traits that the PE/COFF loader
//! and module subsystem are written against, and the boot-time debug logger.
//!
//! Everything here is `no_std` + `alloc`; the concrete UEFI bindings live in
//! the `xtldr-bootloader` crate, and an in-memory stand-in for tests is
//! available behind the `mock-firmware` feature.

#![no_std]

extern crate alloc;

pub mod efi;
pub mod firmware;
pub mod logger;

#[cfg(feature = "mock-firmware")]
pub mod mock;
