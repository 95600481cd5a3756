//! PE/COFF image loader and base-relocation engine.
//!
//! Loads executable images from boot volumes into firmware-allocated pages,
//! maps sections to their virtual layout and applies base relocations so an
//! image can run from wherever the firmware placed it. Images carry either
//! the standard PE signature or the XT-native one; both are accepted
//! everywhere.

#![no_std]

extern crate alloc;

pub mod error;
pub mod headers;
pub mod loader;
pub mod relocation;

#[cfg(any(test, feature = "test-images"))]
pub mod testimg;

pub use error::{ImageError, Result};
pub use headers::find_section;
pub use loader::{load_image, unload_image, verify_image, PeCoffImage};
pub use relocation::{relocate_image, relocate_loaded_image};
