//! Loader module management and boot protocol dispatch.
//!
//! Modules are PE/COFF EFI drivers found on the boot volume; each carries a
//! `.modinfo` section describing itself and the modules it wants loaded
//! first. Once started, a module registers a boot protocol by name, and a
//! boot request is dispatched to it through the firmware protocol database.

#![no_std]

extern crate alloc;

pub mod context;
pub mod error;
pub mod modinfo;
pub mod protocol;

pub use context::{module_search_paths, BootContext, ModuleInfo};
pub use error::{LoadError, RegistryError};
pub use modinfo::{module_info_strings, ModuleMetadata};
pub use protocol::{invoke_boot_protocol, BootParameters, BootProtocol, LAST_BOOT_VARIABLE};
