//! Loader entry point.
//!
//! The EFI stub binary forwards its `efi_main` arguments here after
//! installing the global allocator and panic handler.

use xtldr_core::efi::{status, Handle, Status};
use xtldr_core::{log_debug, log_error};
use xtldr_modules::{invoke_boot_protocol, BootContext};

use crate::allocator;
use crate::firmware::UefiFirmware;
use crate::tables::SystemTable;

/// Boot options used until a configuration source is wired up.
const DEFAULT_BOOT_OPTIONS: [(&str, &str); 4] = [
    ("BOOTMODULES", "xtos"),
    ("SYSTEMTYPE", "XTOS"),
    ("SYSTEMPATH", "\\ExectOS"),
    ("KERNELFILE", "XTOSKRNL.EXE"),
];

/// Load the boot modules and dispatch the default boot request.
///
/// # Safety
/// `system_table` must be the pointer the firmware passed to `efi_main`
/// and must stay valid for the whole call.
pub unsafe fn xtldr_main(image_handle: Handle, system_table: *mut SystemTable) -> Status {
    allocator::set_boot_services((*system_table).boot_services);
    let firmware = UefiFirmware::new(image_handle, system_table);

    log_debug!("XTLDR starting");
    let mut context = BootContext::new();
    let result = invoke_boot_protocol(&mut context, &firmware, "ExectOS", &DEFAULT_BOOT_OPTIONS);

    // Reaching this point at all means the boot attempt failed or the
    // protocol returned; surface the log either way.
    if let Err(error) = &result {
        log_error!("boot failed: {error}");
    }
    firmware.drain_log();

    match result {
        Ok(()) => status::SUCCESS,
        Err(_) => status::LOAD_ERROR,
    }
}
