//! Boot protocol dispatch.
//!
//! A started module installs a `BootProtocol` interface in the firmware
//! protocol database and registers its GUID under a system type name.
//! Dispatching a boot request means resolving the name, opening the
//! interface and calling through it with the assembled parameters.

use alloc::string::{String, ToString};

use xtldr_core::efi::{status, Status};
use xtldr_core::firmware::Firmware;
use xtldr_core::{log_debug, log_error};

use crate::context::BootContext;
use crate::error::LoadError;

/// Non-volatile variable recording the short name of the entry that was
/// booted last.
pub const LAST_BOOT_VARIABLE: &str = "XtLdrLastBootUsed";

/// Everything a boot protocol needs to bring a system up.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootParameters {
    /// System type name the protocol was resolved from.
    pub system_type: Option<String>,
    /// Directory the target system lives in.
    pub system_path: Option<String>,
    pub kernel_file: Option<String>,
    pub initrd_file: Option<String>,
    pub hal_file: Option<String>,
    /// Kernel command line.
    pub parameters: Option<String>,
}

/// Interface installed by boot protocol modules.
#[repr(C)]
pub struct BootProtocol {
    pub boot_system: extern "efiapi" fn(*mut BootParameters) -> Status,
}

/// Dispatch the boot entry `short_name`, described by `(key, value)`
/// option pairs.
///
/// `BOOTMODULES` is loaded up front so the protocol named by `SYSTEMTYPE`
/// exists by the time it is resolved. Unknown keys are logged and skipped.
/// On a successful resolution the entry's short name is recorded in
/// non-volatile storage before control is handed to the protocol.
pub fn invoke_boot_protocol<F: Firmware + ?Sized>(
    context: &mut BootContext,
    firmware: &F,
    short_name: &str,
    options: &[(&str, &str)],
) -> Result<(), LoadError> {
    let mut parameters = BootParameters::default();
    let mut system_type = None;

    for &(key, value) in options {
        if key.eq_ignore_ascii_case("SYSTEMTYPE") {
            system_type = Some(value);
        } else if key.eq_ignore_ascii_case("SYSTEMPATH") {
            parameters.system_path = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("KERNELFILE") {
            parameters.kernel_file = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("INITRDFILE") {
            parameters.initrd_file = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("HALFILE") {
            parameters.hal_file = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("PARAMETERS") {
            parameters.parameters = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("BOOTMODULES") {
            context.load_modules(firmware, value)?;
        } else {
            log_debug!("ignoring boot option {key}");
        }
    }

    let system_type = system_type.ok_or(LoadError::MissingBootOption("SYSTEMTYPE"))?;
    parameters.system_type = Some(system_type.to_string());

    let protocol_guid = context
        .find_boot_protocol(system_type)
        .ok_or_else(|| LoadError::ProtocolNotFound(system_type.to_string()))?;

    // Best effort; booting proceeds even if the variable store is full.
    let result = firmware.set_variable(LAST_BOOT_VARIABLE, short_name.as_bytes());
    if !status::is_success(result) {
        log_error!("failed to record last booted entry: {result:#x}");
    }

    let interface = firmware
        .open_protocol(&protocol_guid)
        .map_err(LoadError::Firmware)?;
    let protocol = unsafe { &*(interface as *const BootProtocol) };

    log_debug!("booting system type {system_type}");
    let result = (protocol.boot_system)(&mut parameters);
    if !status::is_success(result) {
        log_error!("boot protocol for {system_type} returned {result:#x}");
        return Err(LoadError::Firmware(result));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ffi::c_void;
    use core::sync::atomic::{AtomicBool, Ordering};
    use xtldr_core::efi::guid;
    use xtldr_core::mock::MockFirmware;

    static BOOTED: AtomicBool = AtomicBool::new(false);

    extern "efiapi" fn record_boot(parameters: *mut BootParameters) -> Status {
        let parameters = unsafe { &*parameters };
        if parameters.kernel_file.as_deref() != Some("XTOSKRNL.EXE") {
            return status::INVALID_PARAMETER;
        }
        if parameters.system_type.as_deref() != Some("xtos") {
            return status::INVALID_PARAMETER;
        }
        BOOTED.store(true, Ordering::SeqCst);
        status::SUCCESS
    }

    extern "efiapi" fn refuse_boot(_parameters: *mut BootParameters) -> Status {
        status::LOAD_ERROR
    }

    #[test]
    fn test_dispatch_calls_protocol() {
        let protocol_guid = guid!("33333333-3333-3333-3333-333333333333");
        let fw = MockFirmware::new();
        let mut protocol = BootProtocol {
            boot_system: record_boot,
        };
        fw.install_protocol(protocol_guid, &mut protocol as *mut _ as *mut c_void);

        let mut context = BootContext::new();
        context
            .register_boot_protocol("xtos", protocol_guid)
            .unwrap();

        BOOTED.store(false, Ordering::SeqCst);
        invoke_boot_protocol(
            &mut context,
            &fw,
            "ExectOS",
            &[
                ("SystemType", "xtos"),
                ("KernelFile", "XTOSKRNL.EXE"),
                ("SystemPath", "\\EFI\\XTOS"),
                ("Comment", "ignored"),
            ],
        )
        .unwrap();

        assert!(BOOTED.load(Ordering::SeqCst));
        assert_eq!(
            fw.variable(LAST_BOOT_VARIABLE).as_deref(),
            Some("ExectOS".as_bytes())
        );
    }

    #[test]
    fn test_unregistered_system_type() {
        let fw = MockFirmware::new();
        let mut context = BootContext::new();
        assert_eq!(
            invoke_boot_protocol(&mut context, &fw, "BeOS", &[("SYSTEMTYPE", "beos")])
                .unwrap_err(),
            LoadError::ProtocolNotFound(String::from("beos"))
        );
    }

    #[test]
    fn test_missing_system_type() {
        let fw = MockFirmware::new();
        let mut context = BootContext::new();
        assert_eq!(
            invoke_boot_protocol(&mut context, &fw, "Broken", &[("KERNELFILE", "A.EXE")])
                .unwrap_err(),
            LoadError::MissingBootOption("SYSTEMTYPE")
        );
    }

    #[test]
    fn test_protocol_failure_reported() {
        let protocol_guid = guid!("44444444-4444-4444-4444-444444444444");
        let fw = MockFirmware::new();
        let mut protocol = BootProtocol {
            boot_system: refuse_boot,
        };
        fw.install_protocol(protocol_guid, &mut protocol as *mut _ as *mut c_void);

        let mut context = BootContext::new();
        context
            .register_boot_protocol("bad", protocol_guid)
            .unwrap();
        assert_eq!(
            invoke_boot_protocol(&mut context, &fw, "Bad", &[("SYSTEMTYPE", "bad")]).unwrap_err(),
            LoadError::Firmware(status::LOAD_ERROR)
        );
    }
}
