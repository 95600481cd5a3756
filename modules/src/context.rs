//! Boot context: loaded modules and the boot protocol registry.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use xtldr_core::efi::{memory_type, status, Guid, Handle, PhysicalAddress, Status};
use xtldr_core::firmware::{FileAccess, Firmware};
use xtldr_core::{log_debug, log_error};

use crate::error::{LoadError, RegistryError};
use crate::modinfo::{self, ModuleMetadata};

#[cfg(target_arch = "aarch64")]
const ARCH_NAME: &str = "AARCH64";
#[cfg(target_arch = "x86")]
const ARCH_NAME: &str = "I686";
#[cfg(not(any(target_arch = "aarch64", target_arch = "x86")))]
const ARCH_NAME: &str = "AMD64";

/// Directories searched for module images: the common directory first,
/// then the architecture-specific one.
pub fn module_search_paths() -> [String; 2] {
    [
        String::from("\\EFI\\BOOT\\XTLDR\\MODULES"),
        format!("\\EFI\\BOOT\\XTLDR\\MODULES\\{ARCH_NAME}"),
    ]
}

/// A module that was loaded and started.
pub struct ModuleInfo {
    pub name: String,
    pub handle: Handle,
    pub metadata: ModuleMetadata,
    /// Base address the firmware placed the module at.
    pub base: PhysicalAddress,
    pub size: u64,
    /// Loaded-image protocol revision.
    pub revision: u32,
    /// Unload callback the module installed, if any.
    pub unload: Option<extern "efiapi" fn(Handle) -> Status>,
}

struct BootProtocolEntry {
    name: String,
    guid: Guid,
}

/// All mutable loader state, threaded explicitly through the boot flow.
#[derive(Default)]
pub struct BootContext {
    loaded_modules: Vec<ModuleInfo>,
    /// Modules currently being loaded further up the call stack.
    loading: Vec<String>,
    boot_protocols: Vec<BootProtocolEntry>,
}

impl BootContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Modules loaded so far, in load order.
    pub fn modules(&self) -> &[ModuleInfo] {
        &self.loaded_modules
    }

    pub fn module(&self, name: &str) -> Option<&ModuleInfo> {
        self.loaded_modules
            .iter()
            .find(|module| module.name.eq_ignore_ascii_case(name))
    }

    /// Load and start one module and its dependencies.
    ///
    /// Loading an already loaded module is a no-op. A module that is still
    /// in flight deeper in the dependency chain means the chain is cyclic
    /// and the load fails immediately.
    pub fn load_module<F: Firmware + ?Sized>(
        &mut self,
        firmware: &F,
        name: &str,
    ) -> Result<(), LoadError> {
        if self
            .loaded_modules
            .iter()
            .any(|module| module.name.eq_ignore_ascii_case(name))
        {
            log_debug!("module {name} already loaded");
            return Ok(());
        }
        if self.loading.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            return Err(LoadError::Cycle(name.to_string()));
        }

        self.loading.push(name.to_string());
        let result = self.load_module_worker(firmware, name);
        self.loading.pop();
        result
    }

    fn load_module_worker<F: Firmware + ?Sized>(
        &mut self,
        firmware: &F,
        name: &str,
    ) -> Result<(), LoadError> {
        let (path, mut file) = open_module_file(firmware, name)?;
        let data =
            xtldr_core::firmware::read_file(file.as_mut()).map_err(LoadError::Firmware)?;

        // Dependencies come from the module description, so it is read
        // before the image is handed to the firmware.
        let section = xtldr_pecoff::find_section(&data, ".modinfo")?;
        let strings = modinfo::module_info_strings(section)?;
        let metadata = ModuleMetadata::parse(&strings);

        for dependency in &metadata.dependencies {
            log_debug!("module {name} depends on {dependency}");
            if let Err(error) = self.load_module(firmware, dependency) {
                if matches!(error, LoadError::Cycle(_)) {
                    return Err(error);
                }
                log_error!("dependency {dependency} of {name} failed: {error}");
                return Err(LoadError::Unsupported(dependency.clone()));
            }
        }

        let handle = firmware.load_image(&data, &path).map_err(|result| {
            if result == status::ACCESS_DENIED && firmware.secure_boot_active() {
                LoadError::SignatureRejected
            } else {
                LoadError::Firmware(result)
            }
        })?;

        let info = firmware
            .loaded_image_info(handle)
            .map_err(LoadError::Firmware)?;
        if info.code_type != memory_type::BOOT_SERVICES_CODE {
            log_error!(
                "module {name} loaded with memory type {:#x}, dropping it",
                info.code_type
            );
            firmware.unload_image(handle);
            return Err(LoadError::InvalidModuleType);
        }

        firmware.start_image(handle).map_err(LoadError::Firmware)?;
        log_debug!("module {name} started from {path}");
        self.loaded_modules.push(ModuleInfo {
            name: name.to_string(),
            handle,
            metadata,
            base: info.image_base,
            size: info.image_size,
            revision: info.revision,
            unload: info.unload,
        });
        Ok(())
    }

    /// Load every module in a space-separated list.
    ///
    /// Failures are logged and do not stop the remaining modules from
    /// loading; the last failure is reported.
    pub fn load_modules<F: Firmware + ?Sized>(
        &mut self,
        firmware: &F,
        list: &str,
    ) -> Result<(), LoadError> {
        let mut failure = None;
        for name in list.split_whitespace() {
            if let Err(error) = self.load_module(firmware, name) {
                log_error!("failed to load module {name}: {error}");
                failure = Some(error);
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Register a boot protocol under a system type name.
    ///
    /// Names are case-insensitive and first registration wins.
    pub fn register_boot_protocol(
        &mut self,
        name: &str,
        guid: Guid,
    ) -> Result<(), RegistryError> {
        if self
            .boot_protocols
            .iter()
            .any(|entry| entry.name.eq_ignore_ascii_case(name))
        {
            return Err(RegistryError::AlreadyRegistered);
        }
        log_debug!("registered boot protocol {name}");
        self.boot_protocols.push(BootProtocolEntry {
            name: name.to_string(),
            guid,
        });
        Ok(())
    }

    /// Look up the protocol GUID registered for a system type.
    pub fn find_boot_protocol(&self, name: &str) -> Option<Guid> {
        self.boot_protocols
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
            .map(|entry| entry.guid)
    }
}

fn open_module_file<F: Firmware + ?Sized>(
    firmware: &F,
    name: &str,
) -> Result<(String, Box<dyn FileAccess>), LoadError> {
    let mut last = status::NOT_FOUND;
    for directory in module_search_paths() {
        let path = format!("{directory}\\{name}.EFI");
        match firmware.open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(result) => last = result,
        }
    }
    Err(LoadError::Firmware(last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;
    use xtldr_core::efi::guid;
    use xtldr_core::mock::MockFirmware;
    use xtldr_pecoff::testimg::{utf16_table, ImageSpec, SectionSpec};

    fn module_file(entries: &[&str]) -> Vec<u8> {
        let mut spec = ImageSpec::new64();
        spec.sections.push(SectionSpec {
            name: ".modinfo",
            virtual_address: 0x2000,
            virtual_size: 0,
            data: utf16_table(entries),
        });
        spec.build()
    }

    fn add_module(fw: &MockFirmware, name: &str, entries: &[&str]) {
        fw.add_file(
            &format!("\\EFI\\BOOT\\XTLDR\\MODULES\\{name}.EFI"),
            module_file(entries),
        );
    }

    #[test]
    fn test_load_module_starts_image() {
        let fw = MockFirmware::new();
        add_module(&fw, "XTOS", &["author=XT Team", "version=1.0"]);

        let mut context = BootContext::new();
        context.load_module(&fw, "xtos").unwrap();

        assert_eq!(context.modules().len(), 1);
        assert_eq!(fw.started_paths().len(), 1);
        let module = context.module("XTOS").unwrap();
        assert_eq!(module.metadata.version.as_deref(), Some("1.0"));
        assert_eq!(module.revision, 0x1000);
        assert!(module.size > 0);
    }

    #[test]
    fn test_duplicate_load_is_idempotent() {
        let fw = MockFirmware::new();
        add_module(&fw, "XTOS", &["version=1.0"]);

        let mut context = BootContext::new();
        context.load_module(&fw, "xtos").unwrap();
        context.load_module(&fw, "XTOS").unwrap();

        assert_eq!(context.modules().len(), 1);
        assert_eq!(fw.image_count(), 1);
        assert_eq!(fw.started_paths().len(), 1);
    }

    #[test]
    fn test_dependencies_start_first() {
        let fw = MockFirmware::new();
        add_module(&fw, "XTOS", &["softdeps=acpi fb"]);
        add_module(&fw, "ACPI", &["version=1"]);
        add_module(&fw, "FB", &["version=1"]);

        let mut context = BootContext::new();
        context.load_module(&fw, "xtos").unwrap();

        let started: Vec<String> = fw
            .started_paths()
            .iter()
            .map(|path| path.to_ascii_uppercase())
            .collect();
        assert_eq!(started.len(), 3);
        // Dependencies keep their declared names; paths match either case.
        assert!(started[0].ends_with("\\ACPI.EFI"));
        assert!(started[1].ends_with("\\FB.EFI"));
        assert!(started[2].ends_with("\\XTOS.EFI"));
    }

    #[test]
    fn test_dependency_cycle_fails_fast() {
        let fw = MockFirmware::new();
        add_module(&fw, "A", &["softdeps=b"]);
        add_module(&fw, "B", &["softdeps=a"]);

        let mut context = BootContext::new();
        let error = context.load_module(&fw, "a").unwrap_err();
        assert!(matches!(error, LoadError::Cycle(_)));
        assert!(fw.started_paths().is_empty());
    }

    #[test]
    fn test_missing_dependency_reported() {
        let fw = MockFirmware::new();
        add_module(&fw, "XTOS", &["softdeps=nosuch"]);

        let mut context = BootContext::new();
        assert_eq!(
            context.load_module(&fw, "xtos").unwrap_err(),
            LoadError::Unsupported(String::from("nosuch"))
        );
    }

    #[test]
    fn test_missing_modinfo_is_fatal() {
        let fw = MockFirmware::new();
        fw.add_file(
            "\\EFI\\BOOT\\XTLDR\\MODULES\\PLAIN.EFI",
            ImageSpec::new64().build(),
        );

        let mut context = BootContext::new();
        assert_eq!(
            context.load_module(&fw, "plain").unwrap_err(),
            LoadError::Image(xtldr_pecoff::ImageError::SectionNotFound)
        );
    }

    #[test]
    fn test_module_not_found() {
        let fw = MockFirmware::new();
        let mut context = BootContext::new();
        assert_eq!(
            context.load_module(&fw, "ghost").unwrap_err(),
            LoadError::Firmware(status::NOT_FOUND)
        );
    }

    #[test]
    fn test_secure_boot_rejection() {
        let fw = MockFirmware::new();
        add_module(&fw, "XTOS", &["version=1"]);
        fw.fail_load_image(status::ACCESS_DENIED);

        let mut context = BootContext::new();
        // Without secure boot the raw status is reported.
        assert_eq!(
            context.load_module(&fw, "xtos").unwrap_err(),
            LoadError::Firmware(status::ACCESS_DENIED)
        );

        fw.set_secure_boot(true);
        assert_eq!(
            context.load_module(&fw, "xtos").unwrap_err(),
            LoadError::SignatureRejected
        );
    }

    #[test]
    fn test_wrong_memory_type_unloads_module() {
        let fw = MockFirmware::new();
        add_module(&fw, "XTOS", &["version=1"]);
        fw.set_image_code_type(memory_type::LOADER_CODE);

        let mut context = BootContext::new();
        assert_eq!(
            context.load_module(&fw, "xtos").unwrap_err(),
            LoadError::InvalidModuleType
        );
        assert_eq!(fw.image_count(), 0);
        assert!(fw.started_paths().is_empty());
        assert!(context.modules().is_empty());
    }

    #[test]
    fn test_load_modules_continues_after_failure() {
        let fw = MockFirmware::new();
        add_module(&fw, "GOOD", &["version=1"]);
        add_module(&fw, "ALSOGOOD", &["version=1"]);

        let mut context = BootContext::new();
        let error = context
            .load_modules(&fw, "good missing alsogood")
            .unwrap_err();
        assert_eq!(error, LoadError::Firmware(status::NOT_FOUND));
        assert_eq!(context.modules().len(), 2);
    }

    #[test]
    fn test_protocol_registry_first_wins() {
        let first = guid!("11111111-1111-1111-1111-111111111111");
        let second = guid!("22222222-2222-2222-2222-222222222222");

        let mut context = BootContext::new();
        context.register_boot_protocol("linux", first).unwrap();
        assert_eq!(
            context.register_boot_protocol("LINUX", second).unwrap_err(),
            RegistryError::AlreadyRegistered
        );
        assert_eq!(context.find_boot_protocol("LiNuX"), Some(first));
        assert_eq!(context.find_boot_protocol("xtos"), None);
    }
}
