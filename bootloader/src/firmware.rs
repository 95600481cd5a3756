//! `Firmware` trait implementation over the raw UEFI tables.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ffi::c_void;
use core::ptr;

use xtldr_core::efi::{status, Guid, Handle, MemoryClass, PhysicalAddress, Status};
use xtldr_core::firmware::{
    FileAccess, FileSystem, ImageServices, LoadedImageInfo, MemoryOps, ProtocolOps, VariableOps,
};
use xtldr_core::{log_debug, logger};

use crate::tables::{
    BootServices, FileProtocol, LoadedImageProtocol, RuntimeServices, SimpleFileSystem,
    SystemTable, ALLOCATE_ANY_PAGES, FILE_INFO_GUID, FILE_MODE_READ, GLOBAL_VARIABLE_GUID,
    LOADED_IMAGE_PROTOCOL_GUID, SIMPLE_FILE_SYSTEM_PROTOCOL_GUID, VARIABLE_BOOTSERVICE_ACCESS,
    VARIABLE_NON_VOLATILE, VARIABLE_RUNTIME_ACCESS, XTLDR_VENDOR_GUID,
};

/// Firmware services bound to the loader's own image handle.
pub struct UefiFirmware {
    image_handle: Handle,
    system_table: *mut SystemTable,
    boot_services: *const BootServices,
    runtime_services: *const RuntimeServices,
}

impl UefiFirmware {
    /// Bind to the tables handed to the EFI entry point.
    ///
    /// # Safety
    /// `system_table` must be the pointer the firmware passed to the entry
    /// point and boot services must not have been exited.
    pub unsafe fn new(image_handle: Handle, system_table: *mut SystemTable) -> Self {
        let table = &*system_table;
        UefiFirmware {
            image_handle,
            system_table,
            boot_services: table.boot_services,
            runtime_services: table.runtime_services,
        }
    }

    fn boot_services(&self) -> &BootServices {
        unsafe { &*self.boot_services }
    }

    /// Write every buffered log line to the firmware console, then clear
    /// the buffer.
    pub fn drain_log(&self) {
        let con_out = unsafe { (*self.system_table).con_out };
        if con_out.is_null() {
            return;
        }
        logger::with_lines(|line| {
            let mut wide = to_utf16(line);
            // output_string expects its own terminator after CRLF.
            wide.pop();
            wide.extend_from_slice(&[b'\r' as u16, b'\n' as u16, 0]);
            unsafe {
                let _ = ((*con_out).output_string)(con_out, wide.as_ptr());
            }
        });
        logger::clear();
    }
}

impl MemoryOps for UefiFirmware {
    fn allocate_pages(&self, pages: usize, class: MemoryClass) -> Result<PhysicalAddress, Status> {
        let mut address: u64 = 0;
        let result = unsafe {
            (self.boot_services().allocate_pages)(
                ALLOCATE_ANY_PAGES,
                class.efi_memory_type(),
                pages,
                &mut address,
            )
        };
        if !status::is_success(result) {
            return Err(result);
        }
        Ok(address)
    }

    fn free_pages(&self, address: PhysicalAddress, pages: usize) {
        unsafe {
            let _ = (self.boot_services().free_pages)(address, pages);
        }
    }
}

struct UefiFile {
    file: *mut FileProtocol,
}

impl FileAccess for UefiFile {
    fn file_info(&mut self, buffer: &mut [u8], needed: &mut usize) -> Status {
        let mut size = buffer.len();
        let result = unsafe {
            ((*self.file).get_info)(
                self.file,
                &FILE_INFO_GUID,
                &mut size,
                buffer.as_mut_ptr().cast(),
            )
        };
        if result == status::BUFFER_TOO_SMALL {
            *needed = size;
        }
        result
    }

    fn read(&mut self, buffer: &mut [u8], read: &mut usize) -> Status {
        let mut size = buffer.len();
        let result =
            unsafe { ((*self.file).read)(self.file, &mut size, buffer.as_mut_ptr().cast()) };
        if status::is_success(result) {
            *read = size;
        }
        result
    }
}

impl Drop for UefiFile {
    fn drop(&mut self) {
        unsafe {
            let _ = ((*self.file).close)(self.file);
        }
    }
}

impl FileSystem for UefiFirmware {
    fn open(&self, path: &str) -> Result<Box<dyn FileAccess>, Status> {
        let bs = self.boot_services();
        unsafe {
            // The boot volume is the one this loader was started from.
            let mut loaded: *mut c_void = ptr::null_mut();
            let result = (bs.handle_protocol)(
                self.image_handle,
                &LOADED_IMAGE_PROTOCOL_GUID,
                &mut loaded,
            );
            if !status::is_success(result) {
                return Err(result);
            }
            let device_handle = (*(loaded as *const LoadedImageProtocol)).device_handle;

            let mut filesystem: *mut c_void = ptr::null_mut();
            let result = (bs.handle_protocol)(
                device_handle,
                &SIMPLE_FILE_SYSTEM_PROTOCOL_GUID,
                &mut filesystem,
            );
            if !status::is_success(result) {
                return Err(result);
            }
            let filesystem = filesystem as *mut SimpleFileSystem;

            let mut root: *mut FileProtocol = ptr::null_mut();
            let result = ((*filesystem).open_volume)(filesystem, &mut root);
            if !status::is_success(result) {
                return Err(result);
            }

            let wide = to_utf16(path);
            let mut file: *mut FileProtocol = ptr::null_mut();
            let result = ((*root).open)(root, &mut file, wide.as_ptr(), FILE_MODE_READ, 0);
            let _ = ((*root).close)(root);
            if !status::is_success(result) {
                return Err(result);
            }
            Ok(Box::new(UefiFile { file }))
        }
    }
}

impl ImageServices for UefiFirmware {
    fn load_image(&self, buffer: &[u8], file_path: &str) -> Result<Handle, Status> {
        log_debug!("loading image {file_path} ({} bytes)", buffer.len());
        let device_path = memory_device_path(buffer);
        let mut handle: Handle = ptr::null_mut();
        let result = unsafe {
            (self.boot_services().load_image)(
                0,
                self.image_handle,
                device_path.as_ptr().cast(),
                buffer.as_ptr().cast(),
                buffer.len(),
                &mut handle,
            )
        };
        if !status::is_success(result) {
            return Err(result);
        }
        Ok(handle)
    }

    fn start_image(&self, handle: Handle) -> Result<(), Status> {
        let mut exit_data_size = 0usize;
        let mut exit_data: *mut u16 = ptr::null_mut();
        let result = unsafe {
            (self.boot_services().start_image)(handle, &mut exit_data_size, &mut exit_data)
        };
        if !status::is_success(result) {
            return Err(result);
        }
        Ok(())
    }

    fn loaded_image_info(&self, handle: Handle) -> Result<LoadedImageInfo, Status> {
        let mut interface: *mut c_void = ptr::null_mut();
        let result = unsafe {
            (self.boot_services().handle_protocol)(
                handle,
                &LOADED_IMAGE_PROTOCOL_GUID,
                &mut interface,
            )
        };
        if !status::is_success(result) {
            return Err(result);
        }
        let loaded = unsafe { &*(interface as *const LoadedImageProtocol) };
        Ok(LoadedImageInfo {
            image_base: loaded.image_base as PhysicalAddress,
            image_size: loaded.image_size,
            revision: loaded.revision,
            code_type: loaded.image_code_type as usize,
            unload: loaded.unload,
        })
    }

    fn unload_image(&self, handle: Handle) {
        unsafe {
            let _ = (self.boot_services().unload_image)(handle);
        }
    }

    fn secure_boot_active(&self) -> bool {
        let name = to_utf16("SecureBoot");
        let mut value = 0u8;
        let mut size = 1usize;
        let result = unsafe {
            ((*self.runtime_services).get_variable)(
                name.as_ptr(),
                &GLOBAL_VARIABLE_GUID,
                ptr::null_mut(),
                &mut size,
                (&mut value as *mut u8).cast(),
            )
        };
        status::is_success(result) && value == 1
    }
}

impl ProtocolOps for UefiFirmware {
    fn open_protocol(&self, guid: &Guid) -> Result<*mut c_void, Status> {
        let mut interface: *mut c_void = ptr::null_mut();
        let result = unsafe {
            (self.boot_services().locate_protocol)(guid, ptr::null_mut(), &mut interface)
        };
        if !status::is_success(result) {
            return Err(result);
        }
        Ok(interface)
    }
}

impl VariableOps for UefiFirmware {
    fn set_variable(&self, name: &str, value: &[u8]) -> Status {
        let wide = to_utf16(name);
        let attributes =
            VARIABLE_NON_VOLATILE | VARIABLE_BOOTSERVICE_ACCESS | VARIABLE_RUNTIME_ACCESS;
        unsafe {
            ((*self.runtime_services).set_variable)(
                wide.as_ptr(),
                &XTLDR_VENDOR_GUID,
                attributes,
                value.len(),
                value.as_ptr().cast(),
            )
        }
    }
}

/// Encode a string as NUL-terminated UTF-16LE for firmware calls.
pub fn to_utf16(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(core::iter::once(0)).collect()
}

/// Build a memory-mapped device path describing an in-memory image source,
/// terminated by an end-of-path node.
pub fn memory_device_path(buffer: &[u8]) -> Vec<u8> {
    let start = buffer.as_ptr() as u64;
    let end = start + buffer.len() as u64;

    let mut path = Vec::with_capacity(28);
    // Hardware path, memory-mapped subtype, 24 byte node.
    path.push(0x01);
    path.push(0x03);
    path.extend_from_slice(&24u16.to_le_bytes());
    path.extend_from_slice(&(xtldr_core::efi::memory_type::LOADER_CODE as u32).to_le_bytes());
    path.extend_from_slice(&start.to_le_bytes());
    path.extend_from_slice(&end.to_le_bytes());
    // End-of-path node.
    path.push(0x7F);
    path.push(0xFF);
    path.extend_from_slice(&4u16.to_le_bytes());
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_utf16_terminates() {
        let wide = to_utf16("AB");
        assert_eq!(wide, [0x41, 0x42, 0]);
    }

    #[test]
    fn test_memory_device_path_shape() {
        let buffer = [0u8; 32];
        let path = memory_device_path(&buffer);
        assert_eq!(path.len(), 28);
        assert_eq!(&path[..2], &[0x01, 0x03]);
        // End node trailer.
        assert_eq!(&path[24..], &[0x7F, 0xFF, 0x04, 0x00]);

        let start = u64::from_le_bytes(path[8..16].try_into().unwrap());
        let end = u64::from_le_bytes(path[16..24].try_into().unwrap());
        assert_eq!(end - start, 32);
    }
}
