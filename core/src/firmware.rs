//! Firmware capability traits.
//!
//! The original loader talks to firmware through function-pointer tables.
//! Here each concern gets its own trait: the real implementation in
//! `xtldr-bootloader` forwards to the UEFI tables, and the `mock` module
//! provides an in-memory implementation for tests. Signatures stay close to
//! the underlying EFI calls (raw `Status` returns, out-parameters) so the
//! binding layer is a thin forwarder.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::ffi::c_void;
use core::mem;
use core::ptr;

use crate::efi::{status, FileInfo, Guid, Handle, MemoryClass, PhysicalAddress, Status};

/// Page allocation services.
pub trait MemoryOps {
    /// Allocate `pages` page-aligned pages of the given class.
    fn allocate_pages(&self, pages: usize, class: MemoryClass) -> Result<PhysicalAddress, Status>;

    /// Free pages previously returned by `allocate_pages`.
    fn free_pages(&self, address: PhysicalAddress, pages: usize);
}

/// An open file on a boot volume.
pub trait FileAccess {
    /// EFI GetInfo wrapper: fill `buffer` with an `EFI_FILE_INFO` record.
    ///
    /// On `BUFFER_TOO_SMALL` the required size is written to `needed`.
    fn file_info(&mut self, buffer: &mut [u8], needed: &mut usize) -> Status;

    /// EFI Read wrapper: read up to `buffer.len()` bytes from the current
    /// position, advancing it. The number of bytes read is written to `read`
    /// (zero at end of file).
    fn read(&mut self, buffer: &mut [u8], read: &mut usize) -> Status;
}

/// Volume traversal: open a file by full path.
pub trait FileSystem {
    fn open(&self, path: &str) -> Result<Box<dyn FileAccess>, Status>;
}

/// Data reported by the firmware's loaded-image interface.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImageInfo {
    /// Base address the firmware placed the image at.
    pub image_base: PhysicalAddress,
    /// Size of the loaded image in bytes.
    pub image_size: u64,
    /// Loaded-image protocol revision.
    pub revision: u32,
    /// EFI memory type of the image code region.
    pub code_type: usize,
    /// Unload callback installed by the image, if any.
    pub unload: Option<extern "efiapi" fn(Handle) -> Status>,
}

/// Firmware image services: load and start EFI images from memory buffers.
pub trait ImageServices {
    /// LoadImage with an in-memory source buffer and a synthetic device
    /// path derived from `file_path`.
    fn load_image(&self, buffer: &[u8], file_path: &str) -> Result<Handle, Status>;

    /// StartImage on a previously loaded handle.
    fn start_image(&self, handle: Handle) -> Result<(), Status>;

    /// Query the loaded-image interface of a handle.
    fn loaded_image_info(&self, handle: Handle) -> Result<LoadedImageInfo, Status>;

    /// UnloadImage on a handle that was never started.
    fn unload_image(&self, handle: Handle);

    /// Whether the platform reports secure boot as enabled.
    fn secure_boot_active(&self) -> bool;
}

/// Protocol database access.
pub trait ProtocolOps {
    /// Locate and open a protocol interface by GUID.
    fn open_protocol(&self, guid: &Guid) -> Result<*mut c_void, Status>;
}

/// Non-volatile variable store.
pub trait VariableOps {
    /// Set a vendor variable. Best-effort; callers may ignore failures.
    fn set_variable(&self, name: &str, value: &[u8]) -> Status;
}

/// Umbrella trait over every firmware capability the loader needs.
pub trait Firmware:
    MemoryOps + FileSystem + ImageServices + ProtocolOps + VariableOps
{
}

impl<T> Firmware for T where
    T: MemoryOps + FileSystem + ImageServices + ProtocolOps + VariableOps
{
}

/// Query a file's on-disk size via the firmware file-info call.
///
/// First attempt uses a stack buffer sized for the fixed `EFI_FILE_INFO`
/// header; if the firmware reports `BUFFER_TOO_SMALL` (the record carries
/// the file name), retry once with the size it asked for.
pub fn file_size(file: &mut dyn FileAccess) -> Result<u64, Status> {
    let mut buffer = [0u8; mem::size_of::<FileInfo>()];
    let mut needed = 0usize;

    let result = file.file_info(&mut buffer, &mut needed);
    if status::is_success(result) {
        let info = unsafe { ptr::read_unaligned(buffer.as_ptr().cast::<FileInfo>()) };
        return Ok(info.file_size);
    }
    if result != status::BUFFER_TOO_SMALL {
        return Err(result);
    }

    let mut buffer = vec![0u8; needed];
    let result = file.file_info(&mut buffer, &mut needed);
    if !status::is_success(result) {
        return Err(result);
    }
    let info = unsafe { ptr::read_unaligned(buffer.as_ptr().cast::<FileInfo>()) };
    Ok(info.file_size)
}

/// Read a whole file into a heap buffer.
pub fn read_file(file: &mut dyn FileAccess) -> Result<Vec<u8>, Status> {
    let size = file_size(file)? as usize;
    let mut data = vec![0u8; size];
    let mut total = 0usize;

    while total < size {
        let mut chunk = 0usize;
        let result = file.read(&mut data[total..], &mut chunk);
        if !status::is_success(result) {
            return Err(result);
        }
        if chunk == 0 {
            return Err(status::END_OF_FILE);
        }
        total += chunk;
    }

    Ok(data)
}
