//! EFI primitive types and status codes.
//!
//! Standalone definitions compatible with the UEFI specification, kept
//! independent of the raw firmware tables so that the loader crates can be
//! built and tested without a firmware environment.

use core::ffi::c_void;

pub use uguid::{guid, Guid};

/// UEFI status code.
pub type Status = usize;

/// UEFI handle (opaque pointer).
pub type Handle = *mut c_void;

/// Physical memory address.
pub type PhysicalAddress = u64;

/// UEFI page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages needed to hold `size` bytes.
#[inline]
pub const fn size_to_pages(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Status code constants.
pub mod status {
    use super::Status;

    const ERROR_BIT: Status = 1 << (usize::BITS - 1);

    /// Operation completed successfully.
    pub const SUCCESS: Status = 0;

    /// The image failed to load.
    pub const LOAD_ERROR: Status = ERROR_BIT | 1;

    /// Invalid parameter was passed.
    pub const INVALID_PARAMETER: Status = ERROR_BIT | 2;

    /// The operation is not supported.
    pub const UNSUPPORTED: Status = ERROR_BIT | 3;

    /// The buffer is too small for the requested data.
    pub const BUFFER_TOO_SMALL: Status = ERROR_BIT | 5;

    /// Out of resources.
    pub const OUT_OF_RESOURCES: Status = ERROR_BIT | 9;

    /// The item was not found.
    pub const NOT_FOUND: Status = ERROR_BIT | 14;

    /// Access was denied (e.g. secure boot signature rejection).
    pub const ACCESS_DENIED: Status = ERROR_BIT | 15;

    /// End of file reached.
    pub const END_OF_FILE: Status = ERROR_BIT | 31;

    /// Check if status indicates success.
    #[inline]
    pub const fn is_success(status: Status) -> bool {
        status == SUCCESS
    }

    /// Check if status indicates an error.
    #[inline]
    pub const fn is_error(status: Status) -> bool {
        (status & ERROR_BIT) != 0
    }
}

/// EFI memory type constants (subset used by the loader).
pub mod memory_type {
    /// EfiLoaderCode
    pub const LOADER_CODE: usize = 1;
    /// EfiLoaderData
    pub const LOADER_DATA: usize = 2;
    /// EfiBootServicesCode
    pub const BOOT_SERVICES_CODE: usize = 3;
    /// EfiBootServicesData
    pub const BOOT_SERVICES_DATA: usize = 4;
}

/// Memory classification for a loaded image.
///
/// Selects the EFI memory type the image (or its backing buffers) is
/// allocated from. `Code` is used for images that will be executed, `Data`
/// for file buffers, `System` for boot-services-owned scratch memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryClass {
    Code,
    Data,
    System,
}

impl MemoryClass {
    /// The EFI memory type backing this class.
    pub const fn efi_memory_type(self) -> usize {
        match self {
            MemoryClass::Code => memory_type::LOADER_CODE,
            MemoryClass::Data => memory_type::LOADER_DATA,
            MemoryClass::System => memory_type::BOOT_SERVICES_DATA,
        }
    }
}

/// EFI_FILE_INFO record header.
///
/// The variable-length file name (UTF-16, NUL-terminated) follows directly
/// after this structure; callers query with a buffer and retry when the
/// firmware reports `BUFFER_TOO_SMALL`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    /// Size of the whole record including the file name.
    pub size: u64,
    /// File size in bytes.
    pub file_size: u64,
    /// Physical space consumed on the volume.
    pub physical_size: u64,
    /// EFI_TIME of creation.
    pub create_time: [u8; 16],
    /// EFI_TIME of last access.
    pub last_access_time: [u8; 16],
    /// EFI_TIME of last modification.
    pub modification_time: [u8; 16],
    /// Attribute bits.
    pub attribute: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_to_pages() {
        assert_eq!(size_to_pages(0), 0);
        assert_eq!(size_to_pages(1), 1);
        assert_eq!(size_to_pages(PAGE_SIZE), 1);
        assert_eq!(size_to_pages(PAGE_SIZE + 1), 2);
        assert_eq!(size_to_pages(10 * PAGE_SIZE), 10);
    }

    #[test]
    fn test_status_checks() {
        assert!(status::is_success(status::SUCCESS));
        assert!(!status::is_error(status::SUCCESS));
        assert!(status::is_error(status::ACCESS_DENIED));
        assert!(status::is_error(status::BUFFER_TOO_SMALL));
    }

    #[test]
    fn test_memory_class_mapping() {
        assert_eq!(
            MemoryClass::Code.efi_memory_type(),
            memory_type::LOADER_CODE
        );
        assert_eq!(
            MemoryClass::Data.efi_memory_type(),
            memory_type::LOADER_DATA
        );
        assert_eq!(
            MemoryClass::System.efi_memory_type(),
            memory_type::BOOT_SERVICES_DATA
        );
    }

    #[test]
    fn test_file_info_layout() {
        // Header is 80 bytes; the file name follows it.
        assert_eq!(core::mem::size_of::<FileInfo>(), 80);
    }
}
