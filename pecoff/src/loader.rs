//! PE/COFF image loading.
//!
//! Reads the whole file into a data buffer, maps headers and sections into a
//! fresh page allocation according to the virtual layout and applies base
//! relocations for the address the image ended up at. The raw file buffer
//! only lives until the sections have been copied out of it.

use core::cmp;
use core::ptr;
use core::slice;

use xtldr_core::efi::{size_to_pages, MemoryClass, PhysicalAddress, PAGE_SIZE};
use xtldr_core::firmware::{self, FileAccess, MemoryOps};
use xtldr_core::log_debug;

use crate::error::{ImageError, Result};
use crate::headers::{characteristics, HeaderView};
use crate::relocation::relocate_loaded_image;

/// Firmware pages freed on drop unless handed over with `release`.
struct PageGuard<'a, F: MemoryOps + ?Sized> {
    firmware: &'a F,
    address: PhysicalAddress,
    pages: usize,
}

impl<'a, F: MemoryOps + ?Sized> PageGuard<'a, F> {
    fn allocate(firmware: &'a F, pages: usize, class: MemoryClass) -> Result<Self> {
        let address = firmware
            .allocate_pages(pages, class)
            .map_err(ImageError::Firmware)?;
        Ok(PageGuard {
            firmware,
            address,
            pages,
        })
    }

    fn address(&self) -> PhysicalAddress {
        self.address
    }

    fn release(self) -> PhysicalAddress {
        let address = self.address;
        core::mem::forget(self);
        address
    }
}

impl<F: MemoryOps + ?Sized> Drop for PageGuard<'_, F> {
    fn drop(&mut self) {
        self.firmware.free_pages(self.address, self.pages);
    }
}

/// A PE/COFF image mapped into firmware-allocated pages.
///
/// The raw file buffer never outlives `load_image`; only the image pages
/// are owned here.
#[derive(Debug)]
pub struct PeCoffImage {
    image: PhysicalAddress,
    image_pages: usize,
    file_size: u64,
    image_size: usize,
    physical_address: PhysicalAddress,
    virtual_address: u64,
    memory_class: MemoryClass,
}

impl PeCoffImage {
    /// Address of the mapped image in physical memory.
    pub fn physical_address(&self) -> PhysicalAddress {
        self.physical_address
    }

    /// Address the image is currently relocated to run at.
    pub fn virtual_address(&self) -> u64 {
        self.virtual_address
    }

    pub(crate) fn set_virtual_address(&mut self, address: u64) {
        self.virtual_address = address;
    }

    /// In-memory size of the mapped image in bytes.
    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Pages backing the mapped image.
    pub fn image_pages(&self) -> usize {
        self.image_pages
    }

    /// On-disk size of the source file.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Memory class the image pages were allocated from.
    pub fn memory_class(&self) -> MemoryClass {
        self.memory_class
    }

    /// The mapped image bytes.
    pub fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.image as *const u8, self.image_size) }
    }

    pub(crate) fn image_ptr(&self) -> *mut u8 {
        self.image as *mut u8
    }

    /// Entry point address under the current virtual address.
    pub fn entry_point(&self) -> Result<u64> {
        let view = HeaderView::parse(self.bytes())?;
        Ok(self.virtual_address + view.entry_point_rva() as u64)
    }
}

/// Re-run the signature and bounds validation on a mapped image.
pub fn verify_image(image: &PeCoffImage) -> Result<()> {
    HeaderView::parse(image.bytes()).map(|_| ())
}

/// Load a PE/COFF image from an open file.
///
/// Allocates a data buffer for the file contents and an image buffer sized
/// by the headers, maps every section (zero-filling memory the file does not
/// cover) and applies base relocations. With `virtual_address` of `None` the
/// image is relocated to run in place at its physical address.
pub fn load_image<F: MemoryOps + ?Sized>(
    firmware: &F,
    file: &mut dyn FileAccess,
    memory_class: MemoryClass,
    virtual_address: Option<u64>,
) -> Result<PeCoffImage> {
    let file_size = firmware::file_size(file).map_err(ImageError::Firmware)?;
    let file_len = file_size as usize;
    if file_len == 0 {
        return Err(ImageError::TooShort);
    }

    let data_pages = size_to_pages(file_len);
    let raw_guard = PageGuard::allocate(firmware, data_pages, MemoryClass::Data)?;
    let raw_slice = unsafe { slice::from_raw_parts_mut(raw_guard.address() as *mut u8, file_len) };

    let mut total = 0usize;
    while total < file_len {
        let mut chunk = 0usize;
        let result = file.read(&mut raw_slice[total..], &mut chunk);
        if !xtldr_core::efi::status::is_success(result) {
            return Err(ImageError::Firmware(result));
        }
        if chunk == 0 {
            return Err(ImageError::TooShort);
        }
        total += chunk;
    }

    let view = HeaderView::parse(raw_slice)?;
    if view.characteristics() & characteristics::EXECUTABLE_IMAGE == 0 {
        return Err(ImageError::NotExecutable);
    }

    let image_size = view.size_of_image();
    if image_size == 0 {
        return Err(ImageError::TooShort);
    }
    let image_pages = size_to_pages(image_size);
    let image_guard = PageGuard::allocate(firmware, image_pages, memory_class)?;
    let image_ptr = image_guard.address() as *mut u8;

    // Firmware does not hand out zeroed pages.
    unsafe { ptr::write_bytes(image_ptr, 0, image_pages * PAGE_SIZE) };

    let header_len = cmp::min(view.size_of_headers(), cmp::min(file_len, image_size));
    unsafe { ptr::copy_nonoverlapping(raw_slice.as_ptr(), image_ptr, header_len) };

    for section in view.sections()? {
        let virtual_offset = { section.virtual_address } as usize;
        let virtual_size = { section.virtual_size } as usize;
        let raw_offset = { section.pointer_to_raw_data } as usize;
        let raw_size = { section.size_of_raw_data } as usize;

        // On-disk data beyond the virtual size is alignment padding.
        let copy_len = cmp::min(raw_size, virtual_size);
        let virtual_ok = virtual_offset
            .checked_add(virtual_size)
            .is_some_and(|end| end <= image_size);
        let raw_ok = raw_offset
            .checked_add(copy_len)
            .is_some_and(|end| end <= file_len);
        if !virtual_ok || !raw_ok {
            return Err(ImageError::TooShort);
        }

        unsafe {
            ptr::copy_nonoverlapping(
                raw_slice.as_ptr().add(raw_offset),
                image_ptr.add(virtual_offset),
                copy_len,
            );
        }
    }

    // Sections are copied out; the raw buffer has served its purpose.
    drop(raw_guard);

    let physical = image_guard.release();
    let mut image = PeCoffImage {
        image: physical,
        image_pages,
        file_size,
        image_size,
        physical_address: physical,
        virtual_address: virtual_address.unwrap_or(physical),
        memory_class,
    };

    if let Err(error) = relocate_loaded_image(&mut image) {
        unload_image(firmware, image);
        return Err(error);
    }

    log_debug!(
        "image loaded at {:#x} ({} pages, virtual {:#x})",
        image.physical_address,
        image.image_pages,
        image.virtual_address
    );
    Ok(image)
}

/// Free the pages backing an image.
pub fn unload_image<F: MemoryOps + ?Sized>(firmware: &F, image: PeCoffImage) {
    firmware.free_pages(image.image, image.image_pages);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::XT_SIGNATURE;
    use crate::testimg::{ImageSpec, SectionSpec};
    use alloc::vec;
    use xtldr_core::firmware::FileSystem;
    use xtldr_core::mock::MockFirmware;

    fn load(fw: &MockFirmware, path: &str) -> Result<PeCoffImage> {
        let mut file = fw.open(path).unwrap();
        load_image(fw, file.as_mut(), MemoryClass::Code, None)
    }

    #[test]
    fn test_load_maps_sections_and_zero_fills() {
        let fw = MockFirmware::new();
        let mut spec = ImageSpec::new64();
        spec.sections = vec![SectionSpec {
            name: ".text",
            virtual_address: 0x1000,
            virtual_size: 0x1000,
            data: vec![1, 2, 3, 4],
        }];
        fw.add_file("\\TEST.EXE", spec.build());

        let image = load(&fw, "\\TEST.EXE").unwrap();
        assert_eq!(image.image_size(), 0x2000);
        assert_eq!(image.image_pages(), 2);
        assert_eq!(image.virtual_address(), image.physical_address());

        let bytes = image.bytes();
        assert_eq!(&bytes[0x1000..0x1004], &[1, 2, 3, 4]);
        // The rest of the section has no file data behind it.
        assert!(bytes[0x1004..0x2000].iter().all(|&b| b == 0));

        assert_eq!(
            image.entry_point().unwrap(),
            image.virtual_address() + 0x1000
        );
        unload_image(&fw, image);
        assert_eq!(fw.outstanding_pages(), 0);
    }

    #[test]
    fn test_pages_cover_image_size() {
        let fw = MockFirmware::new();
        fw.add_file("\\TEST.EXE", ImageSpec::new64().build());
        let image = load(&fw, "\\TEST.EXE").unwrap();
        assert_eq!(
            image.image_pages(),
            xtldr_core::efi::size_to_pages(image.image_size())
        );
        // The raw file buffer is gone; only the image pages remain.
        assert_eq!(fw.outstanding_pages(), image.image_pages());
        unload_image(&fw, image);
        assert_eq!(fw.outstanding_pages(), 0);
    }

    #[test]
    fn test_xt_signature_accepted() {
        let fw = MockFirmware::new();
        let mut spec = ImageSpec::new64();
        spec.signature = XT_SIGNATURE;
        fw.add_file("\\XT.EXE", spec.build());
        let image = load(&fw, "\\XT.EXE").unwrap();
        verify_image(&image).unwrap();
        unload_image(&fw, image);
    }

    #[test]
    fn test_rejects_bad_dos_magic() {
        let fw = MockFirmware::new();
        let mut file = ImageSpec::new64().build();
        file[0] = b'Z';
        fw.add_file("\\BAD.EXE", file);
        assert_eq!(load(&fw, "\\BAD.EXE").unwrap_err(), ImageError::BadSignature);
        assert_eq!(fw.outstanding_pages(), 0);
    }

    #[test]
    fn test_rejects_truncated_file() {
        let fw = MockFirmware::new();
        fw.add_file("\\TINY.EXE", vec![b'M', b'Z', 0]);
        assert_eq!(load(&fw, "\\TINY.EXE").unwrap_err(), ImageError::TooShort);
        assert_eq!(fw.outstanding_pages(), 0);
    }

    #[test]
    fn test_rejects_non_executable() {
        let fw = MockFirmware::new();
        let mut spec = ImageSpec::new64();
        spec.characteristics = 0;
        fw.add_file("\\OBJ.EXE", spec.build());
        assert_eq!(load(&fw, "\\OBJ.EXE").unwrap_err(), ImageError::NotExecutable);
        assert_eq!(fw.outstanding_pages(), 0);
    }

    #[test]
    fn test_explicit_virtual_address() {
        let fw = MockFirmware::new();
        fw.add_file("\\TEST.EXE", ImageSpec::new64().build());
        let mut file = fw.open("\\TEST.EXE").unwrap();
        let image = load_image(&fw, file.as_mut(), MemoryClass::Code, Some(0xFFFF_8000_0000_0000))
            .unwrap();
        assert_eq!(image.virtual_address(), 0xFFFF_8000_0000_0000);
        assert_ne!(image.virtual_address(), image.physical_address());
        unload_image(&fw, image);
    }
}
