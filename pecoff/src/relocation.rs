//! Base-relocation engine.
//!
//! Fixups are computed against the linker-declared image base, not against
//! wherever the image happens to sit, so an image can be rebased any number
//! of times and always end up with the values a direct load at the final
//! address would have produced.

use core::mem;
use core::ptr;

use xtldr_core::log_debug;

use crate::error::{ImageError, Result};
use crate::headers::{characteristics, reloc_type, BaseRelocation, HeaderView};
use crate::loader::PeCoffImage;

/// Apply base-relocation fixups for the image's current virtual address.
///
/// Assumes every pointer-sized field still holds `declared_base`-relative
/// values, which `relocate_image` arranges before calling this. Entries
/// whose target falls outside the image or inside the relocation table
/// itself are skipped.
pub fn relocate_loaded_image(image: &mut PeCoffImage) -> Result<()> {
    let (flags, directory, image_base) = {
        let view = HeaderView::parse(image.bytes())?;
        (
            view.characteristics(),
            view.relocation_directory(),
            view.image_base(),
        )
    };

    if flags & characteristics::RELOCS_STRIPPED != 0 {
        log_debug!("relocations stripped, image runs in place");
        return Ok(());
    }
    let Some(directory) = directory else {
        return Ok(());
    };
    let dir_start = { directory.virtual_address } as usize;
    let dir_size = { directory.size } as usize;
    if dir_start == 0 || dir_size == 0 {
        return Ok(());
    }

    let address = image.virtual_address();
    let image_ptr = image.image_ptr();
    let image_size = image.image_size();
    let dir_end = dir_start.saturating_add(dir_size).min(image_size);

    let mut block_offset = dir_start;
    while block_offset + mem::size_of::<BaseRelocation>() <= dir_end {
        let block: BaseRelocation =
            unsafe { ptr::read_unaligned(image_ptr.add(block_offset).cast()) };
        let block_size = { block.size_of_block } as usize;
        // A zero-size block terminates a padded directory.
        if block_size == 0 {
            break;
        }
        if block_size < mem::size_of::<BaseRelocation>() {
            return Err(ImageError::TooShort);
        }
        let block_end = block_offset + block_size;
        if block_end > dir_end {
            return Err(ImageError::TooShort);
        }

        let entry_count = (block_size - mem::size_of::<BaseRelocation>()) / 2;
        let entries_offset = block_offset + mem::size_of::<BaseRelocation>();
        for index in 0..entry_count {
            let entry: u16 =
                unsafe { ptr::read_unaligned(image_ptr.add(entries_offset + 2 * index).cast()) };
            let kind = entry >> 12;
            let target = { block.virtual_address } as usize + (entry & 0x0FFF) as usize;

            // Never patch the relocation table out from under this walk.
            if target >= image_size || (target >= dir_start && target < dir_end) {
                continue;
            }

            match kind {
                reloc_type::ABSOLUTE => {}
                reloc_type::HIGHLOW => {
                    if target + 4 > image_size {
                        continue;
                    }
                    unsafe {
                        let field = image_ptr.add(target).cast::<u32>();
                        let value = ptr::read_unaligned(field);
                        ptr::write_unaligned(
                            field,
                            value
                                .wrapping_sub(image_base as u32)
                                .wrapping_add(address as u32),
                        );
                    }
                }
                reloc_type::DIR64 => {
                    if target + 8 > image_size {
                        continue;
                    }
                    unsafe {
                        let field = image_ptr.add(target).cast::<u64>();
                        let value = ptr::read_unaligned(field);
                        ptr::write_unaligned(
                            field,
                            value.wrapping_sub(image_base).wrapping_add(address),
                        );
                    }
                }
                other => return Err(ImageError::UnsupportedReloc(other)),
            }
        }
        block_offset = block_end;
    }

    Ok(())
}

/// Rebase the image to run at `address`.
///
/// Stages the virtual address at `address - current + declared_base` so the
/// fixup pass rewrites every field relative to the declared base, making the
/// result independent of where the image was relocated to before.
pub fn relocate_image(image: &mut PeCoffImage, address: u64) -> Result<()> {
    let image_base = HeaderView::parse(image.bytes())?.image_base();
    let staged = address
        .wrapping_sub(image.virtual_address())
        .wrapping_add(image_base);
    image.set_virtual_address(staged);
    relocate_loaded_image(image)?;
    image.set_virtual_address(address);
    log_debug!("image rebased to {address:#x}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{load_image, unload_image};
    use crate::testimg::{reloc_entry, ImageSpec, RelocBlock, SectionSpec};
    use alloc::vec;
    use alloc::vec::Vec;
    use xtldr_core::efi::MemoryClass;
    use xtldr_core::firmware::FileSystem;
    use xtldr_core::mock::MockFirmware;

    const DECLARED_BASE: u64 = 0x1000;
    const FIELD_RVA: usize = 0x1010;
    const ORIGINAL_VALUE: u64 = 0x1008;

    // One DIR64-relocatable u64 at RVA 0x1010, pointing into the image as
    // laid out at the declared base.
    fn relocatable_spec() -> ImageSpec {
        let mut data = vec![0u8; 24];
        data[0x10..0x18].copy_from_slice(&ORIGINAL_VALUE.to_le_bytes());
        let mut spec = ImageSpec::new64();
        spec.image_base = DECLARED_BASE;
        spec.sections = vec![SectionSpec {
            name: ".text",
            virtual_address: 0x1000,
            virtual_size: 0x1000,
            data,
        }];
        spec.relocs = vec![RelocBlock {
            page_rva: 0x1000,
            entries: vec![reloc_entry(reloc_type::DIR64, 0x10)],
        }];
        spec
    }

    fn load(fw: &MockFirmware, file: Vec<u8>) -> crate::Result<crate::PeCoffImage> {
        fw.add_file("\\IMG.EXE", file);
        let mut file = fw.open("\\IMG.EXE").unwrap();
        load_image(fw, file.as_mut(), MemoryClass::Code, None)
    }

    fn read_u64(image: &crate::PeCoffImage, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&image.bytes()[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    fn read_u32(image: &crate::PeCoffImage, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&image.bytes()[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    #[test]
    fn test_dir64_fixup_on_load() {
        let fw = MockFirmware::new();
        let image = load(&fw, relocatable_spec().build()).unwrap();
        let expected = ORIGINAL_VALUE - DECLARED_BASE + image.virtual_address();
        assert_eq!(read_u64(&image, FIELD_RVA), expected);
        unload_image(&fw, image);
    }

    #[test]
    fn test_rebase_to_explicit_address() {
        let fw = MockFirmware::new();
        let mut image = load(&fw, relocatable_spec().build()).unwrap();
        relocate_image(&mut image, 0x0200_0000).unwrap();
        assert_eq!(image.virtual_address(), 0x0200_0000);
        // 0x1008 under a declared base of 0x1000 becomes 0x2000008 at
        // load address 0x2000000.
        assert_eq!(read_u64(&image, FIELD_RVA), 0x0200_0008);
        unload_image(&fw, image);
    }

    #[test]
    fn test_rebasing_is_path_independent() {
        let fw = MockFirmware::new();
        let mut image = load(&fw, relocatable_spec().build()).unwrap();
        // Rebase through an intermediate address first.
        relocate_image(&mut image, 0x0900_0000).unwrap();
        relocate_image(&mut image, 0x0200_0000).unwrap();
        assert_eq!(
            read_u64(&image, FIELD_RVA),
            ORIGINAL_VALUE - DECLARED_BASE + 0x0200_0000
        );
        unload_image(&fw, image);
    }

    #[test]
    fn test_highlow_fixup() {
        let fw = MockFirmware::new();
        let mut data = vec![0u8; 8];
        data[0..4].copy_from_slice(&0x1234u32.to_le_bytes());
        let mut spec = ImageSpec::new32();
        spec.sections = vec![SectionSpec {
            name: ".text",
            virtual_address: 0x1000,
            virtual_size: 0x1000,
            data,
        }];
        spec.relocs = vec![RelocBlock {
            page_rva: 0x1000,
            entries: vec![reloc_entry(reloc_type::HIGHLOW, 0)],
        }];

        let mut image = load(&fw, spec.build()).unwrap();
        relocate_image(&mut image, 0x4000_0000).unwrap();
        assert_eq!(read_u32(&image, 0x1000), 0x1234 - 0x1000 + 0x4000_0000);
        unload_image(&fw, image);
    }

    #[test]
    fn test_stripped_relocations_left_alone() {
        let fw = MockFirmware::new();
        let mut spec = relocatable_spec();
        spec.characteristics |= characteristics::RELOCS_STRIPPED;
        let image = load(&fw, spec.build()).unwrap();
        assert_eq!(read_u64(&image, FIELD_RVA), ORIGINAL_VALUE);
        unload_image(&fw, image);
    }

    #[test]
    fn test_zero_size_block_ends_walk() {
        let fw = MockFirmware::new();
        let mut spec = relocatable_spec();
        // Directory size covers zero padding after the last block, the way
        // aligned linker output ends the table.
        spec.reloc_dir_pad = 8;
        let image = load(&fw, spec.build()).unwrap();
        let expected = ORIGINAL_VALUE - DECLARED_BASE + image.virtual_address();
        assert_eq!(read_u64(&image, FIELD_RVA), expected);
        unload_image(&fw, image);
        assert_eq!(fw.outstanding_pages(), 0);
    }

    #[test]
    fn test_unsupported_type_rejected() {
        let fw = MockFirmware::new();
        let mut spec = relocatable_spec();
        spec.relocs = vec![RelocBlock {
            page_rva: 0x1000,
            entries: vec![reloc_entry(5, 8)],
        }];
        assert_eq!(
            load(&fw, spec.build()).unwrap_err(),
            ImageError::UnsupportedReloc(5)
        );
        assert_eq!(fw.outstanding_pages(), 0);
    }

    #[test]
    fn test_relocation_table_never_patched() {
        let fw = MockFirmware::new();
        let mut spec = relocatable_spec();
        // Second block points a fixup at the table itself (RVA 0x2000).
        spec.relocs.push(RelocBlock {
            page_rva: 0x2000,
            entries: vec![reloc_entry(reloc_type::DIR64, 0)],
        });
        let image = load(&fw, spec.build()).unwrap();
        // The first block header still reads back intact.
        assert_eq!(read_u32(&image, 0x2000), 0x1000);
        unload_image(&fw, image);
    }

    #[test]
    fn test_fixup_beyond_image_skipped() {
        let fw = MockFirmware::new();
        let mut spec = relocatable_spec();
        // Target fits the image but an eight-byte write would not.
        spec.relocs.push(RelocBlock {
            page_rva: 0x2000,
            entries: vec![reloc_entry(reloc_type::DIR64, 0xFFF)],
        });
        let image = load(&fw, spec.build()).unwrap();
        unload_image(&fw, image);
        assert_eq!(fw.outstanding_pages(), 0);
    }
}
