//! Synthetic PE/COFF files for tests.
//!
//! Builds minimal but structurally valid images: DOS header, PE header,
//! optional header, section table and raw section data, with an optional
//! `.reloc` section generated from relocation block descriptions. Also used
//! by dependent crates through the `test-images` feature.

use alloc::vec;
use alloc::vec::Vec;
use core::mem;

use crate::headers::{
    characteristics, BaseRelocation, DataDirectory, DosHeader, FileHeader, OptionalHeader32,
    OptionalHeader64, PeHeader, SectionHeader, BASE_RELOCATION_DIRECTORY, DOS_MAGIC, PE32PLUS_MAGIC,
    PE32_MAGIC, PE_SIGNATURE,
};

const FILE_ALIGN: usize = 0x200;
const SECTION_ALIGN: usize = 0x1000;

/// One section to place in the image.
pub struct SectionSpec {
    pub name: &'static str,
    pub virtual_address: u32,
    /// In-memory size; raised to the data length when smaller.
    pub virtual_size: u32,
    pub data: Vec<u8>,
}

/// One base-relocation block (page RVA plus raw 16-bit entries).
pub struct RelocBlock {
    pub page_rva: u32,
    pub entries: Vec<u16>,
}

/// Encode a relocation entry from its type and page offset.
pub fn reloc_entry(kind: u16, offset: u16) -> u16 {
    (kind << 12) | (offset & 0x0FFF)
}

/// Description of an image to synthesize.
pub struct ImageSpec {
    pub pe32_plus: bool,
    pub signature: u32,
    pub image_base: u64,
    pub characteristics: u16,
    pub entry_point: u32,
    pub sections: Vec<SectionSpec>,
    pub relocs: Vec<RelocBlock>,
    /// Zero bytes appended after the last relocation block and counted in
    /// the directory size, the way aligned linker output pads the table.
    pub reloc_dir_pad: usize,
}

impl ImageSpec {
    /// A 64-bit executable with one `.text` section at RVA 0x1000.
    pub fn new64() -> Self {
        ImageSpec {
            pe32_plus: true,
            signature: PE_SIGNATURE,
            image_base: 0x1000,
            characteristics: characteristics::EXECUTABLE_IMAGE,
            entry_point: 0x1000,
            sections: vec![SectionSpec {
                name: ".text",
                virtual_address: 0x1000,
                virtual_size: 0x1000,
                data: vec![0x90; 64],
            }],
            relocs: Vec::new(),
            reloc_dir_pad: 0,
        }
    }

    /// The 32-bit counterpart of `new64`.
    pub fn new32() -> Self {
        ImageSpec {
            pe32_plus: false,
            ..Self::new64()
        }
    }

    /// Serialize the description into a PE/COFF file.
    pub fn build(&self) -> Vec<u8> {
        let mut sections: Vec<(SectionHeader, Vec<u8>)> = Vec::new();
        let mut image_end = SECTION_ALIGN;

        for spec in &self.sections {
            let virtual_size = spec.virtual_size.max(spec.data.len() as u32);
            let header = SectionHeader {
                name: pad_name(spec.name),
                virtual_size,
                virtual_address: spec.virtual_address,
                size_of_raw_data: spec.data.len() as u32,
                ..Default::default()
            };
            image_end = image_end.max(spec.virtual_address as usize + virtual_size as usize);
            sections.push((header, spec.data.clone()));
        }

        let mut reloc_dir = DataDirectory::default();
        if !self.relocs.is_empty() {
            let reloc_rva = align_up(image_end, SECTION_ALIGN) as u32;
            let mut bytes = Vec::new();
            for block in &self.relocs {
                let mut entries = block.entries.clone();
                if entries.len() % 2 != 0 {
                    // Pad with an ABSOLUTE entry to keep blocks 4-byte sized.
                    entries.push(0);
                }
                let size_of_block = (mem::size_of::<BaseRelocation>() + 2 * entries.len()) as u32;
                bytes.extend_from_slice(&block.page_rva.to_le_bytes());
                bytes.extend_from_slice(&size_of_block.to_le_bytes());
                for entry in entries {
                    bytes.extend_from_slice(&entry.to_le_bytes());
                }
            }
            bytes.resize(bytes.len() + self.reloc_dir_pad, 0);
            reloc_dir = DataDirectory {
                virtual_address: reloc_rva,
                size: bytes.len() as u32,
            };
            let header = SectionHeader {
                name: pad_name(".reloc"),
                virtual_size: bytes.len() as u32,
                virtual_address: reloc_rva,
                size_of_raw_data: bytes.len() as u32,
                ..Default::default()
            };
            image_end = reloc_rva as usize + bytes.len();
            sections.push((header, bytes));
        }

        let size_of_image = align_up(image_end, SECTION_ALIGN);

        let mut raw_offset = FILE_ALIGN;
        for (header, data) in sections.iter_mut() {
            header.pointer_to_raw_data = raw_offset as u32;
            raw_offset = align_up(raw_offset + data.len().max(1), FILE_ALIGN);
        }
        let mut file = vec![0u8; raw_offset];

        let dos = DosHeader {
            e_magic: DOS_MAGIC,
            e_lfanew: mem::size_of::<DosHeader>() as i32,
            ..Default::default()
        };
        write_struct(&mut file, 0, &dos);

        let opt_size = if self.pe32_plus {
            mem::size_of::<OptionalHeader64>()
        } else {
            mem::size_of::<OptionalHeader32>()
        };
        let pe_offset = mem::size_of::<DosHeader>();
        let pe = PeHeader {
            signature: self.signature,
            file_header: FileHeader {
                machine: if self.pe32_plus { 0x8664 } else { 0x014C },
                number_of_sections: sections.len() as u16,
                size_of_optional_header: opt_size as u16,
                characteristics: self.characteristics,
                ..Default::default()
            },
        };
        write_struct(&mut file, pe_offset, &pe);

        let mut directories = [DataDirectory::default(); 16];
        directories[BASE_RELOCATION_DIRECTORY] = reloc_dir;
        let opt_offset = pe_offset + mem::size_of::<PeHeader>();
        if self.pe32_plus {
            let optional = OptionalHeader64 {
                magic: PE32PLUS_MAGIC,
                address_of_entry_point: self.entry_point,
                image_base: self.image_base,
                section_alignment: SECTION_ALIGN as u32,
                file_alignment: FILE_ALIGN as u32,
                size_of_image: size_of_image as u32,
                size_of_headers: FILE_ALIGN as u32,
                number_of_rva_and_sizes: 16,
                data_directories: directories,
                ..Default::default()
            };
            write_struct(&mut file, opt_offset, &optional);
        } else {
            let optional = OptionalHeader32 {
                magic: PE32_MAGIC,
                address_of_entry_point: self.entry_point,
                image_base: self.image_base as u32,
                section_alignment: SECTION_ALIGN as u32,
                file_alignment: FILE_ALIGN as u32,
                size_of_image: size_of_image as u32,
                size_of_headers: FILE_ALIGN as u32,
                number_of_rva_and_sizes: 16,
                data_directories: directories,
                ..Default::default()
            };
            write_struct(&mut file, opt_offset, &optional);
        }

        let mut table_offset = opt_offset + opt_size;
        for (header, data) in &sections {
            write_struct(&mut file, table_offset, header);
            table_offset += mem::size_of::<SectionHeader>();
            let start = { header.pointer_to_raw_data } as usize;
            file[start..start + data.len()].copy_from_slice(data);
        }

        file
    }
}

/// Encode strings as a concatenation of NUL-terminated UTF-16LE entries,
/// the payload format of a `.modinfo` section.
pub fn utf16_table(entries: &[&str]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for entry in entries {
        for unit in entry.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes.extend_from_slice(&0u16.to_le_bytes());
    }
    bytes
}

fn pad_name(name: &str) -> [u8; 8] {
    let mut padded = [0u8; 8];
    padded[..name.len()].copy_from_slice(name.as_bytes());
    padded
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

// Header structs are packed, so they have no padding bytes to leak.
fn write_struct<T: Copy>(buffer: &mut [u8], offset: usize, value: &T) {
    let bytes = unsafe {
        core::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>())
    };
    buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderView;

    #[test]
    fn test_built_image_parses() {
        let file = ImageSpec::new64().build();
        let view = HeaderView::parse(&file).unwrap();
        assert_eq!(view.magic(), PE32PLUS_MAGIC);
        assert_eq!(view.image_base(), 0x1000);
        assert_eq!(view.sections().unwrap().len(), 1);
        assert_eq!(view.size_of_image(), 0x2000);
    }

    #[test]
    fn test_reloc_section_emitted() {
        let mut spec = ImageSpec::new64();
        spec.relocs = vec![RelocBlock {
            page_rva: 0x1000,
            entries: vec![reloc_entry(10, 8)],
        }];
        let file = spec.build();
        let view = HeaderView::parse(&file).unwrap();
        let directory = view.relocation_directory().unwrap();
        assert_eq!({ directory.virtual_address }, 0x2000);
        // One block header plus two entries (one is padding).
        assert_eq!({ directory.size }, 12);
    }
}
