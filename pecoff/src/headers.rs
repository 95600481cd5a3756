//! PE/COFF on-disk structures.
//!
//! All header structs are `repr(C, packed)` views of the file format; fields
//! are read by value since the file offers no alignment guarantees.

use core::mem;
use core::ptr;
use core::slice;

use crate::error::{ImageError, Result};

/// DOS header magic ("MZ").
pub const DOS_MAGIC: u16 = 0x5A4D;

/// Standard PE signature ("PE\0\0").
pub const PE_SIGNATURE: u32 = 0x0000_4550;

/// XT-native image signature ("XT\0\0"), accepted wherever PE is.
pub const XT_SIGNATURE: u32 = 0x0000_5458;

/// Optional header magic for 32-bit images.
pub const PE32_MAGIC: u16 = 0x010B;

/// Optional header magic for 64-bit images.
pub const PE32PLUS_MAGIC: u16 = 0x020B;

/// Index of the base-relocation entry in the data directory table.
pub const BASE_RELOCATION_DIRECTORY: usize = 5;

/// COFF characteristics bits used by the loader.
pub mod characteristics {
    /// Relocation information was stripped; the image only runs at its
    /// declared base.
    pub const RELOCS_STRIPPED: u16 = 0x0001;
    /// The file is a linked, runnable image.
    pub const EXECUTABLE_IMAGE: u16 = 0x0002;
}

/// Base-relocation entry types.
pub mod reloc_type {
    /// Padding entry, skipped.
    pub const ABSOLUTE: u16 = 0;
    /// Full 32-bit fixup.
    pub const HIGHLOW: u16 = 3;
    /// Full 64-bit fixup.
    pub const DIR64: u16 = 10;
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DosHeader {
    pub e_magic: u16,
    pub e_cblp: u16,
    pub e_cp: u16,
    pub e_crlc: u16,
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    pub e_lfanew: i32,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// PE signature followed by the COFF file header.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PeHeader {
    pub signature: u32,
    pub file_header: FileHeader,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct OptionalHeader32 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directories: [DataDirectory; 16],
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directories: [DataDirectory; 16],
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    /// Section name with trailing NUL padding removed.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        &self.name[..len]
    }
}

/// Header of one base-relocation block; 16-bit entries follow.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct BaseRelocation {
    pub virtual_address: u32,
    pub size_of_block: u32,
}

/// Validated view of a PE/COFF file's headers.
///
/// `parse` performs the signature and bounds checks; the accessors then read
/// scalar fields by value out of the backing buffer.
pub struct HeaderView<'a> {
    data: &'a [u8],
    pe_offset: usize,
    magic: u16,
}

impl<'a> HeaderView<'a> {
    /// Validate DOS, PE and optional-header signatures and structure bounds.
    ///
    /// Accepts both the standard PE signature and the XT-native one, and
    /// both PE32 and PE32+ optional headers.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < mem::size_of::<DosHeader>() {
            return Err(ImageError::TooShort);
        }
        let dos: DosHeader = unsafe { ptr::read_unaligned(data.as_ptr().cast()) };
        if dos.e_magic != DOS_MAGIC {
            return Err(ImageError::BadSignature);
        }

        let pe_offset = usize::try_from(dos.e_lfanew).map_err(|_| ImageError::BadSignature)?;
        let opt_offset = pe_offset
            .checked_add(mem::size_of::<PeHeader>())
            .ok_or(ImageError::TooShort)?;
        if data.len() < opt_offset + 2 {
            return Err(ImageError::TooShort);
        }

        let pe: PeHeader = unsafe { ptr::read_unaligned(data.as_ptr().add(pe_offset).cast()) };
        if pe.signature != PE_SIGNATURE && pe.signature != XT_SIGNATURE {
            return Err(ImageError::BadSignature);
        }

        let magic = u16::from_le_bytes([data[opt_offset], data[opt_offset + 1]]);
        let opt_size = match magic {
            PE32_MAGIC => mem::size_of::<OptionalHeader32>(),
            PE32PLUS_MAGIC => mem::size_of::<OptionalHeader64>(),
            _ => return Err(ImageError::BadSignature),
        };
        if data.len() < opt_offset + opt_size {
            return Err(ImageError::TooShort);
        }

        Ok(HeaderView {
            data,
            pe_offset,
            magic,
        })
    }

    fn opt_offset(&self) -> usize {
        self.pe_offset + mem::size_of::<PeHeader>()
    }

    fn optional32(&self) -> OptionalHeader32 {
        unsafe { ptr::read_unaligned(self.data.as_ptr().add(self.opt_offset()).cast()) }
    }

    fn optional64(&self) -> OptionalHeader64 {
        unsafe { ptr::read_unaligned(self.data.as_ptr().add(self.opt_offset()).cast()) }
    }

    /// Optional header magic (PE32 or PE32+).
    pub fn magic(&self) -> u16 {
        self.magic
    }

    pub fn file_header(&self) -> FileHeader {
        let pe: PeHeader =
            unsafe { ptr::read_unaligned(self.data.as_ptr().add(self.pe_offset).cast()) };
        pe.file_header
    }

    pub fn characteristics(&self) -> u16 {
        self.file_header().characteristics
    }

    /// Linker-declared preferred base address.
    pub fn image_base(&self) -> u64 {
        if self.magic == PE32PLUS_MAGIC {
            self.optional64().image_base
        } else {
            self.optional32().image_base as u64
        }
    }

    /// In-memory size of the mapped image.
    pub fn size_of_image(&self) -> usize {
        if self.magic == PE32PLUS_MAGIC {
            self.optional64().size_of_image as usize
        } else {
            self.optional32().size_of_image as usize
        }
    }

    /// Combined size of all headers in the file layout.
    pub fn size_of_headers(&self) -> usize {
        if self.magic == PE32PLUS_MAGIC {
            self.optional64().size_of_headers as usize
        } else {
            self.optional32().size_of_headers as usize
        }
    }

    /// RVA of the image entry point.
    pub fn entry_point_rva(&self) -> u32 {
        if self.magic == PE32PLUS_MAGIC {
            self.optional64().address_of_entry_point
        } else {
            self.optional32().address_of_entry_point
        }
    }

    /// Base-relocation data directory, if the directory table carries one.
    pub fn relocation_directory(&self) -> Option<DataDirectory> {
        let (count, directories) = if self.magic == PE32PLUS_MAGIC {
            let header = self.optional64();
            (header.number_of_rva_and_sizes, header.data_directories)
        } else {
            let header = self.optional32();
            (header.number_of_rva_and_sizes, header.data_directories)
        };
        if (count as usize) <= BASE_RELOCATION_DIRECTORY {
            return None;
        }
        Some(directories[BASE_RELOCATION_DIRECTORY])
    }

    /// The section table.
    pub fn sections(&self) -> Result<&'a [SectionHeader]> {
        let file_header = self.file_header();
        let offset = self.opt_offset() + file_header.size_of_optional_header as usize;
        let count = file_header.number_of_sections as usize;
        let end = count
            .checked_mul(mem::size_of::<SectionHeader>())
            .and_then(|bytes| offset.checked_add(bytes))
            .ok_or(ImageError::TooShort)?;
        if self.data.len() < end {
            return Err(ImageError::TooShort);
        }
        // Packed layout, alignment 1; any offset is valid.
        Ok(unsafe {
            slice::from_raw_parts(self.data.as_ptr().add(offset).cast::<SectionHeader>(), count)
        })
    }
}

/// Locate a named section's raw data within an unmapped image file.
pub fn find_section<'a>(data: &'a [u8], name: &str) -> Result<&'a [u8]> {
    let view = HeaderView::parse(data)?;
    for section in view.sections()? {
        if section.name_bytes() != name.as_bytes() {
            continue;
        }
        let start = { section.pointer_to_raw_data } as usize;
        let size = { section.size_of_raw_data } as usize;
        let end = start.checked_add(size).ok_or(ImageError::TooShort)?;
        if data.len() < end {
            return Err(ImageError::TooShort);
        }
        return Ok(&data[start..end]);
    }
    Err(ImageError::SectionNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        assert_eq!(mem::size_of::<DosHeader>(), 64);
        assert_eq!(mem::size_of::<FileHeader>(), 20);
        assert_eq!(mem::size_of::<SectionHeader>(), 40);
        assert_eq!(mem::size_of::<BaseRelocation>(), 8);
        // Standard optional header sizes: 0xE0 for PE32, 0xF0 for PE32+.
        assert_eq!(mem::size_of::<OptionalHeader32>(), 0xE0);
        assert_eq!(mem::size_of::<OptionalHeader64>(), 0xF0);
    }

    #[test]
    fn test_section_name_trimming() {
        let section = SectionHeader {
            name: *b".text\0\0\0",
            ..Default::default()
        };
        assert_eq!(section.name_bytes(), b".text");

        let full = SectionHeader {
            name: *b".eightch",
            ..Default::default()
        };
        assert_eq!(full.name_bytes(), b".eightch");
    }
}
