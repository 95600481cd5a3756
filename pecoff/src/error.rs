//! Image loading errors.

use core::fmt;

use xtldr_core::efi::Status;

pub type Result<T> = core::result::Result<T, ImageError>;

/// Errors produced while parsing, loading or relocating a PE/COFF image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// The file is too small to contain the structures it declares.
    TooShort,
    /// A DOS, PE or optional-header signature did not match.
    BadSignature,
    /// The image characteristics lack the executable flag.
    NotExecutable,
    /// A base-relocation entry uses a type the engine does not handle.
    UnsupportedReloc(u16),
    /// The requested section is not in the section table.
    SectionNotFound,
    /// A section that was expected to carry data is empty.
    EndOfFile,
    /// A firmware call failed with the given status.
    Firmware(Status),
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::TooShort => write!(f, "image file truncated"),
            ImageError::BadSignature => write!(f, "invalid image signature"),
            ImageError::NotExecutable => write!(f, "image is not executable"),
            ImageError::UnsupportedReloc(kind) => {
                write!(f, "unsupported relocation type {kind}")
            }
            ImageError::SectionNotFound => write!(f, "section not found"),
            ImageError::EndOfFile => write!(f, "unexpected end of section data"),
            ImageError::Firmware(status) => write!(f, "firmware error {status:#x}"),
        }
    }
}
