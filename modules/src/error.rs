//! Module loading and registry errors.

use alloc::string::String;
use core::fmt;

use xtldr_core::efi::Status;
use xtldr_pecoff::ImageError;

/// Errors from loading modules or dispatching a boot protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The module file is not a usable PE/COFF image.
    Image(ImageError),
    /// A firmware call failed with the given status.
    Firmware(Status),
    /// Secure boot rejected the module signature.
    SignatureRejected,
    /// The firmware placed the module outside boot-services code memory.
    InvalidModuleType,
    /// The named module is already being loaded further up the stack.
    Cycle(String),
    /// A dependency of the module could not be satisfied.
    Unsupported(String),
    /// No registered boot protocol matches the requested system type.
    ProtocolNotFound(String),
    /// A required boot option was not supplied.
    MissingBootOption(&'static str),
}

impl From<ImageError> for LoadError {
    fn from(error: ImageError) -> Self {
        LoadError::Image(error)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Image(error) => write!(f, "invalid module image: {error}"),
            LoadError::Firmware(status) => write!(f, "firmware error {status:#x}"),
            LoadError::SignatureRejected => write!(f, "signature rejected by secure boot"),
            LoadError::InvalidModuleType => write!(f, "module not in boot services code memory"),
            LoadError::Cycle(name) => write!(f, "dependency cycle through module {name}"),
            LoadError::Unsupported(name) => write!(f, "unsatisfied dependency {name}"),
            LoadError::ProtocolNotFound(name) => {
                write!(f, "no boot protocol registered for {name}")
            }
            LoadError::MissingBootOption(key) => write!(f, "missing boot option {key}"),
        }
    }
}

/// Errors from the boot protocol registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A protocol with this name already exists; the first wins.
    AlreadyRegistered,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyRegistered => write!(f, "boot protocol already registered"),
        }
    }
}
