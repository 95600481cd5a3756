//! `.modinfo` section parsing.
//!
//! The section is a table of NUL-terminated UTF-16LE `key=value` strings
//! emitted at build time. Unknown keys are ignored so newer modules keep
//! loading under older loaders.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use xtldr_core::log_debug;
use xtldr_pecoff::ImageError;

/// Decode the raw section payload into its string table.
///
/// A trailing odd byte is ignored; an empty table is an error since every
/// module must at least describe itself.
pub fn module_info_strings(data: &[u8]) -> Result<Vec<String>, ImageError> {
    let mut strings = Vec::new();
    let mut current: Vec<u16> = Vec::new();

    for pair in data.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        if unit == 0 {
            if !current.is_empty() {
                strings.push(String::from_utf16_lossy(&current));
                current.clear();
            }
        } else {
            current.push(unit);
        }
    }
    if !current.is_empty() {
        strings.push(String::from_utf16_lossy(&current));
    }

    if strings.is_empty() {
        return Err(ImageError::EndOfFile);
    }
    Ok(strings)
}

/// Metadata a module declares about itself.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ModuleMetadata {
    /// Every `author` entry, in order of appearance.
    pub authors: Vec<String>,
    pub description: Option<String>,
    pub license: Option<String>,
    pub version: Option<String>,
    /// Modules to load before this one, from `softdeps` entries.
    pub dependencies: Vec<String>,
}

impl ModuleMetadata {
    /// Classify the decoded `key=value` strings.
    ///
    /// Repeated `author` and `softdeps` entries accumulate; for the scalar
    /// keys the last occurrence wins. Entries without `=` are skipped.
    pub fn parse(strings: &[String]) -> Self {
        let mut metadata = ModuleMetadata::default();
        for entry in strings {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            match key {
                "author" => metadata.authors.push(value.to_string()),
                "description" => metadata.description = Some(value.to_string()),
                "license" => metadata.license = Some(value.to_string()),
                "version" => metadata.version = Some(value.to_string()),
                "softdeps" => metadata
                    .dependencies
                    .extend(value.split_whitespace().map(str::to_string)),
                _ => log_debug!("ignoring modinfo key {key}"),
            }
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use xtldr_pecoff::testimg::utf16_table;

    #[test]
    fn test_decodes_string_table() {
        let data = utf16_table(&["author=XT Team", "version=1.0"]);
        let strings = module_info_strings(&data).unwrap();
        assert_eq!(strings, vec!["author=XT Team", "version=1.0"]);
    }

    #[test]
    fn test_empty_table_rejected() {
        assert_eq!(module_info_strings(&[]).unwrap_err(), ImageError::EndOfFile);
        // All-NUL payload decodes to no strings either.
        assert_eq!(
            module_info_strings(&[0, 0, 0, 0]).unwrap_err(),
            ImageError::EndOfFile
        );
    }

    #[test]
    fn test_trailing_odd_byte_ignored() {
        let mut data = utf16_table(&["version=2"]);
        data.push(0xFF);
        let strings = module_info_strings(&data).unwrap();
        assert_eq!(strings, vec!["version=2"]);
    }

    #[test]
    fn test_metadata_classification() {
        let strings: Vec<String> = [
            "author=First",
            "author=Second",
            "description=old",
            "description=new",
            "license=GPLv3",
            "version=0.1",
            "softdeps=acpi fb",
            "softdeps=dummy",
            "flavor=unknown-key",
            "not-a-pair",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let metadata = ModuleMetadata::parse(&strings);
        assert_eq!(metadata.authors, vec!["First", "Second"]);
        assert_eq!(metadata.description.as_deref(), Some("new"));
        assert_eq!(metadata.license.as_deref(), Some("GPLv3"));
        assert_eq!(metadata.version.as_deref(), Some("0.1"));
        assert_eq!(metadata.dependencies, vec!["acpi", "fb", "dummy"]);
    }
}
