//! In-memory firmware implementation for unit tests.
//!
//! Backs page allocations with the host allocator, serves files from an
//! in-memory store, and records image/protocol/variable activity so tests
//! can assert on loader behavior and on allocation balance.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::ffi::c_void;
use core::mem;
use core::ptr;

use crate::efi::{
    memory_type, status, FileInfo, Guid, Handle, MemoryClass, PhysicalAddress, Status, PAGE_SIZE,
};
use crate::firmware::{
    FileAccess, FileSystem, ImageServices, LoadedImageInfo, MemoryOps, ProtocolOps, VariableOps,
};

struct MockImage {
    data: Vec<u8>,
    path: String,
    code_type: usize,
    started: bool,
}

struct MockState {
    files: BTreeMap<String, Vec<u8>>,
    pages: BTreeMap<PhysicalAddress, usize>,
    images: BTreeMap<usize, MockImage>,
    next_handle: usize,
    protocols: Vec<(Guid, *mut c_void)>,
    variables: Vec<(String, Vec<u8>)>,
    secure_boot: bool,
    load_image_error: Option<Status>,
    image_code_type: usize,
    started_paths: Vec<String>,
}

/// Scriptable firmware double.
pub struct MockFirmware {
    state: RefCell<MockState>,
}

impl MockFirmware {
    pub fn new() -> Self {
        MockFirmware {
            state: RefCell::new(MockState {
                files: BTreeMap::new(),
                pages: BTreeMap::new(),
                images: BTreeMap::new(),
                next_handle: 1,
                protocols: Vec::new(),
                variables: Vec::new(),
                secure_boot: false,
                load_image_error: None,
                image_code_type: memory_type::BOOT_SERVICES_CODE,
                started_paths: Vec::new(),
            }),
        }
    }

    /// Add a file to the in-memory volume. Paths match case-insensitively.
    pub fn add_file(&self, path: &str, data: Vec<u8>) {
        self.state
            .borrow_mut()
            .files
            .insert(path.to_ascii_uppercase(), data);
    }

    pub fn set_secure_boot(&self, active: bool) {
        self.state.borrow_mut().secure_boot = active;
    }

    /// Make every subsequent `load_image` call fail with `error`.
    pub fn fail_load_image(&self, error: Status) {
        self.state.borrow_mut().load_image_error = Some(error);
    }

    /// Code type reported for subsequently loaded images.
    pub fn set_image_code_type(&self, code_type: usize) {
        self.state.borrow_mut().image_code_type = code_type;
    }

    pub fn install_protocol(&self, guid: Guid, interface: *mut c_void) {
        self.state.borrow_mut().protocols.push((guid, interface));
    }

    /// Pages currently allocated and not yet freed.
    pub fn outstanding_pages(&self) -> usize {
        self.state.borrow().pages.values().sum()
    }

    /// Number of images currently loaded (started or not).
    pub fn image_count(&self) -> usize {
        self.state.borrow().images.len()
    }

    /// Paths of images that were started, in order.
    pub fn started_paths(&self) -> Vec<String> {
        self.state.borrow().started_paths.clone()
    }

    pub fn variable(&self, name: &str) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .variables
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v.clone())
    }
}

impl Default for MockFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MockState {
    fn drop(&mut self) {
        for (&address, &pages) in self.pages.iter() {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            unsafe { dealloc(address as *mut u8, layout) };
        }
    }
}

impl MemoryOps for MockFirmware {
    fn allocate_pages(&self, pages: usize, _class: MemoryClass) -> Result<PhysicalAddress, Status> {
        if pages == 0 {
            return Err(status::INVALID_PARAMETER);
        }
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE)
            .map_err(|_| status::INVALID_PARAMETER)?;
        let buffer = unsafe { alloc_zeroed(layout) };
        if buffer.is_null() {
            return Err(status::OUT_OF_RESOURCES);
        }
        let address = buffer as PhysicalAddress;
        self.state.borrow_mut().pages.insert(address, pages);
        Ok(address)
    }

    fn free_pages(&self, address: PhysicalAddress, pages: usize) {
        let tracked = self.state.borrow_mut().pages.remove(&address);
        match tracked {
            Some(allocated) => {
                assert_eq!(allocated, pages, "free_pages size mismatch");
                let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
                unsafe { dealloc(address as *mut u8, layout) };
            }
            None => panic!("free_pages of untracked address {address:#x}"),
        }
    }
}

struct MockFile {
    name: String,
    data: Vec<u8>,
    position: usize,
}

impl FileAccess for MockFile {
    fn file_info(&mut self, buffer: &mut [u8], needed: &mut usize) -> Status {
        let name_bytes = 2 * (self.name.len() + 1);
        let required = mem::size_of::<FileInfo>() + name_bytes;
        if buffer.len() < required {
            *needed = required;
            return status::BUFFER_TOO_SMALL;
        }

        let info = FileInfo {
            size: required as u64,
            file_size: self.data.len() as u64,
            physical_size: self.data.len() as u64,
            create_time: [0; 16],
            last_access_time: [0; 16],
            modification_time: [0; 16],
            attribute: 0,
        };
        unsafe { ptr::write_unaligned(buffer.as_mut_ptr().cast::<FileInfo>(), info) };

        let mut offset = mem::size_of::<FileInfo>();
        for unit in self.name.encode_utf16() {
            buffer[offset..offset + 2].copy_from_slice(&unit.to_le_bytes());
            offset += 2;
        }
        buffer[offset..offset + 2].copy_from_slice(&0u16.to_le_bytes());

        status::SUCCESS
    }

    fn read(&mut self, buffer: &mut [u8], read: &mut usize) -> Status {
        let remaining = self.data.len() - self.position;
        let chunk = buffer.len().min(remaining);
        buffer[..chunk].copy_from_slice(&self.data[self.position..self.position + chunk]);
        self.position += chunk;
        *read = chunk;
        status::SUCCESS
    }
}

impl FileSystem for MockFirmware {
    fn open(&self, path: &str) -> Result<Box<dyn FileAccess>, Status> {
        let key = path.to_ascii_uppercase();
        let state = self.state.borrow();
        let data = state.files.get(&key).ok_or(status::NOT_FOUND)?.clone();
        let name = key.rsplit('\\').next().unwrap_or(&key).to_string();
        Ok(Box::new(MockFile {
            name,
            data,
            position: 0,
        }))
    }
}

impl ImageServices for MockFirmware {
    fn load_image(&self, buffer: &[u8], file_path: &str) -> Result<Handle, Status> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.load_image_error {
            return Err(error);
        }
        if buffer.is_empty() {
            return Err(status::LOAD_ERROR);
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        let code_type = state.image_code_type;
        state.images.insert(
            handle,
            MockImage {
                data: buffer.to_vec(),
                path: file_path.to_string(),
                code_type,
                started: false,
            },
        );
        Ok(handle as Handle)
    }

    fn start_image(&self, handle: Handle) -> Result<(), Status> {
        let mut state = self.state.borrow_mut();
        let id = handle as usize;
        let path = match state.images.get_mut(&id) {
            Some(image) => {
                image.started = true;
                image.path.clone()
            }
            None => return Err(status::INVALID_PARAMETER),
        };
        state.started_paths.push(path);
        Ok(())
    }

    fn loaded_image_info(&self, handle: Handle) -> Result<LoadedImageInfo, Status> {
        let state = self.state.borrow();
        let image = state
            .images
            .get(&(handle as usize))
            .ok_or(status::INVALID_PARAMETER)?;
        Ok(LoadedImageInfo {
            image_base: image.data.as_ptr() as PhysicalAddress,
            image_size: image.data.len() as u64,
            revision: 0x1000,
            code_type: image.code_type,
            unload: None,
        })
    }

    fn unload_image(&self, handle: Handle) {
        self.state.borrow_mut().images.remove(&(handle as usize));
    }

    fn secure_boot_active(&self) -> bool {
        self.state.borrow().secure_boot
    }
}

impl ProtocolOps for MockFirmware {
    fn open_protocol(&self, guid: &Guid) -> Result<*mut c_void, Status> {
        self.state
            .borrow()
            .protocols
            .iter()
            .find(|(g, _)| g == guid)
            .map(|&(_, interface)| interface)
            .ok_or(status::NOT_FOUND)
    }
}

impl VariableOps for MockFirmware {
    fn set_variable(&self, name: &str, value: &[u8]) -> Status {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.variables.iter_mut().find(|(n, _)| n.as_str() == name) {
            entry.1 = value.to_vec();
        } else {
            state.variables.push((name.to_string(), value.to_vec()));
        }
        status::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::{file_size, read_file};

    #[test]
    fn test_page_ledger_balances() {
        let fw = MockFirmware::new();
        let a = fw.allocate_pages(3, MemoryClass::Data).unwrap();
        let b = fw.allocate_pages(1, MemoryClass::Code).unwrap();
        assert_eq!(fw.outstanding_pages(), 4);
        fw.free_pages(a, 3);
        fw.free_pages(b, 1);
        assert_eq!(fw.outstanding_pages(), 0);
    }

    #[test]
    fn test_file_info_retry_path() {
        let fw = MockFirmware::new();
        fw.add_file("\\DIR\\SAMPLE.EFI", alloc::vec![0xAB; 300]);
        let mut file = fw.open("\\dir\\sample.efi").unwrap();
        // The record carries the file name, so the header-sized probe must
        // come back BUFFER_TOO_SMALL and the retry must succeed.
        assert_eq!(file_size(file.as_mut()).unwrap(), 300);
    }

    #[test]
    fn test_read_file_round_trip() {
        let fw = MockFirmware::new();
        let payload: Vec<u8> = (0..=255u8).cycle().take(9000).collect();
        fw.add_file("\\A.BIN", payload.clone());
        let mut file = fw.open("\\A.BIN").unwrap();
        assert_eq!(read_file(file.as_mut()).unwrap(), payload);
    }

    #[test]
    fn test_missing_file() {
        let fw = MockFirmware::new();
        assert_eq!(fw.open("\\NOPE.EFI").err(), Some(status::NOT_FOUND));
    }
}
