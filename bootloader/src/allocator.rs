//! Hybrid global allocator.
//!
//! Before ExitBootServices every allocation goes through the firmware pool
//! allocator; afterwards a `linked_list_allocator` heap over a static
//! buffer takes over. The EFI binary declares the `#[global_allocator]`
//! instance and calls `switch_to_post_ebs` right after exiting boot
//! services.

use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use linked_list_allocator::Heap;
use spin::Mutex;

use xtldr_core::efi::memory_type;

use crate::tables::BootServices;

static BOOT_SERVICES: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

static POST_EBS: AtomicBool = AtomicBool::new(false);

/// Post-EBS heap size: 4MB
const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[repr(C, align(4096))]
struct AlignedHeapBuffer([u8; HEAP_SIZE]);

/// Static heap buffer, zero-initialized in .bss.
static mut HEAP_BUFFER: AlignedHeapBuffer = AlignedHeapBuffer([0u8; HEAP_SIZE]);

static POST_EBS_HEAP: Mutex<Heap> = Mutex::new(Heap::empty());

/// Set the boot services pointer (call once at the start of the entry
/// point, before the first allocation).
pub fn set_boot_services(boot_services: *const BootServices) {
    BOOT_SERVICES.store(boot_services as *mut (), Ordering::SeqCst);
}

/// Switch to the static heap after ExitBootServices.
///
/// # Safety
/// Must only be called once, after ExitBootServices; pool allocations made
/// before the switch must never be freed after it.
pub unsafe fn switch_to_post_ebs() {
    let heap_start = ptr::addr_of_mut!(HEAP_BUFFER).cast::<u8>();
    POST_EBS_HEAP.lock().init(heap_start, HEAP_SIZE);

    // The firmware tables are gone now.
    BOOT_SERVICES.store(ptr::null_mut(), Ordering::SeqCst);
    POST_EBS.store(true, Ordering::SeqCst);
}

pub struct HybridAllocator;

unsafe impl GlobalAlloc for HybridAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if POST_EBS.load(Ordering::SeqCst) {
            POST_EBS_HEAP
                .lock()
                .allocate_first_fit(layout)
                .map(|block| block.as_ptr())
                .unwrap_or(ptr::null_mut())
        } else {
            alloc_pool(layout)
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        if POST_EBS.load(Ordering::SeqCst) {
            if let Some(block) = NonNull::new(ptr) {
                POST_EBS_HEAP.lock().deallocate(block, layout);
            }
        } else {
            dealloc_pool(ptr, layout);
        }
    }
}

unsafe fn alloc_pool(layout: Layout) -> *mut u8 {
    let bs_ptr = BOOT_SERVICES.load(Ordering::SeqCst);
    if bs_ptr.is_null() {
        return ptr::null_mut();
    }
    let bs = &*(bs_ptr as *const BootServices);

    let align = layout.align();
    let size = layout.size();

    if align <= 8 {
        // Pool allocations are 8-byte aligned already.
        let mut buffer: *mut u8 = ptr::null_mut();
        let result = (bs.allocate_pool)(memory_type::LOADER_DATA, size, &mut buffer);
        if result == 0 {
            buffer
        } else {
            ptr::null_mut()
        }
    } else {
        // Over-allocate and stash the original pointer below the aligned
        // block for dealloc.
        let total_size = size + align + mem::size_of::<usize>();
        let mut buffer: *mut u8 = ptr::null_mut();
        let result = (bs.allocate_pool)(memory_type::LOADER_DATA, total_size, &mut buffer);
        if result != 0 {
            return ptr::null_mut();
        }

        let raw_addr = buffer as usize;
        let aligned_addr = (raw_addr + mem::size_of::<usize>() + align - 1) & !(align - 1);
        let original_ptr_location = (aligned_addr - mem::size_of::<usize>()) as *mut usize;
        *original_ptr_location = raw_addr;

        aligned_addr as *mut u8
    }
}

unsafe fn dealloc_pool(ptr: *mut u8, layout: Layout) {
    let bs_ptr = BOOT_SERVICES.load(Ordering::SeqCst);
    if bs_ptr.is_null() {
        return;
    }
    let bs = &*(bs_ptr as *const BootServices);

    if layout.align() <= 8 {
        let _ = (bs.free_pool)(ptr);
    } else {
        let original_ptr_location = (ptr as usize - mem::size_of::<usize>()) as *mut usize;
        let original_ptr = *original_ptr_location as *mut u8;
        let _ = (bs.free_pool)(original_ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test because the mode switch is global and one-way.
    #[test]
    fn test_mode_switch() {
        let allocator = HybridAllocator;

        // No boot services pointer installed; allocation must fail cleanly.
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = unsafe { allocator.alloc(layout) };
        assert!(ptr.is_null());
        unsafe { allocator.dealloc(ptr, layout) };

        unsafe { switch_to_post_ebs() };

        let layout = Layout::from_size_align(256, 16).unwrap();
        let block = unsafe { allocator.alloc(layout) };
        assert!(!block.is_null());
        assert_eq!(block as usize % 16, 0);
        unsafe {
            ptr::write_bytes(block, 0xA5, 256);
            allocator.dealloc(block, layout);
        }
    }
}
