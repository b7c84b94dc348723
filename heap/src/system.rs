use std::ptr::NonNull;

pub const OS_PAGE_SIZE: usize = 4096;

/// Map `size` bytes of zeroed anonymous memory, page-aligned.
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    debug_assert!(size % OS_PAGE_SIZE == 0);
    // SAFETY: anonymous private mapping; no fd, no offset.
    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(ptr as *mut u8)
}

/// Unmap memory obtained from [`map_memory`].
///
/// # Safety
///
/// `ptr`/`size` must denote a live mapping from [`map_memory`]; nothing may
/// reference it afterwards.
pub unsafe fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    let _ = libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_zeroed_and_writable() {
        let size = 4 * OS_PAGE_SIZE;
        let ptr = map_memory(size).expect("map");
        unsafe {
            let slice = core::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            assert!(slice.iter().all(|&b| b == 0));
            slice[0] = 0xab;
            slice[size - 1] = 0xcd;
            assert_eq!(slice[0], 0xab);
            unmap_memory(ptr, size);
        }
    }
}
