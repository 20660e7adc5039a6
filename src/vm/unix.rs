use std::ptr::{self, NonNull};

/// Reserve `size` bytes aligned to `size`.
///
/// mmap only guarantees the alignment of the system page, so we map
/// twice the size and unmap what sticks out on each side.
///
/// # Safety
/// `size` must be a non-zero power of two, multiple of the system page.
pub unsafe fn reserve_aligned(size: usize) -> Option<NonNull<u8>> {
    let map_size = size.checked_mul(2)?;

    let raw = libc::mmap(
        ptr::null_mut(),
        map_size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if raw == libc::MAP_FAILED {
        return None;
    }

    let start = raw as usize;
    let aligned = (start + size - 1) & !(size - 1);

    let head = aligned - start;
    let tail = map_size - head - size;

    if head > 0 {
        libc::munmap(raw, head);
    }
    if tail > 0 {
        libc::munmap((aligned + size) as *mut libc::c_void, tail);
    }

    NonNull::new(aligned as *mut u8)
}

/// # Safety
/// `ptr` and `size` must come from `reserve_aligned`.
pub unsafe fn release(ptr: NonNull<u8>, size: usize) {
    let ret = libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
    debug_assert!(ret == 0, "munmap failed");
}

/// # Safety
/// Range must be reserved and page-aligned.
pub unsafe fn commit(ptr: NonNull<u8>, size: usize) -> bool {
    libc::mprotect(
        ptr.as_ptr() as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    ) == 0
}

/// MADV_DONTNEED drops the physical pages, the range reads as zeros if
/// committed again.
///
/// # Safety
/// Range must be committed and page-aligned.
pub unsafe fn decommit(ptr: NonNull<u8>, size: usize) {
    let addr = ptr.as_ptr() as *mut libc::c_void;

    let ret = libc::madvise(addr, size, libc::MADV_DONTNEED);
    debug_assert!(ret == 0, "madvise(MADV_DONTNEED) failed");

    let ret = libc::mprotect(addr, size, libc::PROT_NONE);
    debug_assert!(ret == 0, "mprotect(PROT_NONE) failed");
}
