use std::ptr::{self, NonNull};

use winapi::shared::minwindef::LPVOID;
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
use winapi::um::winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

/// Attempts before giving up on an aligned reservation. Another thread
/// may take the address between the probe and the actual reservation.
const RESERVE_ATTEMPTS: usize = 8;

/// Reserve `size` bytes aligned to `size`.
///
/// VirtualFree can't release part of a reservation: we probe with a
/// larger one, release it, then reserve again at the aligned address.
///
/// # Safety
/// `size` must be a non-zero power of two, multiple of the allocation
/// granularity.
pub unsafe fn reserve_aligned(size: usize) -> Option<NonNull<u8>> {
    let probe_size = size.checked_mul(2)?;

    for _ in 0..RESERVE_ATTEMPTS {
        let probe = VirtualAlloc(ptr::null_mut(), probe_size, MEM_RESERVE, PAGE_NOACCESS);
        if probe.is_null() {
            return None;
        }
        VirtualFree(probe, 0, MEM_RELEASE);

        let aligned = ((probe as usize) + size - 1) & !(size - 1);
        let region = VirtualAlloc(aligned as LPVOID, size, MEM_RESERVE, PAGE_NOACCESS);

        if !region.is_null() {
            return NonNull::new(region as *mut u8);
        }
    }

    None
}

/// # Safety
/// `ptr` must come from `reserve_aligned`.
pub unsafe fn release(ptr: NonNull<u8>, _size: usize) {
    let ret = VirtualFree(ptr.as_ptr() as LPVOID, 0, MEM_RELEASE);
    debug_assert!(ret != 0, "VirtualFree(MEM_RELEASE) failed");
}

/// # Safety
/// Range must be reserved.
pub unsafe fn commit(ptr: NonNull<u8>, size: usize) -> bool {
    !VirtualAlloc(ptr.as_ptr() as LPVOID, size, MEM_COMMIT, PAGE_READWRITE).is_null()
}

/// # Safety
/// Range must be committed.
pub unsafe fn decommit(ptr: NonNull<u8>, size: usize) {
    let ret = VirtualFree(ptr.as_ptr() as LPVOID, size, MEM_DECOMMIT);
    debug_assert!(ret != 0, "VirtualFree(MEM_DECOMMIT) failed");
}
