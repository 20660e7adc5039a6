//! Operating system virtual memory.
//!
//! A region goes through reserve -> commit -> decommit -> release. The
//! heap only touches committed memory.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering::*};
use std::sync::Arc;

use crate::common::SLOT_SIZE;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as sys;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as sys;

/// Source of backing memory for a [`Heap`](crate::Heap)
pub trait VirtualMemory: Send + Sync {
    /// Unit of commit/decommit
    const GRANULARITY: usize = SLOT_SIZE;

    /// Reserve `bytes` of address space aligned to `bytes`.
    /// The range is not accessible until committed.
    fn reserve(&self, bytes: usize) -> Option<NonNull<u8>>;

    /// Give back a reservation.
    ///
    /// # Safety
    /// `ptr` and `bytes` must come from one call to `reserve`, and nothing
    /// may access the range afterward.
    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize);

    /// Back a reserved range with physical memory, readable and writable.
    ///
    /// # Safety
    /// The range must be inside a reservation and multiple of `GRANULARITY`.
    unsafe fn commit(&self, ptr: NonNull<u8>, bytes: usize) -> bool;

    /// Inverse of `commit`. Content of the range is lost.
    ///
    /// # Safety
    /// The range must be committed and not in use.
    unsafe fn decommit(&self, ptr: NonNull<u8>, bytes: usize);
}

/// Virtual memory of the operating system (mmap on unix, VirtualAlloc on
/// windows).
///
/// Counts what goes through it. The counters are observational only.
#[derive(Debug, Default)]
pub struct SystemMemory {
    commits: AtomicUsize,
    decommits: AtomicUsize,
    committed: AtomicUsize,
}

impl SystemMemory {
    pub fn new() -> SystemMemory {
        SystemMemory::default()
    }

    /// Number of successful commits so far
    pub fn commits(&self) -> usize {
        self.commits.load(Relaxed)
    }

    pub fn decommits(&self) -> usize {
        self.decommits.load(Relaxed)
    }

    /// Bytes currently committed
    pub fn committed_bytes(&self) -> usize {
        self.committed.load(Relaxed)
    }
}

impl VirtualMemory for SystemMemory {
    fn reserve(&self, bytes: usize) -> Option<NonNull<u8>> {
        debug_assert!(bytes.is_power_of_two());

        let ptr = unsafe { sys::reserve_aligned(bytes) };
        debug_assert!(ptr.map_or(true, |p| p.as_ptr() as usize % bytes == 0));

        ptr
    }

    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        sys::release(ptr, bytes);
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, bytes: usize) -> bool {
        debug_assert_eq!(bytes % Self::GRANULARITY, 0);

        if !sys::commit(ptr, bytes) {
            return false;
        }

        self.commits.fetch_add(1, Relaxed);
        self.committed.fetch_add(bytes, Relaxed);
        true
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, bytes: usize) {
        sys::decommit(ptr, bytes);

        self.decommits.fetch_add(1, Relaxed);
        self.committed.fetch_sub(bytes, Relaxed);
    }
}

/// Lets several heaps, or a heap and its owner, share one memory source
/// and its counters
impl<V: VirtualMemory> VirtualMemory for Arc<V> {
    const GRANULARITY: usize = V::GRANULARITY;

    fn reserve(&self, bytes: usize) -> Option<NonNull<u8>> {
        (**self).reserve(bytes)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        (**self).release(ptr, bytes)
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, bytes: usize) -> bool {
        (**self).commit(ptr, bytes)
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, bytes: usize) {
        (**self).decommit(ptr, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::{SystemMemory, VirtualMemory};
    use crate::common::PAGE_CAPACITY;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn region_lifecycle() {
        let vm = SystemMemory::new();

        let region = vm.reserve(PAGE_CAPACITY).expect("reserve");
        assert_eq!(region.as_ptr() as usize % PAGE_CAPACITY, 0);

        unsafe {
            assert!(vm.commit(region, PAGE_CAPACITY));
            assert_eq!(vm.committed_bytes(), PAGE_CAPACITY);

            // Committed memory is writable, first and last byte
            region.as_ptr().write(0xAB);
            region.as_ptr().add(PAGE_CAPACITY - 1).write(0xCD);
            assert_eq!(region.as_ptr().read(), 0xAB);

            vm.decommit(region, PAGE_CAPACITY);
            vm.release(region, PAGE_CAPACITY);
        }

        assert_eq!(vm.commits(), 1);
        assert_eq!(vm.decommits(), 1);
        assert_eq!(vm.committed_bytes(), 0);
    }
}
