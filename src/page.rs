use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering::*};

use crossbeam_utils::Backoff;

use crate::bits;
use crate::cache_line::CacheAligned;
use crate::common::{Bitfield, ALL_FREE, MAX_SLOTS, PAGE_CAPACITY, SLOT_SIZE};

/// Number of failed compare-and-swap before a page reports that it has no
/// room. The heap then tries another page.
pub(crate) const CAS_RETRY_LIMIT: usize = 64;

/// Where a page searches for a free run
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    /// From slot 0 upward
    Low,
    /// From the last slot downward
    High,
}

impl Placement {
    /// Placement used for a request of `nslots` slots
    pub fn for_slots(nslots: usize, large_block_threshold: usize) -> Placement {
        if nslots > large_block_threshold {
            Placement::High
        } else {
            Placement::Low
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageState {
    Empty,
    Partial,
    Full,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PageStats {
    pub capacity: usize,
    pub available: usize,
    pub used: usize,
    pub largest_free: usize,
    /// Number of live allocations
    pub allocations: usize,
    /// `100 * (1 - largest_free / available)`, 0 when nothing is available
    pub fragmentation: f64,
}

/// A lock-free bitmap allocator over one region of [`PAGE_CAPACITY`] bytes.
///
/// The region is split in [`MAX_SLOTS`] slots of [`SLOT_SIZE`] bytes. An
/// allocation is a run of contiguous slots.
///
/// The page never reads or writes the region itself, it only hands out
/// offsets. Backing memory is the heap's business.
pub struct Page {
    /// Bitfield representing free and non-free slots.
    /// - 1 = free
    /// - 0 = non-free
    free: CacheAligned<Bitfield>,
    /// A set bit marks the last slot of a live allocation.
    /// The length of an allocation starting at `offset` is the distance
    /// to the first set bit at or above `offset`.
    boundary: AtomicU64,
    base: usize,
    /// Link in the heap's list of empty pages, valid only while
    /// `in_free_list` is set
    pub(crate) next_free: AtomicPtr<Page>,
    pub(crate) in_free_list: AtomicBool,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
         .field("base", &format_args!("{:#x}", self.base))
         .field("free    ", &format_args!("{:064b}", self.free.load(Relaxed)))
         .field("boundary", &format_args!("{:064b}", self.boundary.load(Relaxed)))
         .field("in_free_list", &self.in_free_list.load(Relaxed))
         .finish()
    }
}

impl Page {
    /// Make a page managing the region at `base`.
    ///
    /// `base` must be aligned to [`PAGE_CAPACITY`].
    pub fn new(base: usize) -> Page {
        assert_eq!(base % PAGE_CAPACITY, 0, "Page: base {:#x} is misaligned", base);

        Page {
            free: CacheAligned::new(AtomicU64::new(ALL_FREE)),
            boundary: AtomicU64::new(0),
            base,
            next_free: AtomicPtr::new(std::ptr::null_mut()),
            in_free_list: AtomicBool::new(false),
        }
    }

    /// Reinitialize a recycled control block for a new region
    pub(crate) fn reset(&mut self, base: usize) {
        assert_eq!(base % PAGE_CAPACITY, 0, "Page: base {:#x} is misaligned", base);

        *self.free.get_mut() = ALL_FREE;
        *self.boundary.get_mut() = 0;
        *self.next_free.get_mut() = std::ptr::null_mut();
        *self.in_free_list.get_mut() = false;
        self.base = base;
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Search for a free run of `size / SLOT_SIZE` slots and mark it as
    /// non-free. `size` must be a non-zero multiple of [`SLOT_SIZE`].
    ///
    /// Returns the slot offset of the run, or None if there is no run
    /// long enough (or the page is too contended).
    pub fn allocate(&self, size: usize, placement: Placement) -> Option<usize> {
        debug_assert!(size != 0 && size % SLOT_SIZE == 0, "Page: bad size {}", size);

        let nslots = size / SLOT_SIZE;
        if nslots == 0 || nslots > MAX_SLOTS {
            return None;
        }

        let backoff = Backoff::new();
        let mut bitfield = self.free.load(Acquire);

        for _ in 0..CAS_RETRY_LIMIT {
            let offset = match placement {
                Placement::Low => bits::find_run_low(bitfield, nslots),
                Placement::High => bits::find_run_high(bitfield, nslots),
            }?;

            let run = bits::run_mask(offset, nslots);

            match self.free.compare_exchange_weak(bitfield, bitfield & !run, AcqRel, Acquire) {
                Ok(_) => {
                    // The run is ours, no other thread can touch its boundary bit
                    self.boundary.fetch_or(1 << (offset + nslots - 1), Release);
                    return Some(offset);
                }
                Err(current) => {
                    bitfield = current;
                    backoff.spin();
                }
            }
        }

        None
    }

    /// Mark the allocation starting at slot `offset` as free.
    ///
    /// Returns true if the page is now completely free.
    pub fn free(&self, offset: usize) -> bool {
        let nslots = self.slots_at(offset);
        let run = bits::run_mask(offset, nslots);

        assert_eq!(
            self.free.load(Acquire) & run, 0,
            "Page: freeing slots {}..{} which are already free", offset, offset + nslots
        );

        // The boundary bit is cleared before the slots are released:
        // once they are visible as free, another thread may place an
        // allocation ending on the same slot.
        self.boundary.fetch_and(!(1 << (offset + nslots - 1)), AcqRel);

        // We're the only thread owning those bits, fetch_or can't lose
        // a concurrent update
        let old_bitfield = self.free.fetch_or(run, AcqRel);

        (old_bitfield | run) == ALL_FREE
    }

    /// Grow or shrink in place the allocation starting at slot `offset`
    /// to `new_size` bytes (a non-zero multiple of [`SLOT_SIZE`]).
    ///
    /// The allocation never moves. On failure it is left untouched.
    pub fn resize(&self, offset: usize, new_size: usize) -> Option<()> {
        debug_assert!(new_size != 0 && new_size % SLOT_SIZE == 0, "Page: bad size {}", new_size);

        let old_slots = self.slots_at(offset);
        let new_slots = new_size / SLOT_SIZE;

        if new_slots == old_slots {
            return Some(());
        }
        if new_slots == 0 || offset + new_slots > MAX_SLOTS {
            return None;
        }

        let old_end = 1 << (offset + old_slots - 1);
        let new_end = 1 << (offset + new_slots - 1);

        self.boundary.fetch_and(!old_end, AcqRel);

        let resized = if new_slots > old_slots {
            let grow = bits::run_mask(offset + old_slots, new_slots - old_slots);
            self.take_slots(grow)
        } else {
            let shrink = bits::run_mask(offset + new_slots, old_slots - new_slots);
            self.free.fetch_or(shrink, AcqRel);
            true
        };

        if resized {
            self.boundary.fetch_or(new_end, Release);
            Some(())
        } else {
            self.boundary.fetch_or(old_end, Release);
            None
        }
    }

    /// Clear all the bits of `run` in the free mask, only if they are
    /// all set.
    fn take_slots(&self, run: u64) -> bool {
        let backoff = Backoff::new();
        let mut bitfield = self.free.load(Acquire);

        for _ in 0..CAS_RETRY_LIMIT {
            if bitfield & run != run {
                return false;
            }

            match self.free.compare_exchange_weak(bitfield, bitfield & !run, AcqRel, Acquire) {
                Ok(_) => return true,
                Err(current) => {
                    bitfield = current;
                    backoff.spin();
                }
            }
        }

        false
    }

    /// Number of slots of the live allocation starting at `offset`
    fn slots_at(&self, offset: usize) -> usize {
        assert!(offset < MAX_SLOTS, "Page: slot {} out of bounds", offset);

        let boundary = self.boundary.load(Acquire);

        match bits::run_length_to_boundary(boundary, offset) {
            Some(nslots) => nslots,
            None => panic!("Page: no live allocation at slot {} of {:#x}", offset, self.base),
        }
    }

    /// Slot offset of `addr`, which must be the first byte of an
    /// allocation in this page
    pub fn offset_of(&self, addr: usize) -> usize {
        assert!(self.aliases(addr), "Page: {:#x} is not in region {:#x}", addr, self.base);

        let delta = addr - self.base;
        assert_eq!(delta % SLOT_SIZE, 0, "Page: {:#x} is not the start of a slot", addr);

        delta / SLOT_SIZE
    }

    #[inline]
    pub fn address_of(&self, offset: usize) -> usize {
        debug_assert!(offset < MAX_SLOTS);
        self.base + offset * SLOT_SIZE
    }

    /// Size in bytes of the allocation starting at `addr`
    pub fn region_size(&self, addr: usize) -> usize {
        self.slots_at(self.offset_of(addr)) * SLOT_SIZE
    }

    #[inline]
    pub fn aliases(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < PAGE_CAPACITY
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        PAGE_CAPACITY
    }

    pub fn available(&self) -> usize {
        self.free.load(Relaxed).count_ones() as usize * SLOT_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.free.load(Acquire) == ALL_FREE
    }

    pub fn largest_contiguous_free(&self) -> usize {
        bits::longest_run(self.free.load(Relaxed)) * SLOT_SIZE
    }

    pub fn external_fragmentation(&self) -> f64 {
        fragmentation(self.largest_contiguous_free(), self.available())
    }

    pub fn state(&self) -> PageState {
        match self.free.load(Relaxed) {
            ALL_FREE => PageState::Empty,
            0 => PageState::Full,
            _ => PageState::Partial,
        }
    }

    /// Snapshot of the page. Both masks are read once so the numbers are
    /// consistent with each other.
    pub fn stats(&self) -> PageStats {
        let free = self.free.load(Acquire);
        let boundary = self.boundary.load(Acquire);

        let available = free.count_ones() as usize * SLOT_SIZE;
        let largest_free = bits::longest_run(free) * SLOT_SIZE;

        PageStats {
            capacity: PAGE_CAPACITY,
            available,
            used: PAGE_CAPACITY - available,
            largest_free,
            allocations: boundary.count_ones() as usize,
            fragmentation: fragmentation(largest_free, available),
        }
    }

    /// Every boundary bit is on a non-free slot, and every run of
    /// non-free slots ends on a boundary bit.
    ///
    /// Only meaningful when no thread is allocating in the page.
    pub fn check_invariants(&self) -> bool {
        let free = self.free.load(Acquire);
        let boundary = self.boundary.load(Acquire);

        if boundary & free != 0 {
            return false;
        }

        // A non-free slot followed by a free slot (or the end of the
        // page) must be the end of an allocation
        let used = !free;
        let last_of_used_run = used & (free >> 1 | 1 << 63);

        last_of_used_run & !boundary == 0
    }
}

fn fragmentation(largest_free: usize, available: usize) -> f64 {
    if available == 0 {
        return 0.0;
    }
    100.0 * (1.0 - largest_free as f64 / available as f64)
}
