use std::sync::atomic::AtomicU64;
use static_assertions::const_assert;

/// Number of slots managed by one page, one bit per slot
pub const MAX_SLOTS: usize = std::mem::size_of::<Bitfield>() * 8;
/// Allocation granularity
pub const SLOT_SIZE: usize = 64 * 1024;
/// Bytes managed by one page. Regions are aligned to this value.
pub const PAGE_CAPACITY: usize = MAX_SLOTS * SLOT_SIZE;

pub(crate) const ALL_FREE: u64 = !0;

pub(crate) type Bitfield = AtomicU64;

const_assert!(MAX_SLOTS == 64);
const_assert!(SLOT_SIZE.is_power_of_two());
const_assert!(PAGE_CAPACITY.is_power_of_two());

/// Rounds `size` up to the next multiple of [`SLOT_SIZE`]
#[inline]
pub const fn round_to_slot(size: usize) -> usize {
    (size + SLOT_SIZE - 1) & !(SLOT_SIZE - 1)
}

#[inline]
pub(crate) const fn region_base(addr: usize) -> usize {
    addr & !(PAGE_CAPACITY - 1)
}
