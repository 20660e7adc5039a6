//! Heap policy parameters.

use crate::common::{round_to_slot, MAX_SLOTS, PAGE_CAPACITY, SLOT_SIZE};
use crate::error::HeapError;
use crate::page::Placement;
use crate::page_cache::PageCache;

/// Policy of a [`Heap`](crate::Heap).
///
/// None of these values affect correctness, only fragmentation and how
/// eagerly empty regions are given back. Validated at heap construction.
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Requests of more slots than this are placed from the high end of
    /// a page, smaller ones from the low end.
    ///
    /// Default: 4 slots. Must be lower than `MAX_SLOTS`.
    pub large_block_threshold: usize,

    /// The largest allocation is `PAGE_CAPACITY / max_alloc_divisor`.
    ///
    /// Default: 2, so a page can always hold at least two allocations
    /// of the largest size.
    pub max_alloc_divisor: usize,

    /// `free` runs the non-blocking collector once more than this many
    /// empty pages are waiting.
    ///
    /// Default: 1.
    pub gc_queue_threshold: usize,

    /// Idle page control blocks kept for reuse.
    ///
    /// Default: 16.
    pub page_cache_limit: usize,
}

impl HeapConfig {
    pub const DEFAULT_LARGE_BLOCK_THRESHOLD: usize = 4;
    pub const DEFAULT_MAX_ALLOC_DIVISOR: usize = 2;
    pub const DEFAULT_GC_QUEUE_THRESHOLD: usize = 1;

    pub fn new() -> Self {
        Self {
            large_block_threshold: Self::DEFAULT_LARGE_BLOCK_THRESHOLD,
            max_alloc_divisor: Self::DEFAULT_MAX_ALLOC_DIVISOR,
            gc_queue_threshold: Self::DEFAULT_GC_QUEUE_THRESHOLD,
            page_cache_limit: PageCache::DEFAULT_LIMIT,
        }
    }

    pub fn validate(&self) -> Result<(), HeapError> {
        if self.large_block_threshold == 0 || self.large_block_threshold >= MAX_SLOTS {
            return Err(HeapError::InvalidConfig {
                reason: "large_block_threshold must be in 1..MAX_SLOTS",
            });
        }
        if self.max_alloc_divisor == 0 || PAGE_CAPACITY / self.max_alloc_divisor < SLOT_SIZE {
            return Err(HeapError::InvalidConfig {
                reason: "max_alloc_divisor must leave room for at least one slot",
            });
        }
        Ok(())
    }

    /// Largest size accepted by `allocate`, a multiple of `SLOT_SIZE`
    pub fn max_alloc_size(&self) -> usize {
        (PAGE_CAPACITY / self.max_alloc_divisor.max(1)) & !(SLOT_SIZE - 1)
    }

    /// Rounds `size` up to a multiple of `SLOT_SIZE`, rejecting zero and
    /// anything larger than [`max_alloc_size`](Self::max_alloc_size)
    pub fn round_size(&self, size: usize) -> Result<usize, HeapError> {
        let max = self.max_alloc_size();

        if size == 0 || size > max {
            return Err(HeapError::InvalidSize { size, max });
        }
        Ok(round_to_slot(size))
    }

    pub(crate) fn placement(&self, size: usize) -> Placement {
        Placement::for_slots(size / SLOT_SIZE, self.large_block_threshold)
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}
