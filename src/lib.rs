
mod common;
mod cache_line;
pub mod bits;
mod page;
mod page_cache;
mod registry;
mod hint;
mod config;
mod error;
mod vm;
mod heap;

pub use {
    common::{round_to_slot, MAX_SLOTS, PAGE_CAPACITY, SLOT_SIZE},
    page::{Page, PageState, PageStats, Placement},
    page_cache::PageCache,
    registry::RegionId,
    config::HeapConfig,
    error::HeapError,
    vm::{SystemMemory, VirtualMemory},
    self::heap::{Heap, HeapDebugInfo, HeapStats, PageInfo},
};
