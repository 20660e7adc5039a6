use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering::*};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::cache_line::CacheAligned;
use crate::common::PAGE_CAPACITY;
use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::hint::{self, Hint};
use crate::page::{Page, PageState, PageStats, Placement};
use crate::page_cache::PageCache;
use crate::registry::{RegionId, Registry};
use crate::vm::{SystemMemory, VirtualMemory};

/// Distinguishes the hints of different heaps in the thread-local cache.
/// Never reused.
static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// A concurrent heap handing out runs of slots from bitmap pages.
///
/// Allocations are multiple of [`SLOT_SIZE`](crate::SLOT_SIZE) and at most
/// [`HeapConfig::max_alloc_size`]. Pages are committed on demand and given
/// back to the system by the garbage collector once empty.
///
/// Locking happens at two levels:
/// - a reader/writer lock guards which pages exist. Allocating, freeing
///   and resizing only take it for reading.
/// - inside a page, slots are taken and released with compare-and-swap.
///
/// Committing a page and collecting empty ones take the lock for writing.
///
/// ## Example
///
/// ```
/// use bitmap_heap::{Heap, SLOT_SIZE};
///
/// let heap = Heap::new();
///
/// let ptr = heap.allocate(3 * SLOT_SIZE).unwrap();
/// assert_eq!(heap.allocation_size(ptr), 3 * SLOT_SIZE);
///
/// unsafe { heap.free(ptr) };
/// assert_eq!(heap.force_garbage_collect(), 1);
/// ```
pub struct Heap<V: VirtualMemory = SystemMemory> {
    id: u64,
    config: HeapConfig,
    vm: V,
    page_cache: Arc<PageCache>,
    registry: RwLock<Registry>,
    /// Pages seen empty by `free`, linked with `Page::next_free`.
    /// Still owned by the registry.
    free_list: CacheAligned<AtomicPtr<Page>>,
    queued: AtomicUsize,
    /// Incremented each time a page is collected
    revision: CacheAligned<AtomicU64>,
}

/// Snapshot of one page
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PageInfo {
    pub region: RegionId,
    pub base: usize,
    pub state: PageState,
    pub stats: PageStats,
}

/// Totals over all the pages of a heap
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub pages: usize,
    pub committed: usize,
    pub available: usize,
    pub used: usize,
    pub allocations: usize,
    /// Largest allocation that can be served without committing a page
    pub largest_free: usize,
}

impl HeapStats {
    fn add(&mut self, stats: &PageStats) {
        self.pages += 1;
        self.committed += stats.capacity;
        self.available += stats.available;
        self.used += stats.used;
        self.allocations += stats.allocations;
        self.largest_free = self.largest_free.max(stats.largest_free);
    }
}

#[derive(Clone, Debug)]
pub struct HeapDebugInfo {
    pub revision: u64,
    /// Pages waiting for the collector
    pub queued: usize,
    pub stats: HeapStats,
    pub pages: Vec<PageInfo>,
}

impl std::fmt::Display for HeapDebugInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Heap {{ pages: {} committed: {} used: {} allocations: {} revision: {} queued: {} }}",
            self.stats.pages,
            self.stats.committed,
            self.stats.used,
            self.stats.allocations,
            self.revision,
            self.queued,
        )?;

        for page in &self.pages {
            writeln!(
                f,
                "  {} {:#x} {:?} used: {} largest_free: {} allocations: {} fragmentation: {:.1}%",
                page.region,
                page.base,
                page.state,
                page.stats.used,
                page.stats.largest_free,
                page.stats.allocations,
                page.stats.fragmentation,
            )?;
        }

        Ok(())
    }
}

fn allocate_in(page: &Page, size: usize, placement: Placement) -> Option<NonNull<u8>> {
    let offset = page.allocate(size, placement)?;
    NonNull::new(page.address_of(offset) as *mut u8)
}

/// First page of `pages` with room for `size`
fn scan<'a>(
    pages: impl Iterator<Item = (RegionId, &'a Page)>,
    size: usize,
    placement: Placement,
) -> Option<(RegionId, NonNull<u8>)> {
    pages
        .filter(|(_, page)| page.largest_contiguous_free() >= size)
        .find_map(|(region, page)| Some((region, allocate_in(page, size, placement)?)))
}

impl Heap<SystemMemory> {
    /// Constructs a heap with the default configuration over the memory of
    /// the operating system.
    ///
    /// No memory is reserved until the first allocation.
    pub fn new() -> Heap<SystemMemory> {
        let config = HeapConfig::default();
        let page_cache = Arc::new(PageCache::with_limit(config.page_cache_limit));

        Heap::from_parts(config, SystemMemory::new(), page_cache)
    }
}

impl Default for Heap<SystemMemory> {
    fn default() -> Heap<SystemMemory> {
        Heap::new()
    }
}

impl<V: VirtualMemory> Heap<V> {
    pub fn with_config(config: HeapConfig, vm: V) -> Result<Heap<V>, HeapError> {
        let page_cache = Arc::new(PageCache::with_limit(config.page_cache_limit));
        Self::with_page_cache(config, vm, page_cache)
    }

    /// Constructs a heap recycling its page control blocks through
    /// `page_cache`, which may be shared with other heaps
    pub fn with_page_cache(
        config: HeapConfig,
        vm: V,
        page_cache: Arc<PageCache>,
    ) -> Result<Heap<V>, HeapError> {
        config.validate()?;
        Ok(Self::from_parts(config, vm, page_cache))
    }

    fn from_parts(config: HeapConfig, vm: V, page_cache: Arc<PageCache>) -> Heap<V> {
        Heap {
            id: NEXT_HEAP_ID.fetch_add(1, Relaxed),
            config,
            vm,
            page_cache,
            registry: RwLock::new(Registry::new()),
            free_list: CacheAligned::new(AtomicPtr::new(std::ptr::null_mut())),
            queued: AtomicUsize::new(0),
            revision: CacheAligned::new(AtomicU64::new(0)),
        }
    }

    /// Allocates `size` bytes, rounded up to a multiple of `SLOT_SIZE`.
    ///
    /// The memory is aligned to `SLOT_SIZE`. Its content is unspecified.
    ///
    /// Tries, in order:
    /// - the pages this thread allocated from recently
    /// - every page of the heap
    /// - a newly committed page
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let size = self.config.round_size(size)?;
        let placement = self.config.placement(size);

        {
            let registry = self.registry.read();
            let revision = self.revision.load(Acquire);

            if let Some(ptr) = self.allocate_hinted(&registry, revision, size, placement) {
                return Ok(ptr);
            }

            let found = match placement {
                Placement::Low => scan(registry.iter(), size, placement),
                Placement::High => scan(registry.iter().rev(), size, placement),
            };

            if let Some((region, ptr)) = found {
                self.remember(region, revision);
                return Ok(ptr);
            }
        }

        self.allocate_slow(size, placement)
    }

    fn allocate_hinted(
        &self,
        registry: &Registry,
        revision: u64,
        size: usize,
        placement: Placement,
    ) -> Option<NonNull<u8>> {
        let (region, page) = hint::with_hints(|hints| {
            let candidates = hints
                .valid(self.id, revision)
                .filter_map(|region| Some((region, registry.get(region)?)))
                .filter(|(_, page)| page.largest_contiguous_free() >= size);

            // Same bias as the placement inside a page
            match placement {
                Placement::Low => candidates.min_by_key(|(_, page)| page.base()),
                Placement::High => candidates.max_by_key(|(_, page)| page.base()),
            }
        })
        .flatten()?;

        let ptr = allocate_in(page, size, placement)?;
        self.remember(region, revision);

        Some(ptr)
    }

    fn allocate_slow(&self, size: usize, placement: Placement) -> Result<NonNull<u8>, HeapError> {
        trace!(size, "heap: no page with room, taking the write lock");

        let mut registry = self.registry.write();
        let revision = self.revision.load(Acquire);

        // Another thread might have committed a page while we were waiting
        // for the lock
        let found = match placement {
            Placement::Low => scan(registry.iter(), size, placement),
            Placement::High => scan(registry.iter().rev(), size, placement),
        };

        let (region, ptr) = match found {
            Some(found) => found,
            None => {
                let region = self.commit_page(&mut registry, size)?;
                let ptr = registry
                    .get(region)
                    .and_then(|page| allocate_in(page, size, placement))
                    .ok_or(HeapError::OutOfMemory { requested: size })?;
                (region, ptr)
            }
        };

        self.remember(region, revision);
        Ok(ptr)
    }

    /// Reserves and commits a new region, and registers its page
    fn commit_page(&self, registry: &mut Registry, size: usize) -> Result<RegionId, HeapError> {
        let memory = match self.vm.reserve(PAGE_CAPACITY) {
            Some(memory) => memory,
            None => {
                warn!(size, pages = registry.len(), "heap: cannot reserve a region");
                return Err(HeapError::OutOfMemory { requested: size });
            }
        };

        if !unsafe { self.vm.commit(memory, PAGE_CAPACITY) } {
            warn!(size, pages = registry.len(), "heap: cannot commit a region");
            unsafe { self.vm.release(memory, PAGE_CAPACITY) };
            return Err(HeapError::OutOfMemory { requested: size });
        }

        let base = memory.as_ptr() as usize;
        let region = registry.insert(self.page_cache.grab_page(base));

        debug!(%region, base, pages = registry.len(), "heap: page committed");

        Ok(region)
    }

    fn remember(&self, region: RegionId, revision: u64) {
        hint::with_hints(|hints| hints.touch(Hint { heap: self.id, region, revision }));
    }

    /// Page owning `addr`. Panics if there is none.
    fn resolve<'a>(&self, registry: &'a Registry, addr: usize) -> &'a Page {
        let revision = self.revision.load(Acquire);

        let hinted = hint::with_hints(|hints| {
            hints
                .valid(self.id, revision)
                .filter_map(|region| registry.get(region))
                .find(|page| page.aliases(addr))
        })
        .flatten();

        match hinted.or_else(|| Some(registry.locate(addr)?.1)) {
            Some(page) => page,
            None => panic!("Heap: {:#x} was not allocated by this heap", addr),
        }
    }

    /// Gives back an allocation.
    ///
    /// When more than `gc_queue_threshold` pages are waiting to be
    /// collected, tries to collect them without blocking.
    ///
    /// # Panics
    /// If `ptr` is not the start of a live allocation of this heap.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this heap and
    /// must not be used afterward.
    ///
    /// A pointer inside an allocation that falls on a slot boundary is not
    /// detected: it frees the tail of that allocation and corrupts the
    /// length of its head.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;

        let queued = {
            let registry = self.registry.read();
            let page = self.resolve(&registry, addr);

            if !page.free(page.offset_of(addr)) {
                return;
            }

            self.push_empty(page)
        };

        if queued > self.config.gc_queue_threshold {
            self.garbage_collect();
        }
    }

    /// Pushes `page` on the list of empty pages, unless it's already
    /// there. Returns the number of pages in the list.
    fn push_empty(&self, page: &Page) -> usize {
        if page.in_free_list.swap(true, AcqRel) {
            return self.queued.load(Relaxed);
        }

        let page_ptr = page as *const Page as *mut Page;
        let mut current = self.free_list.load(Relaxed);

        loop {
            page.next_free.store(current, Relaxed);

            match self.free_list.compare_exchange_weak(current, page_ptr, AcqRel, Relaxed) {
                Ok(_) => break,
                Err(head) => current = head,
            }
        }

        self.queued.fetch_add(1, AcqRel) + 1
    }

    /// Grows or shrinks an allocation without moving it.
    ///
    /// Returns false, leaving the allocation untouched, when it can't be
    /// done in place or when `new_size` is not a valid allocation size.
    /// The caller can then allocate, copy and free.
    ///
    /// # Panics
    /// If `ptr` is not the start of a live allocation of this heap.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this heap.
    /// When shrinking, memory past `new_size` must not be used anymore.
    pub unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> bool {
        let new_size = match self.config.round_size(new_size) {
            Ok(size) => size,
            Err(_) => return false,
        };

        let addr = ptr.as_ptr() as usize;
        let registry = self.registry.read();
        let page = self.resolve(&registry, addr);

        page.resize(page.offset_of(addr), new_size).is_some()
    }

    /// Size of the allocation at `ptr`, a multiple of `SLOT_SIZE`
    ///
    /// # Panics
    /// If `ptr` is not the start of a live allocation of this heap.
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        let registry = self.registry.read();

        self.resolve(&registry, addr).region_size(addr)
    }

    /// Returns true if `ptr` is inside a region of this heap
    pub fn aliases(&self, ptr: *const u8) -> bool {
        self.registry.read().locate(ptr as usize).is_some()
    }

    /// Collects the empty pages, only if the heap is not locked.
    ///
    /// Returns the number of pages collected, or None if another thread
    /// holds the lock.
    pub fn garbage_collect(&self) -> Option<usize> {
        match self.registry.try_write() {
            Some(mut registry) => Some(self.sweep(&mut registry)),
            None => {
                trace!("heap: collection skipped, the heap is busy");
                None
            }
        }
    }

    /// Collects the empty pages, waiting for the lock if needed.
    ///
    /// Returns the number of pages collected.
    pub fn force_garbage_collect(&self) -> usize {
        let mut registry = self.registry.write();
        self.sweep(&mut registry)
    }

    /// With the write lock held, no thread is in the middle of an
    /// allocation: a page seen empty stays empty until we release it.
    fn sweep(&self, registry: &mut Registry) -> usize {
        let mut next = self.free_list.swap(std::ptr::null_mut(), AcqRel);
        self.queued.store(0, Relaxed);

        // Pages on the list are all in the registry, they were pushed
        // under the read lock
        while let Some(page) = unsafe { next.as_ref() } {
            next = page.next_free.swap(std::ptr::null_mut(), Relaxed);
            page.in_free_list.store(false, Release);
        }

        // Pages that became empty without going through the list are
        // collected as well
        let empty: Vec<RegionId> = registry
            .iter()
            .filter(|(_, page)| page.is_empty())
            .map(|(region, _)| region)
            .collect();

        for &region in &empty {
            if let Some(page) = registry.remove(region) {
                debug!(%region, base = page.base(), "heap: page collected");

                self.release_page(page);
                self.revision.fetch_add(1, Release);
            }
        }

        debug!(
            collected = empty.len(),
            pages = registry.len(),
            revision = self.revision.load(Relaxed),
            "heap: sweep done"
        );

        empty.len()
    }

    fn release_page(&self, page: Box<Page>) {
        if let Some(memory) = NonNull::new(page.base() as *mut u8) {
            unsafe {
                self.vm.decommit(memory, PAGE_CAPACITY);
                self.vm.release(memory, PAGE_CAPACITY);
            }
        }

        self.page_cache.release_page(page);
    }

    /// Calls `visitor` for each page, in address order.
    ///
    /// The registry stays locked for reading while `visitor` runs. Calling
    /// back into the same heap from `visitor` may deadlock behind a thread
    /// waiting for the write lock.
    pub fn each_page<F>(&self, mut visitor: F)
    where
        F: FnMut(&PageInfo),
    {
        let registry = self.registry.read();

        for (region, page) in registry.iter() {
            visitor(&PageInfo {
                region,
                base: page.base(),
                state: page.state(),
                stats: page.stats(),
            });
        }
    }

    pub fn memory_stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();
        self.each_page(|page| stats.add(&page.stats));
        stats
    }

    pub fn debug_info(&self) -> HeapDebugInfo {
        let mut pages = Vec::new();
        let mut stats = HeapStats::default();

        self.each_page(|page| {
            stats.add(&page.stats);
            pages.push(*page);
        });

        HeapDebugInfo {
            revision: self.revision(),
            queued: self.queued.load(Relaxed),
            stats,
            pages,
        }
    }

    /// Checks every page under the write lock.
    ///
    /// # Panics
    /// If a page is inconsistent or more bytes are used than committed.
    pub fn audit(&self) -> HeapStats {
        let registry = self.registry.write();
        let mut stats = HeapStats::default();

        for (region, page) in registry.iter() {
            assert!(page.check_invariants(), "Heap: page {} is corrupted: {:?}", region, page);
            stats.add(&page.stats());
        }

        assert!(
            stats.used <= stats.committed,
            "Heap: {} bytes used for {} bytes committed", stats.used, stats.committed
        );
        assert_eq!(stats.pages, registry.len());

        stats
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Acquire)
    }

    pub fn page_count(&self) -> usize {
        self.registry.read().len()
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn vm(&self) -> &V {
        &self.vm
    }

    pub fn page_cache(&self) -> &Arc<PageCache> {
        &self.page_cache
    }
}

impl<V: VirtualMemory> Drop for Heap<V> {
    fn drop(&mut self) {
        let pages: Vec<Box<Page>> = self.registry.get_mut().drain().collect();

        for page in pages {
            self.release_page(page);
        }

        let id = self.id;
        hint::with_hints(|hints| hints.forget(id));
    }
}

impl<V: VirtualMemory> std::fmt::Debug for Heap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let stats = self.memory_stats();

        f.debug_struct("Heap")
         .field("id", &self.id)
         .field("pages", &stats.pages)
         .field("used", &stats.used)
         .field("available", &stats.available)
         .field("revision", &self.revision())
         .field("queued", &self.queued.load(Relaxed))
         .finish()
    }
}
