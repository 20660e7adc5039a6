use std::sync::atomic::{AtomicUsize, Ordering::*};

use parking_lot::Mutex;

use crate::page::Page;

/// Recycles [`Page`] control blocks.
///
/// Only the metadata is pooled, never the memory of a region. A
/// `PageCache` can be shared between heaps with an `Arc`.
pub struct PageCache {
    pool: Mutex<Vec<Box<Page>>>,
    limit: usize,
    constructed: AtomicUsize,
    recycled: AtomicUsize,
}

impl PageCache {
    pub const DEFAULT_LIMIT: usize = 16;

    /// Constructs a cache keeping at most `limit` idle control blocks
    pub fn with_limit(limit: usize) -> PageCache {
        PageCache {
            pool: Mutex::new(Vec::with_capacity(limit)),
            limit,
            constructed: AtomicUsize::new(0),
            recycled: AtomicUsize::new(0),
        }
    }

    pub fn new() -> PageCache {
        PageCache::with_limit(Self::DEFAULT_LIMIT)
    }

    /// Returns a control block managing the region at `base`, taken from
    /// the pool when one is idle
    pub fn grab_page(&self, base: usize) -> Box<Page> {
        let recycled = self.pool.lock().pop();

        match recycled {
            Some(mut page) => {
                self.recycled.fetch_add(1, Relaxed);
                page.reset(base);
                page
            }
            None => {
                self.constructed.fetch_add(1, Relaxed);
                Box::new(Page::new(base))
            }
        }
    }

    /// Gives back a control block. Its region must already be released.
    pub fn release_page(&self, page: Box<Page>) {
        let mut pool = self.pool.lock();

        if pool.len() < self.limit {
            pool.push(page);
        }
    }

    /// Number of idle control blocks
    pub fn idle(&self) -> usize {
        self.pool.lock().len()
    }

    /// Returns the number of control blocks built and recycled so far
    pub fn stats(&self) -> (usize, usize) {
        (self.constructed.load(Relaxed), self.recycled.load(Relaxed))
    }
}

impl Default for PageCache {
    fn default() -> PageCache {
        PageCache::new()
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let (constructed, recycled) = self.stats();

        f.debug_struct("PageCache")
         .field("idle", &self.idle())
         .field("limit", &self.limit)
         .field("constructed", &constructed)
         .field("recycled", &recycled)
         .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::PageCache;
    use crate::common::{PAGE_CAPACITY, SLOT_SIZE};
    use crate::page::Placement;

    #[test]
    fn recycle_control_blocks() {
        let cache = PageCache::with_limit(2);

        let a = cache.grab_page(PAGE_CAPACITY);
        let b = cache.grab_page(2 * PAGE_CAPACITY);
        let c = cache.grab_page(3 * PAGE_CAPACITY);
        assert_eq!(cache.stats(), (3, 0));

        a.allocate(SLOT_SIZE, Placement::Low).unwrap();
        let a_ptr = &*a as *const _;

        cache.release_page(a);
        cache.release_page(b);
        cache.release_page(c);
        assert_eq!(cache.idle(), 2);

        let d = cache.grab_page(4 * PAGE_CAPACITY);
        let e = cache.grab_page(5 * PAGE_CAPACITY);
        assert_eq!(cache.stats(), (3, 2));
        assert_eq!(cache.idle(), 0);

        // The recycled block is reinitialized
        let recycled = if &*d as *const _ == a_ptr { &d } else { &e };
        assert!(recycled.is_empty());
        assert!(d.base() == 4 * PAGE_CAPACITY && e.base() == 5 * PAGE_CAPACITY);
    }
}
