//! Per-thread cache of the pages a thread allocated from recently.
//!
//! A hint is never trusted blindly. It records the heap revision at the
//! time it was made, and the revision changes whenever a page is
//! collected. A hint with an old revision is skipped, one with the current
//! revision names a page that is still in the registry. A stale hint only
//! costs a registry lookup.
//!
//! Dropping a heap only forgets the hints of the dropping thread. Other
//! threads keep entries for the dead heap until they are evicted. Heap ids
//! are never reused, so such an entry never matches again.

use std::cell::RefCell;

use crate::registry::RegionId;

pub(crate) const HINT_SLOTS: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Hint {
    pub heap: u64,
    pub region: RegionId,
    pub revision: u64,
}

/// Most recently used first
#[derive(Debug, Default)]
pub(crate) struct HintCache {
    entries: [Option<Hint>; HINT_SLOTS],
}

impl HintCache {
    pub fn new() -> HintCache {
        HintCache::default()
    }

    /// Moves `hint` in front, evicting the least recently used entry
    pub fn touch(&mut self, hint: Hint) {
        let position = self.entries
            .iter()
            .position(|entry| {
                entry.map_or(false, |e| e.heap == hint.heap && e.region == hint.region)
            })
            .unwrap_or(HINT_SLOTS - 1);

        self.entries[..=position].rotate_right(1);
        self.entries[0] = Some(hint);
    }

    /// Regions hinted for `heap` that are still valid at `revision`
    pub fn valid(&self, heap: u64, revision: u64) -> impl Iterator<Item = RegionId> + '_ {
        self.entries
            .iter()
            .flatten()
            .filter(move |hint| hint.heap == heap && hint.revision == revision)
            .map(|hint| hint.region)
    }

    /// Drops every hint of `heap`
    pub fn forget(&mut self, heap: u64) {
        for entry in self.entries.iter_mut() {
            if entry.map_or(false, |e| e.heap == heap) {
                *entry = None;
            }
        }
    }
}

thread_local! {
    static HINTS: RefCell<HintCache> = RefCell::new(HintCache::new());
}

/// Runs `fun` with the hint cache of the current thread.
///
/// Returns None when the thread-local storage is already destroyed
/// (allocation from a thread-local destructor) or when called
/// reentrantly.
pub(crate) fn with_hints<R>(fun: impl FnOnce(&mut HintCache) -> R) -> Option<R> {
    HINTS
        .try_with(|hints| {
            let mut hints = hints.try_borrow_mut().ok()?;
            Some(fun(&mut hints))
        })
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(n: usize) -> RegionId {
        RegionId::new(n as u32)
    }

    fn hint(heap: u64, n: usize, revision: u64) -> Hint {
        Hint { heap, region: region(n), revision }
    }

    #[test]
    fn most_recent_first() {
        let mut cache = HintCache::new();

        for n in 0..6 {
            cache.touch(hint(1, n, 0));
        }

        let regions: Vec<_> = cache.valid(1, 0).map(|r| r.index()).collect();
        assert_eq!(regions, vec![5, 4, 3, 2]);

        // Touching an entry moves it in front without evicting
        cache.touch(hint(1, 3, 0));
        let regions: Vec<_> = cache.valid(1, 0).map(|r| r.index()).collect();
        assert_eq!(regions, vec![3, 5, 4, 2]);
    }

    #[test]
    fn stale_revision_and_other_heap() {
        let mut cache = HintCache::new();

        cache.touch(hint(1, 0, 7));
        cache.touch(hint(1, 1, 8));
        cache.touch(hint(2, 2, 8));

        let regions: Vec<_> = cache.valid(1, 8).map(|r| r.index()).collect();
        assert_eq!(regions, vec![1]);

        // A newer hint for the same region replaces the stale one
        cache.touch(hint(1, 0, 8));
        let regions: Vec<_> = cache.valid(1, 8).map(|r| r.index()).collect();
        assert_eq!(regions, vec![0, 1]);

        cache.forget(1);
        assert_eq!(cache.valid(1, 8).count(), 0);
        assert_eq!(cache.valid(2, 8).count(), 1);
    }

    #[test]
    fn thread_local_cache() {
        with_hints(|hints| hints.touch(hint(42, 1, 0))).unwrap();

        let seen = with_hints(|hints| hints.valid(42, 0).count()).unwrap();
        assert_eq!(seen, 1);

        let other = std::thread::spawn(|| with_hints(|hints| hints.valid(42, 0).count()))
            .join()
            .unwrap();
        assert_eq!(other, Some(0));
    }
}
