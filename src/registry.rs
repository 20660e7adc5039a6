use std::collections::BTreeMap;

use crate::common::region_base;
use crate::page::Page;

/// Index of a page in the registry.
///
/// Indexes are reused once a page is collected: a `RegionId` alone does
/// not prove that the page is the same one, pair it with the heap
/// revision.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u32);

impl RegionId {
    pub(crate) const fn new(index: u32) -> RegionId {
        RegionId(index)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Committed pages of a heap, by id and by base address.
///
/// Pages are boxed so their address doesn't change while the registry
/// grows: the list of empty pages links them by pointer.
#[derive(Default)]
pub(crate) struct Registry {
    pages: Vec<Option<Box<Page>>>,
    by_base: BTreeMap<usize, RegionId>,
    vacant: Vec<RegionId>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn len(&self) -> usize {
        self.by_base.len()
    }

    #[inline]
    pub fn get(&self, id: RegionId) -> Option<&Page> {
        self.pages.get(id.index())?.as_deref()
    }

    pub fn insert(&mut self, page: Box<Page>) -> RegionId {
        let base = page.base();

        let id = match self.vacant.pop() {
            Some(id) => {
                debug_assert!(self.pages[id.index()].is_none());
                self.pages[id.index()] = Some(page);
                id
            }
            None => {
                let id = RegionId::new(self.pages.len() as u32);
                self.pages.push(Some(page));
                id
            }
        };

        let previous = self.by_base.insert(base, id);
        assert!(previous.is_none(), "Registry: region {:#x} registered twice", base);

        id
    }

    pub fn remove(&mut self, id: RegionId) -> Option<Box<Page>> {
        let page = self.pages.get_mut(id.index())?.take()?;

        self.by_base.remove(&page.base());
        self.vacant.push(id);

        Some(page)
    }

    /// Finds the page whose region contains `addr`.
    ///
    /// Regions are aligned to their capacity, masking the address gives
    /// the base of its region.
    pub fn locate(&self, addr: usize) -> Option<(RegionId, &Page)> {
        let id = *self.by_base.get(&region_base(addr))?;
        let page = self.get(id)?;

        debug_assert!(page.aliases(addr));

        Some((id, page))
    }

    /// Pages in ascending address order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (RegionId, &Page)> + '_ {
        self.by_base.values().filter_map(move |&id| Some((id, self.get(id)?)))
    }

    /// Removes every page, in no particular order
    pub fn drain(&mut self) -> impl Iterator<Item = Box<Page>> + '_ {
        self.by_base.clear();
        self.vacant.clear();
        self.pages.drain(..).flatten()
    }
}
