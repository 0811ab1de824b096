use crate::{
    page::{Fetch, Page},
    Attributes, FileId,
};
use std::{
    collections::{hash_map::Entry, BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
};

/// The cached pages of one file.
///
/// Reference counted by the operations in flight on it (see [crate::table::Handle]). An inode is
/// only removed from its table once that count drops to zero.
pub(crate) struct Inode {
    id: FileId,

    /// The number of operations currently using this inode.
    ///
    /// Sequentially consistent with `released`, so that of a release racing the last handle being
    /// dropped, at least one observes the other.
    refs: AtomicUsize,

    /// Set once the file has been released; the inode is removed when it becomes idle.
    released: AtomicBool,

    pages: Mutex<Pages>,
}

impl Inode {
    pub(crate) fn new(id: FileId, page_size: u64) -> Self {
        Self {
            id,
            refs: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            pages: Mutex::new(Pages::new(page_size)),
        }
    }

    pub(crate) const fn id(&self) -> FileId {
        self.id
    }

    /// Lock the inode's pages, page LRU and cached stat.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Pages> {
        self.pages.lock().unwrap()
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference, returning the number remaining.
    pub(crate) fn put(&self) -> usize {
        let previous = self.refs.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "inode reference count underflow");
        previous - 1
    }

    pub(crate) fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// The state guarded by an [Inode]'s lock.
pub(crate) struct Pages {
    page_size: u64,

    /// Cached pages keyed by their page-aligned offset.
    pages: HashMap<u64, Page>,

    /// Page offsets ordered from least to most recently used, keyed by each page's stamp.
    lru: BTreeMap<u64, u64>,

    /// Source of LRU stamps and fault ids, both unique within the inode.
    next_stamp: u64,

    /// The attributes reported by the most recent fetch or revalidation.
    stat: Option<Attributes>,
}

impl Pages {
    fn new(page_size: u64) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            page_size,
            pages: HashMap::new(),
            lru: BTreeMap::new(),
            next_stamp: 0,
            stat: None,
        }
    }

    /// Round `offset` down to the start of its page.
    pub(crate) const fn align(&self, offset: u64) -> u64 {
        offset & !(self.page_size - 1)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Return the page containing `offset`, if cached.
    pub(crate) fn get(&self, offset: u64) -> Option<&Page> {
        self.pages.get(&self.align(offset))
    }

    pub(crate) fn get_mut(&mut self, offset: u64) -> Option<&mut Page> {
        let offset = self.align(offset);
        self.pages.get_mut(&offset)
    }

    fn stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    /// Return the page containing `offset`, creating it as the most recently used page with the
    /// fetch returned by `fetch` if it is missing. Also returns whether the page was created.
    pub(crate) fn get_or_create(
        &mut self,
        offset: u64,
        fetch: impl FnOnce() -> Fetch,
    ) -> (&mut Page, bool) {
        let offset = self.align(offset);
        let stamp = self.stamp();
        match self.pages.entry(offset) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
                self.lru.insert(stamp, offset);
                (entry.insert(Page::new(offset, stamp, stamp, fetch())), true)
            }
        }
    }

    /// Move the page containing `offset` to the most recently used position.
    pub(crate) fn touch(&mut self, offset: u64) {
        let offset = self.align(offset);
        let stamp = self.stamp();
        let Some(page) = self.pages.get_mut(&offset) else {
            return;
        };
        self.lru.remove(&page.stamp());
        page.set_stamp(stamp);
        self.lru.insert(stamp, offset);
    }

    /// Remove the page containing `offset`, regardless of its waiters.
    pub(crate) fn remove(&mut self, offset: u64) -> Option<Page> {
        let page = self.pages.remove(&self.align(offset))?;
        self.lru.remove(&page.stamp());
        Some(page)
    }

    /// Destroy up to `limit` pages, least recently used first, returning the number destroyed.
    ///
    /// Pages with waiters are kept unless the inode is `idle`: with no operation using the inode,
    /// every waiter belongs to a read that was dropped.
    pub(crate) fn evict(&mut self, limit: usize, idle: bool) -> usize {
        let victims: Vec<u64> = self
            .lru
            .values()
            .filter(|offset| idle || !self.pages[*offset].has_waiters())
            .take(limit)
            .copied()
            .collect();
        for offset in &victims {
            self.remove(*offset);
        }
        victims.len()
    }

    /// Destroy every page without waiters, except the one at `keep`. Returns the number of pages
    /// destroyed.
    pub(crate) fn invalidate(&mut self, keep: Option<u64>) -> usize {
        let victims: Vec<u64> = self
            .pages
            .values()
            .filter(|page| !page.has_waiters() && Some(page.offset()) != keep)
            .map(Page::offset)
            .collect();
        for offset in &victims {
            self.remove(*offset);
        }
        victims.len()
    }

    /// Destroy every page. Only valid once no operation is using the inode.
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.pages.len();
        self.pages.clear();
        self.lru.clear();
        count
    }

    pub(crate) const fn stat(&self) -> Option<Attributes> {
        self.stat
    }

    pub(crate) fn forget_stat(&mut self) {
        self.stat = None;
    }

    /// Record fresh attributes, returning whether they differ from the previously cached ones.
    pub(crate) fn refresh(&mut self, attributes: Attributes) -> bool {
        let stale = matches!(self.stat, Some(previous) if previous != attributes);
        self.stat = Some(attributes);
        stale
    }

    /// Offsets of cached pages from least to most recently used.
    #[cfg(test)]
    pub(crate) fn lru_order(&self) -> Vec<u64> {
        self.lru.values().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn is_ready(&self, offset: u64) -> bool {
        self.get(offset).is_some_and(|page| page.data().is_some())
    }
}
