//! The per-mount registry of cached inodes and the evictor that keeps it within budget.

use crate::{inode::Inode, metrics::Metrics, Config, FileId};
use std::{
    collections::{BTreeMap, HashMap},
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, trace};

/// Every cached inode, the order in which they were last used, and the number of pages they hold.
///
/// # Lock ordering
///
/// The table lock may be held while briefly taking an inode lock, never the other way around.
/// Operations that mutate an inode's pages release the inode lock before updating the table's
/// accounting (see [Table::charge] and [Table::uncharge]).
pub(crate) struct Table {
    page_size: u64,
    page_budget: usize,
    low_watermark: usize,

    index: Mutex<Index>,

    /// Set while an eviction pass is running.
    pruning: AtomicBool,

    /// Set when an eviction pass is requested, cleared when one starts. A pass that finds it set
    /// on completion runs again, so requests made while it was running are not lost.
    requested: AtomicBool,

    metrics: Metrics,
}

#[derive(Default)]
struct Index {
    inodes: HashMap<FileId, Entry>,

    /// File ids ordered from least to most recently used, keyed by each entry's stamp.
    lru: BTreeMap<u64, FileId>,

    next_stamp: u64,

    /// The number of pages held across all inodes.
    ///
    /// # Invariants
    ///
    /// Equal to the sum of the page counts of all inodes, except for pages created but not yet
    /// charged by an in-flight dispatch.
    pages_used: usize,
}

struct Entry {
    inode: Arc<Inode>,
    stamp: u64,
}

/// A counted reference to an [Inode], held for the duration of one operation.
///
/// The inode cannot be removed from its table while any handle to it exists.
pub(crate) struct Handle<'a> {
    table: &'a Table,
    inode: Arc<Inode>,
}

impl Deref for Handle<'_> {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.inode
    }
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        if self.inode.put() == 0 && self.inode.is_released() {
            self.table.remove(&self.inode, false);
        }
    }
}

impl Table {
    /// Create an empty table.
    ///
    /// # Panics
    ///
    /// Panics if the page size is not a power of two or the low watermark exceeds the page budget.
    pub(crate) fn new(config: &Config, metrics: Metrics) -> Self {
        assert!(
            config.page_size.is_power_of_two(),
            "page size must be a power of two"
        );
        assert!(
            config.low_watermark <= config.page_budget.get(),
            "low watermark must not exceed the page budget"
        );
        Self {
            page_size: config.page_size.get() as u64,
            page_budget: config.page_budget.get(),
            low_watermark: config.low_watermark,
            index: Mutex::new(Index::default()),
            pruning: AtomicBool::new(false),
            requested: AtomicBool::new(false),
            metrics,
        }
    }

    pub(crate) const fn page_size(&self) -> u64 {
        self.page_size
    }

    pub(crate) const fn page_budget(&self) -> usize {
        self.page_budget
    }

    pub(crate) const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn pages_used(&self) -> usize {
        self.index.lock().unwrap().pages_used
    }

    /// Return a handle to the inode of `file`, creating it if necessary, and mark it as the most
    /// recently used inode.
    pub(crate) fn acquire(&self, file: FileId) -> Handle<'_> {
        let mut index = self.index.lock().unwrap();
        let stamp = index.next_stamp;
        index.next_stamp += 1;

        let Index { inodes, lru, .. } = &mut *index;
        let entry = inodes.entry(file).or_insert_with(|| {
            trace!(file, "created inode");
            Entry {
                inode: Arc::new(Inode::new(file, self.page_size)),
                stamp,
            }
        });
        lru.remove(&entry.stamp);
        entry.stamp = stamp;
        lru.insert(stamp, file);

        // Taken under the table lock so a concurrent removal cannot observe zero references.
        entry.inode.acquire();
        Handle {
            table: self,
            inode: entry.inode.clone(),
        }
    }

    /// Return the inode of `file` without creating it or affecting its recency.
    pub(crate) fn lookup(&self, file: FileId) -> Option<Arc<Inode>> {
        let index = self.index.lock().unwrap();
        index.inodes.get(&file).map(|entry| entry.inode.clone())
    }

    /// Account for `pages` newly created pages, running an eviction pass if the budget is exceeded.
    pub(crate) fn charge(&self, pages: usize) {
        let over_budget = {
            let mut index = self.index.lock().unwrap();
            index.pages_used += pages;
            self.metrics.pages.set(index.pages_used as i64);
            index.pages_used > self.page_budget
        };
        if over_budget {
            self.prune();
        }
    }

    /// Account for `pages` destroyed pages.
    pub(crate) fn uncharge(&self, pages: usize) {
        if pages == 0 {
            return;
        }
        let mut index = self.index.lock().unwrap();
        debug_assert!(index.pages_used >= pages, "page accounting underflow");
        index.pages_used = index.pages_used.saturating_sub(pages);
        self.metrics.pages.set(index.pages_used as i64);
    }

    /// Run eviction passes, destroying pages without waiters (oldest inode first, oldest page
    /// first within each inode) until at most the low watermark remains. Pages of inodes no
    /// operation is using are destroyed even if they have waiters, and idle inodes left without
    /// pages are removed. Returns the number of pages destroyed.
    ///
    /// If a pass is already running on another thread, returns 0 immediately and leaves that
    /// thread to run another pass once it is done.
    pub(crate) fn prune(&self) -> usize {
        self.requested.store(true, Ordering::SeqCst);
        let mut evicted = 0;
        while self.requested.load(Ordering::SeqCst) {
            if self.pruning.swap(true, Ordering::SeqCst) {
                break;
            }
            while self.requested.swap(false, Ordering::SeqCst) {
                evicted += self.evict();
            }
            self.pruning.store(false, Ordering::SeqCst);
        }
        evicted
    }

    /// Run a single eviction pass down to the low watermark.
    fn evict(&self) -> usize {
        let (mut excess, inodes) = {
            let index = self.index.lock().unwrap();
            let excess = index.pages_used.saturating_sub(self.low_watermark);
            let inodes: Vec<Arc<Inode>> = index
                .lru
                .values()
                .filter_map(|file| index.inodes.get(file))
                .map(|entry| entry.inode.clone())
                .collect();
            (excess, inodes)
        };

        let mut evicted = 0;
        for inode in inodes {
            if excess == 0 {
                break;
            }
            let (count, empty) = {
                let mut pages = inode.lock();

                // A read takes its reference before locking the inode to join a page, so with the
                // lock held and no references, every waiter belongs to a dropped read.
                let idle = inode.refs() == 0;
                let count = pages.evict(excess, idle);
                (count, pages.is_empty())
            };
            if count > 0 {
                debug!(file = inode.id(), count, "evicted pages");
                self.uncharge(count);
                excess -= count;
                evicted += count;
            }
            if empty && inode.refs() == 0 {
                self.remove(&inode, true);
            }
        }

        self.metrics.evictions.inc_by(evicted as u64);
        evicted
    }

    /// Mark the inode of `file` as released, removing it immediately if no operation is using it.
    /// Returns whether the inode was removed.
    pub(crate) fn release(&self, file: FileId) -> bool {
        let Some(inode) = self.lookup(file) else {
            return false;
        };
        inode.release();
        self.remove(&inode, false)
    }

    /// Remove `inode` from the table if it is still registered and no operation is using it,
    /// dropping (and uncounting) its pages. If `only_empty` is set, inodes with pages are kept.
    fn remove(&self, inode: &Arc<Inode>, only_empty: bool) -> bool {
        let mut index = self.index.lock().unwrap();
        let Some(entry) = index.inodes.get(&inode.id()) else {
            return false;
        };

        // The file may have been released and cached again under the same id.
        if !Arc::ptr_eq(&entry.inode, inode) || inode.refs() > 0 {
            return false;
        }
        let stamp = entry.stamp;
        let pages = {
            let mut pages = inode.lock();
            if only_empty && !pages.is_empty() {
                return false;
            }
            pages.clear()
        };

        index.inodes.remove(&inode.id());
        index.lru.remove(&stamp);
        debug_assert!(index.pages_used >= pages, "page accounting underflow");
        index.pages_used = index.pages_used.saturating_sub(pages);
        self.metrics.pages.set(index.pages_used as i64);
        debug!(file = inode.id(), pages, "removed inode");
        true
    }

    #[cfg(test)]
    pub(crate) fn inodes(&self) -> usize {
        self.index.lock().unwrap().inodes.len()
    }
}
