use crate::{
    assembler::{Reply, Request},
    fault::{self, Fault},
    inode::Inode,
    metrics::Metrics,
    table::Table,
    Attributes, Backend, Config, Error, FileId,
};
use bytes::Bytes;
use futures::future::join_all;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::{debug, trace};

/// A page cache for reads of files served by a [Backend].
///
/// One [Cache] is created per mount and shared by reference between every operation on it.
pub struct Cache<B: Backend> {
    backend: Arc<B>,
    table: Table,
}

impl<B: Backend> Cache<B> {
    /// Create an empty cache in front of `backend`, registering its metrics with `registry`.
    ///
    /// # Panics
    ///
    /// Panics if [Config::page_size] is not a power of two, or if [Config::low_watermark] exceeds
    /// [Config::page_budget].
    pub fn new(registry: &mut Registry, backend: B, config: Config) -> Self {
        let metrics = Metrics::init(registry.sub_registry_with_prefix("cache"));
        Self {
            backend: Arc::new(backend),
            table: Table::new(&config, metrics),
        }
    }

    /// The backend pages are fetched from.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The size of each page in bytes.
    pub fn page_size(&self) -> usize {
        self.table.page_size() as usize
    }

    /// The maximum number of pages kept after an eviction pass.
    pub fn page_budget(&self) -> usize {
        self.table.page_budget()
    }

    /// The number of pages currently held.
    pub fn pages_used(&self) -> usize {
        self.table.pages_used()
    }

    /// Read up to `len` bytes of `file` starting at `offset`.
    ///
    /// Pages already in memory are used as is. Missing pages are fetched from the backend, with
    /// concurrent reads of the same page sharing a single fetch that any of them can complete, so
    /// dropping one read never fails the others. The reply is shorter than `len`
    /// only if the file ends within the range. If any page fails, the read fails with the first
    /// error observed and no bytes are returned.
    pub async fn read(&self, file: FileId, offset: u64, len: usize) -> Result<Reply, Error> {
        if len == 0 {
            return Ok(Reply::default());
        }
        let end = offset
            .checked_add(len as u64)
            .ok_or(Error::OffsetOverflow)?;

        let inode = self.table.acquire(file);
        let (request, done) = Request::new(offset, end);
        let faults = self.dispatch(&inode, &request, end);

        // Every page has been looked up, so the request may now complete.
        request.settle();
        drop(request);

        join_all(faults.into_iter().map(Fault::run)).await;
        done.await.unwrap_or(Err(Error::Canceled))
    }

    /// Resolve every page of `[request.offset, end)`: ready pages contribute immediately, while
    /// missing pages are created and waited on along with pages already being fetched. Returns a
    /// fault for each page waited on, for the caller to run.
    fn dispatch<'a>(
        &'a self,
        inode: &'a Inode,
        request: &Arc<Request>,
        end: u64,
    ) -> Vec<Fault<'a>> {
        let file = inode.id();
        let page_size = self.table.page_size();
        let metrics = self.table.metrics();
        let mut ready: Vec<(u64, Bytes)> = Vec::new();
        let mut faults = Vec::new();
        let mut created = 0;
        {
            let mut pages = inode.lock();
            let mut offset = pages.align(request.offset());
            loop {
                let (page, new) = pages.get_or_create(offset, || {
                    fault::fetch(&self.table, &self.backend, file, offset)
                });
                if let Some((id, fetch)) = page.fault() {
                    // The request waits before the page can be seen by an eviction pass.
                    page.wait(request.clone());
                    faults.push(Fault::new(&self.table, inode, offset, id, fetch));
                    if new {
                        created += 1;
                        metrics.misses.inc();
                    } else {
                        trace!(file, offset, "waiting on page");
                        metrics.coalesced.inc();
                    }
                } else if let Some(data) = page.data().cloned() {
                    trace!(file, offset, "page hit");
                    pages.touch(offset);
                    ready.push((offset, data));
                    metrics.hits.inc();
                }

                offset = match offset.checked_add(page_size) {
                    Some(next) if next < end => next,
                    _ => break,
                };
            }
        }

        if created > 0 {
            self.table.charge(created);
        }
        for (offset, data) in ready {
            request.fill(offset, &data);
        }
        faults
    }

    /// Drop every cached page of `file` that no read is waiting on, along with its cached stat.
    /// Returns the number of pages dropped.
    pub fn invalidate(&self, file: FileId) -> usize {
        let Some(inode) = self.table.lookup(file) else {
            return 0;
        };
        let dropped = {
            let mut pages = inode.lock();
            pages.forget_stat();
            pages.invalidate(None)
        };
        self.table.uncharge(dropped);
        self.table.metrics().invalidations.inc_by(dropped as u64);
        debug!(file, dropped, "invalidated file");
        dropped
    }

    /// Compare fresh `attributes` of `file` with the ones last cached, invalidating the file if
    /// they differ. Returns whether the cached pages were still valid.
    pub fn revalidate(&self, file: FileId, attributes: Attributes) -> bool {
        let Some(inode) = self.table.lookup(file) else {
            return true;
        };
        let dropped = {
            let mut pages = inode.lock();
            if !pages.refresh(attributes) {
                return true;
            }
            pages.invalidate(None)
        };
        self.table.uncharge(dropped);
        self.table.metrics().invalidations.inc_by(dropped as u64);
        debug!(file, dropped, "file changed");
        false
    }

    /// The attributes of `file` reported by its most recent fetch or revalidation.
    pub fn cached_stat(&self, file: FileId) -> Option<Attributes> {
        self.table.lookup(file)?.lock().stat()
    }

    /// Whether the page containing `offset` of `file` is in memory and ready.
    pub fn contains(&self, file: FileId, offset: u64) -> bool {
        let Some(inode) = self.table.lookup(file) else {
            return false;
        };
        let pages = inode.lock();
        pages.get(offset).is_some_and(|page| page.data().is_some())
    }

    /// Stop caching `file`: its pages are dropped as soon as no read is using them. Returns whether
    /// they were dropped immediately.
    pub fn release(&self, file: FileId) -> bool {
        self.table.release(file)
    }

    /// Run an eviction pass down to the low watermark, returning the number of pages destroyed.
    pub fn prune(&self) -> usize {
        self.table.prune()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocks::Memory, traced};
    use futures::{executor::block_on, join, poll, task::Poll};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::io::ErrorKind;
    use test_case::test_case;

    const PAGE_SIZE: usize = 4096;
    const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

    /// A file of `len` bytes where each byte depends on its offset.
    fn contents(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn cache(budget: usize) -> (Cache<Memory>, Memory) {
        cache_with(Config::new(NZUsize!(PAGE_SIZE), NZUsize!(budget)))
    }

    fn cache_with(config: Config) -> (Cache<Memory>, Memory) {
        traced();
        let backend = Memory::default();
        let cache = Cache::new(&mut Registry::default(), backend.clone(), config);
        (cache, backend)
    }

    #[test_case(0, 1; "first byte")]
    #[test_case(0, PAGE_SIZE; "one page")]
    #[test_case(100, 200; "within a page")]
    #[test_case(4000, 200; "straddling two pages")]
    #[test_case(1, 3 * PAGE_SIZE; "unaligned across four pages")]
    #[test_case(5 * PAGE_SIZE as u64, 2 * PAGE_SIZE; "past the end of the file")]
    #[test_case(3 * PAGE_SIZE as u64 + 10, 10_000; "into the short last page")]
    #[test_case(20 * PAGE_SIZE as u64, 1; "beyond the end of the file")]
    fn test_read_matches_backend(offset: u64, len: usize) {
        let (cache, backend) = cache(16);
        backend.insert(1, contents(5 * PAGE_SIZE + 123));
        block_on(async {
            let reply = cache.read(1, offset, len).await.unwrap();
            assert_eq!(reply.to_bytes(), backend.contents(1, offset, len));

            // Segments are ordered and contiguous.
            let mut next = offset;
            for segment in reply.segments() {
                assert_eq!(segment.offset, next);
                next += segment.data.len() as u64;
            }
        });
    }

    #[test]
    fn test_random_reads_match_backend() {
        let (cache, backend) = cache(3);
        let file_len = 7 * PAGE_SIZE + 999;
        backend.insert(1, contents(file_len));
        backend.insert(2, contents(2 * PAGE_SIZE));
        backend.set_segment_size(Some(1000));

        let mut rng = StdRng::seed_from_u64(0);
        block_on(async {
            for _ in 0..200 {
                let file = rng.gen_range(1..=2);
                let offset = rng.gen_range(0..file_len as u64 + 100);
                // Spans at most as many pages as the budget, so waited pages never overflow it.
                let len = rng.gen_range(0..2 * PAGE_SIZE);
                let reply = cache.read(file, offset, len).await.unwrap();
                assert_eq!(reply.to_bytes(), backend.contents(file, offset, len));
                assert!(cache.pages_used() <= cache.page_budget());
            }
        });
    }

    #[test]
    fn test_empty_read() {
        let (cache, backend) = cache(4);
        block_on(async {
            let reply = cache.read(1, 0, 0).await.unwrap();
            assert!(reply.is_empty());
            assert_eq!(backend.total_reads(), 0);
        });
    }

    #[test]
    fn test_offset_overflow() {
        let (cache, backend) = cache(4);
        block_on(async {
            let result = cache.read(1, u64::MAX - 10, 100).await;
            assert!(matches!(result, Err(Error::OffsetOverflow)));
            assert_eq!(backend.total_reads(), 0);
        });
    }

    #[test]
    fn test_read_last_page_of_address_space() {
        let (cache, backend) = cache(4);
        backend.insert(1, contents(10));
        block_on(async {
            let offset = u64::MAX - 100;
            let reply = cache.read(1, offset, 100).await.unwrap();
            assert!(reply.is_empty());
            assert_eq!(backend.reads(1, u64::MAX & !(PAGE_SIZE_U64 - 1)), 1);
        });
    }

    #[test]
    fn test_missing_file() {
        let (cache, _backend) = cache(4);
        block_on(async {
            let result = cache.read(9, 0, 10).await;
            let Err(Error::ReadFailed(err)) = result else {
                panic!("unexpected result: {result:?}");
            };
            assert_eq!(err.kind(), ErrorKind::NotFound);
            assert_eq!(cache.pages_used(), 0);
        });
    }

    #[test]
    fn test_second_read_served_from_memory() {
        let (cache, backend) = cache(8);
        backend.insert(1, contents(4 * PAGE_SIZE));
        block_on(async {
            let first = cache.read(1, 1000, 2 * PAGE_SIZE).await.unwrap();
            assert_eq!(backend.total_reads(), 3);

            let second = cache.read(1, 1000, 2 * PAGE_SIZE).await.unwrap();
            assert_eq!(first, second);
            assert_eq!(backend.total_reads(), 3);
            assert_eq!(cache.table.metrics().hits.get(), 3);
            assert_eq!(cache.table.metrics().misses.get(), 3);
        });
    }

    #[test]
    fn test_concurrent_misses_share_fetch() {
        let (cache, backend) = cache(8);
        backend.insert(1, contents(2 * PAGE_SIZE));
        let gate = backend.hold(1, 0);
        block_on(async {
            let mut first = Box::pin(cache.read(1, 0, PAGE_SIZE));
            let mut second = Box::pin(cache.read(1, 100, 200));
            let mut third = Box::pin(cache.read(1, 0, 2 * PAGE_SIZE));
            assert!(matches!(poll!(&mut first), Poll::Pending));
            assert!(matches!(poll!(&mut second), Poll::Pending));
            assert!(matches!(poll!(&mut third), Poll::Pending));

            // Only the first read fetched page 0; the third fetched page 1 on its own.
            assert_eq!(backend.reads(1, 0), 1);
            assert_eq!(backend.reads(1, PAGE_SIZE_U64), 1);
            assert!(cache.contains(1, PAGE_SIZE_U64));
            {
                let inode = cache.table.lookup(1).unwrap();
                assert_eq!(inode.lock().get(0).unwrap().waiters(), 3);
            }

            gate.open();
            let (first, second, third) = join!(first, second, third);
            assert_eq!(first.unwrap().to_bytes(), backend.contents(1, 0, PAGE_SIZE));
            assert_eq!(second.unwrap().to_bytes(), backend.contents(1, 100, 200));
            assert_eq!(
                third.unwrap().to_bytes(),
                backend.contents(1, 0, 2 * PAGE_SIZE)
            );
            assert_eq!(backend.reads(1, 0), 1);
            assert_eq!(cache.table.metrics().coalesced.get(), 2);
        });
    }

    #[test]
    fn test_concurrent_threads_share_fetch() {
        let (cache, backend) = cache(16);
        backend.insert(1, contents(4 * PAGE_SIZE));
        std::thread::scope(|scope| {
            for i in 0..8u64 {
                let cache = &cache;
                scope.spawn(move || {
                    let offset = i * 500;
                    let reply = block_on(cache.read(1, offset, 3 * PAGE_SIZE)).unwrap();
                    assert_eq!(reply.len(), 3 * PAGE_SIZE);
                });
            }
        });
        for page in 0..4 {
            assert_eq!(backend.reads(1, page * PAGE_SIZE_U64), 1);
        }
    }

    #[test]
    fn test_failed_fetch_not_cached() {
        let (cache, backend) = cache(8);
        backend.insert(1, contents(4 * PAGE_SIZE));
        backend.fail(1, 0, 1);
        block_on(async {
            let result = cache.read(1, 0, 2 * PAGE_SIZE).await;
            let Err(Error::ReadFailed(err)) = result else {
                panic!("unexpected result: {result:?}");
            };
            assert_eq!(err.to_string(), "injected failure");
            assert!(!cache.contains(1, 0));

            // The healthy page fetched alongside it is kept.
            assert!(cache.contains(1, PAGE_SIZE_U64));
            assert_eq!(cache.pages_used(), 1);

            let reply = cache.read(1, 0, PAGE_SIZE).await.unwrap();
            assert_eq!(reply.to_bytes(), backend.contents(1, 0, PAGE_SIZE));
            assert_eq!(backend.reads(1, 0), 2);
            assert_eq!(cache.table.metrics().fault_failures.get(), 1);
        });
    }

    #[test]
    fn test_failure_reaches_every_waiter() {
        let (cache, backend) = cache(8);
        backend.insert(1, contents(PAGE_SIZE));
        backend.fail(1, 0, 1);
        let gate = backend.hold(1, 0);
        block_on(async {
            let mut first = Box::pin(cache.read(1, 0, 10));
            let mut second = Box::pin(cache.read(1, 10, 10));
            assert!(matches!(poll!(&mut first), Poll::Pending));
            assert!(matches!(poll!(&mut second), Poll::Pending));

            gate.open();
            let (first, second) = join!(first, second);
            match (first, second) {
                (Err(Error::ReadFailed(a)), Err(Error::ReadFailed(b))) => {
                    assert!(Arc::ptr_eq(&a, &b))
                }
                other => panic!("unexpected results: {other:?}"),
            }
            assert_eq!(backend.reads(1, 0), 1);
        });
    }

    #[test]
    fn test_malformed_fetch() {
        let (cache, backend) = cache(8);
        backend.insert(1, contents(2 * PAGE_SIZE));
        backend.set_overread(7);
        block_on(async {
            let result = cache.read(1, 0, 10).await;
            assert!(matches!(
                result,
                Err(Error::MalformedRead {
                    requested: PAGE_SIZE,
                    received
                }) if received == PAGE_SIZE + 7
            ));
            assert_eq!(cache.pages_used(), 0);
        });
    }

    #[test]
    fn test_eviction_least_recently_used() {
        let (cache, backend) = cache(4);
        backend.insert(1, contents(8 * PAGE_SIZE));
        block_on(async {
            for page in 0..5u64 {
                cache.read(1, page * PAGE_SIZE_U64, PAGE_SIZE).await.unwrap();
            }
        });

        // Evicted down to half the budget, oldest first.
        assert!(cache.pages_used() <= 4);
        assert_eq!(cache.pages_used(), 2);
        assert!(!cache.contains(1, 0));
        assert!(!cache.contains(1, PAGE_SIZE_U64));
        assert!(!cache.contains(1, 2 * PAGE_SIZE_U64));
        assert!(cache.contains(1, 3 * PAGE_SIZE_U64));
        assert!(cache.contains(1, 4 * PAGE_SIZE_U64));
        assert_eq!(cache.table.metrics().evictions.get(), 3);
    }

    #[test]
    fn test_eviction_without_hysteresis() {
        let mut config = Config::new(NZUsize!(PAGE_SIZE), NZUsize!(4));
        config.low_watermark = 4;
        let (cache, backend) = cache_with(config);
        backend.insert(1, contents(8 * PAGE_SIZE));
        block_on(async {
            for page in 0..5u64 {
                cache.read(1, page * PAGE_SIZE_U64, PAGE_SIZE).await.unwrap();
            }
        });

        // Only the least recently used page is evicted.
        assert_eq!(cache.pages_used(), 4);
        assert!(!cache.contains(1, 0));
        for page in 1..5u64 {
            assert!(cache.contains(1, page * PAGE_SIZE_U64));
        }
    }

    #[test]
    fn test_eviction_follows_recency() {
        let mut config = Config::new(NZUsize!(PAGE_SIZE), NZUsize!(3));
        config.low_watermark = 3;
        let (cache, backend) = cache_with(config);
        backend.insert(1, contents(8 * PAGE_SIZE));
        block_on(async {
            for page in 0..3u64 {
                cache.read(1, page * PAGE_SIZE_U64, 1).await.unwrap();
            }

            // Reading page 0 again makes page 1 the least recently used.
            cache.read(1, 0, 1).await.unwrap();
            cache.read(1, 3 * PAGE_SIZE_U64, 1).await.unwrap();
        });
        assert!(cache.contains(1, 0));
        assert!(!cache.contains(1, PAGE_SIZE_U64));
        assert_eq!(backend.reads(1, 0), 1);
    }

    #[test]
    fn test_eviction_spares_waited_page() {
        let mut config = Config::new(NZUsize!(PAGE_SIZE), NZUsize!(2));
        config.low_watermark = 0;
        let (cache, backend) = cache_with(config);
        backend.insert(1, contents(8 * PAGE_SIZE));
        let gate = backend.hold(1, 0);
        block_on(async {
            let mut pending = Box::pin(cache.read(1, 0, PAGE_SIZE));
            assert!(matches!(poll!(&mut pending), Poll::Pending));

            // Fill the cache well past its budget while page 0 is still being fetched.
            for page in 1..5u64 {
                cache.read(1, page * PAGE_SIZE_U64, PAGE_SIZE).await.unwrap();
            }
            cache.prune();
            assert!(cache.pages_used() <= cache.page_budget());
            {
                let inode = cache.table.lookup(1).unwrap();
                let pages = inode.lock();
                let page = pages.get(0).expect("waited page was evicted");
                assert_eq!(page.waiters(), 1);
            }

            gate.open();
            let reply = pending.await.unwrap();
            assert_eq!(reply.to_bytes(), backend.contents(1, 0, PAGE_SIZE));
            assert_eq!(backend.reads(1, 0), 1);
        });
    }

    #[test]
    fn test_eviction_across_files() {
        let (cache, backend) = cache(4);
        for file in 1..=3 {
            backend.insert(file, contents(4 * PAGE_SIZE));
        }
        block_on(async {
            cache.read(1, 0, 2 * PAGE_SIZE).await.unwrap();
            cache.read(2, 0, 2 * PAGE_SIZE).await.unwrap();
            cache.read(3, 0, PAGE_SIZE).await.unwrap();
        });

        // File 1 was the least recently used, so it lost its pages (and its inode) first.
        assert_eq!(cache.pages_used(), 2);
        assert!(cache.table.lookup(1).is_none());
        assert!(!cache.contains(2, 0));
        assert!(cache.contains(2, PAGE_SIZE_U64));
        assert!(cache.contains(3, 0));
    }

    #[test]
    fn test_reply_outlives_eviction() {
        let (cache, backend) = cache(2);
        backend.insert(1, contents(4 * PAGE_SIZE));
        block_on(async {
            let reply = cache.read(1, 0, PAGE_SIZE).await.unwrap();
            cache.invalidate(1);
            assert!(!cache.contains(1, 0));
            assert_eq!(reply.to_bytes(), backend.contents(1, 0, PAGE_SIZE));
        });
    }

    #[test]
    fn test_dropped_reader_leaves_waiters() {
        let (cache, backend) = cache(8);
        backend.insert(1, contents(PAGE_SIZE));
        let gate = backend.hold(1, 0);
        block_on(async {
            let mut first = Box::pin(cache.read(1, 0, 10));
            let mut second = Box::pin(cache.read(1, 0, 10));
            assert!(matches!(poll!(&mut first), Poll::Pending));
            assert!(matches!(poll!(&mut second), Poll::Pending));

            // The read that created the page goes away while its fetch is in flight.
            drop(first);
            gate.open();
            let reply = second.await.unwrap();
            assert_eq!(reply.to_bytes(), backend.contents(1, 0, 10));
            assert_eq!(backend.reads(1, 0), 1);
            assert!(cache.contains(1, 0));
            assert_eq!(cache.pages_used(), 1);
        });
    }

    #[test]
    fn test_waiter_completes_fetch() {
        let (cache, backend) = cache(8);
        backend.insert(1, contents(PAGE_SIZE));
        let gate = backend.hold(1, 0);
        block_on(async {
            let mut first = Box::pin(cache.read(1, 0, 10));
            let mut second = Box::pin(cache.read(1, 20, 10));
            assert!(matches!(poll!(&mut first), Poll::Pending));
            assert!(matches!(poll!(&mut second), Poll::Pending));

            // Only the second read is polled once the fetch can complete.
            gate.open();
            let Poll::Ready(reply) = poll!(&mut second) else {
                panic!("waiter did not complete the fetch");
            };
            assert_eq!(reply.unwrap().to_bytes(), backend.contents(1, 20, 10));

            // The first read finds its request already resolved.
            let reply = first.await.unwrap();
            assert_eq!(reply.to_bytes(), backend.contents(1, 0, 10));
            assert_eq!(backend.reads(1, 0), 1);
            assert_eq!(cache.table.metrics().faults.get(), 1);
        });
    }

    #[test]
    fn test_abandoned_fetch_resumed_by_next_read() {
        let (cache, backend) = cache(8);
        backend.insert(1, contents(PAGE_SIZE));
        let gate = backend.hold(1, 0);
        block_on(async {
            let mut first = Box::pin(cache.read(1, 0, 10));
            assert!(matches!(poll!(&mut first), Poll::Pending));
            drop(first);
            assert_eq!(cache.pages_used(), 1);

            gate.open();
            let reply = cache.read(1, 0, 10).await.unwrap();
            assert_eq!(reply.to_bytes(), backend.contents(1, 0, 10));
            assert_eq!(backend.reads(1, 0), 1);
            assert_eq!(cache.table.metrics().coalesced.get(), 1);
        });
    }

    #[test]
    fn test_abandoned_fetch_evicted() {
        let mut config = Config::new(NZUsize!(PAGE_SIZE), NZUsize!(2));
        config.low_watermark = 0;
        let (cache, backend) = cache_with(config);
        backend.insert(1, contents(PAGE_SIZE));
        let _gate = backend.hold(1, 0);
        block_on(async {
            let mut first = Box::pin(cache.read(1, 0, 10));
            assert!(matches!(poll!(&mut first), Poll::Pending));
            drop(first);

            // No read is left to wait on the page, so it can be evicted.
            assert_eq!(cache.prune(), 1);
            assert_eq!(cache.pages_used(), 0);
            assert!(cache.table.lookup(1).is_none());

            let reply = cache.read(1, 0, 10).await.unwrap();
            assert_eq!(reply.to_bytes(), backend.contents(1, 0, 10));
            assert_eq!(backend.reads(1, 0), 2);
        });
    }

    #[test]
    fn test_invalidate() {
        let (cache, backend) = cache(8);
        backend.insert(1, vec![1u8; 2 * PAGE_SIZE]);
        block_on(async {
            cache.read(1, 0, 2 * PAGE_SIZE).await.unwrap();
            assert!(cache.cached_stat(1).is_some());

            // The cache keeps serving the old contents until told otherwise.
            backend.insert(1, vec![2u8; 2 * PAGE_SIZE]);
            let reply = cache.read(1, 0, 10).await.unwrap();
            assert_eq!(reply.to_bytes(), Bytes::from(vec![1u8; 10]));

            assert_eq!(cache.invalidate(1), 2);
            assert_eq!(cache.pages_used(), 0);
            assert!(cache.cached_stat(1).is_none());
            let reply = cache.read(1, 0, 10).await.unwrap();
            assert_eq!(reply.to_bytes(), Bytes::from(vec![2u8; 10]));
        });
        assert_eq!(cache.invalidate(42), 0);
    }

    #[test]
    fn test_revalidate() {
        let (cache, backend) = cache(8);
        backend.insert(1, vec![1u8; 2 * PAGE_SIZE]);
        assert!(cache.revalidate(1, backend.attributes(1).unwrap()));
        block_on(async {
            cache.read(1, 0, 2 * PAGE_SIZE).await.unwrap();
        });
        assert_eq!(cache.cached_stat(1), backend.attributes(1));

        // Unchanged attributes keep the pages.
        assert!(cache.revalidate(1, backend.attributes(1).unwrap()));
        assert_eq!(cache.pages_used(), 2);

        backend.insert(1, vec![2u8; 2 * PAGE_SIZE]);
        assert!(!cache.revalidate(1, backend.attributes(1).unwrap()));
        assert_eq!(cache.pages_used(), 0);
        assert_eq!(cache.cached_stat(1), backend.attributes(1));
        block_on(async {
            let reply = cache.read(1, PAGE_SIZE_U64, 10).await.unwrap();
            assert_eq!(reply.to_bytes(), Bytes::from(vec![2u8; 10]));
        });
    }

    #[test]
    fn test_release() {
        let (cache, backend) = cache(8);
        backend.insert(1, contents(2 * PAGE_SIZE));
        backend.insert(2, contents(2 * PAGE_SIZE));
        block_on(async {
            cache.read(1, 0, 2 * PAGE_SIZE).await.unwrap();
            cache.read(2, 0, PAGE_SIZE).await.unwrap();
        });
        assert!(cache.release(1));
        assert_eq!(cache.pages_used(), 1);
        assert!(cache.cached_stat(1).is_none());
        assert!(!cache.release(1));
    }

    #[test]
    fn test_release_while_reading() {
        let (cache, backend) = cache(8);
        backend.insert(1, contents(2 * PAGE_SIZE));
        let gate = backend.hold(1, 0);
        block_on(async {
            let mut pending = Box::pin(cache.read(1, 0, 10));
            assert!(matches!(poll!(&mut pending), Poll::Pending));

            // The read in flight keeps the inode alive.
            assert!(!cache.release(1));
            assert_eq!(cache.pages_used(), 1);

            gate.open();
            let reply = pending.await.unwrap();
            assert_eq!(reply.len(), 10);
        });
        assert_eq!(cache.pages_used(), 0);
        assert!(cache.table.lookup(1).is_none());
    }
}
