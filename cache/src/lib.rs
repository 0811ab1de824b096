//! Cache file pages read through a stackable filesystem layer.
//!
//! A [Cache] sits between a filesystem consumer and a [Backend] that performs the actual
//! storage I/O. Reads are split into fixed-size, page-aligned units that are kept in memory so
//! repeated or overlapping reads never reach the backend twice.
//!
//! # Faults
//!
//! A read that touches a page not yet in memory creates it and _faults_ it: exactly one
//! [Backend::read] is issued for the page, no matter how many concurrent reads need it. Reads
//! arriving while the fetch is in flight register themselves on the page's wait list and are
//! resumed, in no particular order, once it resolves. A failed fetch is delivered to every waiter
//! and the page is discarded, so the next read of it faults again.
//!
//! # Eviction
//!
//! The cache holds at most [Config::page_budget] pages. Creating a page beyond the budget triggers
//! an eviction pass that destroys pages in least-recently-used order (oldest file first, then
//! oldest page within that file) until [Config::low_watermark] is reached. Pages with waiters are
//! only evicted once every read waiting on them has been dropped. Data handed out in a [Reply] shares ownership of the page buffer and stays
//! valid after the page itself has been evicted.
//!
//! # Cancellation
//!
//! Dropping a [Cache::read] future never affects other reads. Every read waiting on a page polls
//! the page's single fetch, so the fetch completes as long as any of them is still polled. A fetch
//! left with no reads at all is resumed by the next read of the page, or destroyed by an eviction
//! pass once nothing is using the file.
//!
//! # Example
//!
//! ```rust
//! use futures::executor::block_on;
//! use prometheus_client::registry::Registry;
//! use stackfs_cache::{mocks, Cache, Config, NZUsize};
//!
//! block_on(async {
//!     let backend = mocks::Memory::default();
//!     backend.insert(7, vec![1u8; 10_000]);
//!
//!     let config = Config::new(NZUsize!(4096), NZUsize!(8));
//!     let cache = Cache::new(&mut Registry::default(), backend.clone(), config);
//!
//!     // The range straddles two pages, so two segments come back.
//!     let reply = cache.read(7, 4000, 200).await.unwrap();
//!     assert_eq!(reply.len(), 200);
//!     assert_eq!(reply.segments().len(), 2);
//!
//!     // Reading it again is served from memory.
//!     cache.read(7, 4000, 200).await.unwrap();
//!     assert_eq!(backend.reads(7, 0), 1);
//!     assert_eq!(backend.reads(7, 4096), 1);
//! });
//! ```

/// Create a [NonZeroUsize] from a literal, failing at compile time in const contexts if it is 0.
#[macro_export]
macro_rules! NZUsize {
    ($val:expr) => {
        match ::core::num::NonZeroUsize::new($val) {
            Some(value) => value,
            None => panic!("value must be non-zero"),
        }
    };
}

use bytes::Bytes;
use std::{
    future::Future,
    io::Error as IoError,
    num::{NonZeroU64, NonZeroUsize},
    sync::Arc,
    time::SystemTime,
};
use thiserror::Error;

mod assembler;
pub use assembler::{Reply, ReplyBuf, Segment};
mod cache;
pub use cache::Cache;
mod fault;
mod inode;
mod metrics;
pub mod mocks;
mod page;
mod table;

/// Identifies a file whose pages are cached.
pub type FileId = u64;

/// Errors that can occur when reading through the cache.
///
/// Errors are [Clone] because a single failed fetch is delivered to every read waiting on the
/// page. The underlying I/O error is shared, so all of them observe the very same value.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("read failed: {0}")]
    ReadFailed(Arc<IoError>),
    #[error("malformed read: requested {requested} bytes, received {received}")]
    MalformedRead { requested: usize, received: usize },
    #[error("offset overflow")]
    OffsetOverflow,
    #[error("canceled")]
    Canceled,
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Self::ReadFailed(Arc::new(err))
    }
}

/// File attributes reported by the [Backend], used to detect when cached pages are stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attributes {
    /// The size of the file in bytes.
    pub size: u64,

    /// The last modification time of the file.
    pub mtime: SystemTime,
}

/// The outcome of a successful [Backend::read].
#[derive(Clone, Debug)]
pub struct Fetched {
    /// The bytes read, in order. May be shorter than requested at the end of the file.
    pub segments: Vec<Bytes>,

    /// The attributes of the file at the time of the read.
    pub attributes: Attributes,
}

impl Fetched {
    /// The total number of bytes across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    /// Whether no bytes were returned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The layer below the cache that performs the actual reads.
pub trait Backend: Send + Sync + 'static {
    /// Read up to `len` bytes of `file` starting at `offset`.
    ///
    /// Fewer bytes may be returned only when the read reaches the end of the file. Retrying a
    /// failed read is left to the implementation: the cache never retries on its own.
    fn read(
        &self,
        file: FileId,
        offset: u64,
        len: usize,
    ) -> impl Future<Output = Result<Fetched, Error>> + Send;
}

/// Configuration for a [Cache].
#[derive(Clone, Debug)]
pub struct Config {
    /// The size of each cached page in bytes. Must be a power of two.
    pub page_size: NonZeroUsize,

    /// The maximum number of pages kept in memory.
    pub page_budget: NonZeroUsize,

    /// The number of pages an eviction pass reduces the cache to. Must not exceed `page_budget`.
    pub low_watermark: usize,
}

impl Config {
    /// The default page size (128 KiB).
    pub const DEFAULT_PAGE_SIZE: NonZeroUsize = NZUsize!(128 * 1024);

    /// The default cache size (32 MiB).
    pub const DEFAULT_CACHE_SIZE: NonZeroU64 = match NonZeroU64::new(32 * 1024 * 1024) {
        Some(size) => size,
        None => panic!("cache size must be non-zero"),
    };

    /// Returns a [Config] holding up to `page_budget` pages of `page_size` bytes, evicting down to
    /// half the budget whenever it is exceeded.
    pub const fn new(page_size: NonZeroUsize, page_budget: NonZeroUsize) -> Self {
        Self {
            page_size,
            page_budget,
            low_watermark: page_budget.get() / 2,
        }
    }

    /// Returns a [Config] whose page budget is the number of whole pages that fit in `cache_size`
    /// bytes (at least one).
    pub fn from_cache_size(page_size: NonZeroUsize, cache_size: NonZeroU64) -> Self {
        let pages = cache_size.get() / page_size.get() as u64;
        let pages = usize::try_from(pages).unwrap_or(usize::MAX).max(1);
        Self::new(page_size, NonZeroUsize::new(pages).unwrap_or(NonZeroUsize::MIN))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_cache_size(Self::DEFAULT_PAGE_SIZE, Self::DEFAULT_CACHE_SIZE)
    }
}

/// Install a tracing subscriber that writes to the test harness.
#[cfg(test)]
pub(crate) fn traced() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .try_init();
}
