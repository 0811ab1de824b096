//! Fetch a missing page from the backend and resume the reads waiting on it.

use crate::{
    inode::Inode, page::Fetch, table::Table, Attributes, Backend, Error, Fetched, FileId,
};
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Create the single fetch of the page of `file` at `offset`.
///
/// Nothing is read until a waiting read first polls the fetch. From then on, any of the reads
/// waiting on the page can drive it to completion.
pub(crate) fn fetch<B: Backend>(
    table: &Table,
    backend: &Arc<B>,
    file: FileId,
    offset: u64,
) -> Fetch {
    let backend = backend.clone();
    let faults = table.metrics().faults.clone();
    let len = table.page_size() as usize;
    async move {
        debug!(file, offset, "faulting page");
        faults.inc();
        let fetched = backend.read(file, offset, len).await?;
        assemble(fetched, len)
    }
    .boxed()
    .shared()
}

/// One read's interest in the fetch of a [Faulting](crate::page::State::Faulting) page.
///
/// Every read waiting on a page holds a fault for it and drives the shared fetch with
/// [Fault::run]. Whichever read observes the outcome first resolves the page and resumes all of
/// its waiters. The others find the page already resolved and do nothing.
pub(crate) struct Fault<'a> {
    table: &'a Table,
    inode: &'a Inode,
    offset: u64,
    id: u64,
    fetch: Fetch,
}

impl<'a> Fault<'a> {
    pub(crate) const fn new(
        table: &'a Table,
        inode: &'a Inode,
        offset: u64,
        id: u64,
        fetch: Fetch,
    ) -> Self {
        Self {
            table,
            inode,
            offset,
            id,
            fetch,
        }
    }

    /// Drive the page's fetch and, if no other read has done so yet, resolve the page.
    pub(crate) async fn run(self) {
        match self.fetch.clone().await {
            Ok((data, attributes)) => self.install(data, attributes),
            Err(err) => self.abandon(err),
        }
    }

    /// Make the fetched bytes the page's contents and resume every waiter.
    fn install(&self, data: Bytes, attributes: Attributes) {
        let file = self.inode.id();
        let (waiters, stale) = {
            let mut pages = self.inode.lock();
            let Some(page) = pages
                .get_mut(self.offset)
                .filter(|page| page.is_fault(self.id))
            else {
                trace!(file, offset = self.offset, "fault already resolved");
                return;
            };
            let waiters = page.install(data.clone());
            pages.touch(self.offset);

            // Other pages were cached from an older version of the file.
            let stale = if pages.refresh(attributes) {
                pages.invalidate(Some(self.offset))
            } else {
                0
            };
            (waiters, stale)
        };

        if stale > 0 {
            debug!(file, stale, "dropped pages of changed file");
            self.table.uncharge(stale);
            self.table.metrics().invalidations.inc_by(stale as u64);
        }

        trace!(
            file,
            offset = self.offset,
            len = data.len(),
            waiters = waiters.len(),
            "page ready"
        );
        for waiter in waiters {
            waiter.fill(self.offset, &data);
            waiter.settle();
        }
    }

    /// Discard the page and hand `err` to every waiter.
    fn abandon(&self, err: Error) {
        let file = self.inode.id();
        let page = {
            let mut pages = self.inode.lock();
            let current = pages
                .get(self.offset)
                .is_some_and(|page| page.is_fault(self.id));
            if current {
                pages.remove(self.offset)
            } else {
                None
            }
        };
        let Some(mut page) = page else {
            trace!(file, offset = self.offset, "fault already resolved");
            return;
        };
        self.table.uncharge(1);
        self.table.metrics().fault_failures.inc();

        let waiters = page.take_waiters();
        warn!(
            file,
            offset = self.offset,
            ?err,
            waiters = waiters.len(),
            "fault failed"
        );
        for waiter in waiters {
            waiter.fail(err.clone());
            waiter.settle();
        }
    }
}

/// Flatten a fetch into a single page buffer, rejecting fetches longer than a page.
fn assemble(fetched: Fetched, len: usize) -> Result<(Bytes, Attributes), Error> {
    let received = fetched.len();
    if received > len {
        return Err(Error::MalformedRead {
            requested: len,
            received,
        });
    }

    let Fetched {
        mut segments,
        attributes,
    } = fetched;
    let data = match segments.len() {
        0 => Bytes::new(),
        1 => segments.swap_remove(0),
        _ => {
            let mut buf = BytesMut::with_capacity(received);
            for segment in &segments {
                buf.extend_from_slice(segment);
            }
            buf.freeze()
        }
    };
    Ok((data, attributes))
}
