use crate::{assembler::Request, Attributes, Error};
use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use std::{mem, sync::Arc};

// The single fetch of a page, polled by every read waiting on it.
//
// The outcome is cloned out to each poller, which is why [Error] is cheap to clone.
pub(crate) type Fetch = Shared<BoxFuture<'static, Result<(Bytes, Attributes), Error>>>;

/// The progress of a [Page] through its fault.
///
/// There is no failed state: a page whose fetch fails is removed from its inode once the error has
/// been handed to its waiters.
pub(crate) enum State {
    /// A fetch is in flight. `id` distinguishes it from later fetches of the same offset.
    Faulting { id: u64, fetch: Fetch },
    /// Holds the page's bytes, which are shorter than a page only at the end of the file.
    Ready(Bytes),
}

/// A cached, page-aligned range of one file.
pub(crate) struct Page {
    /// The page-aligned offset of the first byte of the page.
    offset: u64,

    /// The page's position in its inode's LRU order (larger is more recent).
    stamp: u64,

    state: State,

    /// Requests to resume once the in-flight fault resolves.
    ///
    /// # Invariants
    ///
    /// Non-empty only while the page is [State::Faulting]. A page with waiters is never destroyed
    /// while its inode is in use, except by the resolution of its fault.
    waiters: Vec<Arc<Request>>,
}

impl Page {
    /// Create a page whose contents are being fetched by `fetch`.
    pub(crate) fn new(offset: u64, stamp: u64, id: u64, fetch: Fetch) -> Self {
        Self {
            offset,
            stamp,
            state: State::Faulting { id, fetch },
            waiters: Vec::new(),
        }
    }

    pub(crate) const fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) const fn stamp(&self) -> u64 {
        self.stamp
    }

    pub(crate) fn set_stamp(&mut self, stamp: u64) {
        self.stamp = stamp;
    }

    #[cfg(test)]
    pub(crate) const fn state(&self) -> &State {
        &self.state
    }

    /// The page's bytes, if it is ready.
    pub(crate) const fn data(&self) -> Option<&Bytes> {
        match &self.state {
            State::Ready(data) => Some(data),
            State::Faulting { .. } => None,
        }
    }

    /// The id of the in-flight fetch and a handle to it, if the page is faulting.
    pub(crate) fn fault(&self) -> Option<(u64, Fetch)> {
        match &self.state {
            State::Faulting { id, fetch } => Some((*id, fetch.clone())),
            State::Ready(_) => None,
        }
    }

    /// Whether the page is still waiting on the fetch identified by `id`.
    pub(crate) fn is_fault(&self, id: u64) -> bool {
        matches!(self.state, State::Faulting { id: current, .. } if current == id)
    }

    /// Whether any request is waiting on this page.
    pub(crate) fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn waiters(&self) -> usize {
        self.waiters.len()
    }

    /// Register `request` to be resumed when the page's fault resolves.
    pub(crate) fn wait(&mut self, request: Arc<Request>) {
        debug_assert!(
            self.data().is_none(),
            "waiting on a page that is already ready"
        );
        request.expect_page();
        self.waiters.push(request);
    }

    /// Store the fetched bytes and return the waiters to resume.
    pub(crate) fn install(&mut self, data: Bytes) -> Vec<Arc<Request>> {
        self.state = State::Ready(data);
        mem::take(&mut self.waiters)
    }

    /// Take the waiters of a page whose fault failed.
    pub(crate) fn take_waiters(&mut self) -> Vec<Arc<Request>> {
        mem::take(&mut self.waiters)
    }
}

/// A fetch that never completes.
#[cfg(test)]
pub(crate) fn stalled() -> Fetch {
    use futures::FutureExt;

    futures::future::pending().boxed().shared()
}
