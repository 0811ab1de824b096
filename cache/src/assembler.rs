//! Assemble the reply to a read from the pages it spans.

use crate::Error;
use bytes::{Buf, Bytes, BytesMut};
use futures::channel::oneshot;
use std::{
    collections::{BTreeMap, VecDeque},
    mem,
    sync::{Arc, Mutex},
};

/// A contiguous run of file bytes in a [Reply].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// The absolute file offset of the first byte.
    pub offset: u64,

    /// The bytes, sharing ownership with the page they were read from.
    pub data: Bytes,
}

/// The bytes returned by a read, as one segment per page touched, in file order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reply {
    segments: Vec<Segment>,
    len: usize,
}

impl Reply {
    /// The total number of bytes returned. Less than requested only at the end of the file.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the reply holds no bytes, as when the read starts at or past the end of the file.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The segments of the reply, contiguous and in file order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Copy the reply into a single contiguous buffer (free when there is at most one segment).
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.as_slice() {
            [] => Bytes::new(),
            [segment] => segment.data.clone(),
            segments => {
                let mut buf = BytesMut::with_capacity(self.len);
                for segment in segments {
                    buf.extend_from_slice(&segment.data);
                }
                buf.freeze()
            }
        }
    }

    /// Returns a [Buf] that reads across all segments without copying.
    pub fn into_buf(self) -> ReplyBuf {
        ReplyBuf::new(self.segments.into_iter().map(|s| s.data).collect())
    }
}

/// A [Buf] over the segments of a [Reply].
#[derive(Debug)]
pub struct ReplyBuf {
    /// Slices not yet fully consumed.
    slices: VecDeque<Bytes>,
    /// Total remaining bytes across all slices.
    remaining: usize,
}

impl ReplyBuf {
    /// Create a buffer reading `slices` in order. Empty slices are skipped.
    pub fn new(slices: VecDeque<Bytes>) -> Self {
        let slices: VecDeque<Bytes> = slices.into_iter().filter(|s| !s.is_empty()).collect();
        let remaining = slices.iter().map(Bytes::len).sum();
        Self { slices, remaining }
    }
}

impl Buf for ReplyBuf {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        self.slices.front().map(|s| s.as_ref()).unwrap_or(&[])
    }

    fn advance(&mut self, mut cnt: usize) {
        self.remaining = self.remaining.saturating_sub(cnt);

        while cnt > 0 {
            let Some(front) = self.slices.front_mut() else {
                break;
            };

            if cnt < front.len() {
                front.advance(cnt);
                return;
            }

            cnt -= front.len();
            self.slices.pop_front();
        }
    }
}

/// A read waiting on one or more pages.
///
/// Each page the read depends on contributes its overlap with the requested range, or an error.
/// Once every page has resolved, the reply (or the first error) is delivered exactly once through
/// the channel returned by [Request::new].
pub(crate) struct Request {
    /// The first byte requested.
    offset: u64,
    /// One past the last byte requested.
    end: u64,

    assembly: Mutex<Assembly>,
}

struct Assembly {
    /// Contributions keyed by absolute file offset.
    segments: BTreeMap<u64, Bytes>,

    /// Pages not yet resolved, plus one hold for the dispatcher while it is still looking pages
    /// up.
    outstanding: usize,

    /// The first error reported by any page.
    error: Option<Error>,

    done: Option<oneshot::Sender<Result<Reply, Error>>>,
}

impl Request {
    /// Returns a request for `[offset, end)` and the receiver of its result.
    ///
    /// The request starts with one outstanding hold, which the dispatcher must [Request::settle]
    /// after it has registered the request on every page it is waiting for.
    pub(crate) fn new(
        offset: u64,
        end: u64,
    ) -> (Arc<Self>, oneshot::Receiver<Result<Reply, Error>>) {
        debug_assert!(offset <= end);
        let (sender, receiver) = oneshot::channel();
        let request = Self {
            offset,
            end,
            assembly: Mutex::new(Assembly {
                segments: BTreeMap::new(),
                outstanding: 1,
                error: None,
                done: Some(sender),
            }),
        };
        (Arc::new(request), receiver)
    }

    pub(crate) const fn offset(&self) -> u64 {
        self.offset
    }

    /// Record that the request is waiting on one more page.
    pub(crate) fn expect_page(&self) {
        self.assembly.lock().unwrap().outstanding += 1;
    }

    /// Add the overlap of the page at `page_offset` holding `data` with the requested range.
    pub(crate) fn fill(&self, page_offset: u64, data: &Bytes) {
        let start = self.offset.max(page_offset);
        let end = self.end.min(page_offset.saturating_add(data.len() as u64));
        if start >= end {
            return;
        }
        let slice = data.slice((start - page_offset) as usize..(end - page_offset) as usize);

        let mut assembly = self.assembly.lock().unwrap();
        if assembly.error.is_some() {
            return;
        }
        assembly.segments.insert(start, slice);
    }

    /// Fail the request. Only the first error is kept.
    pub(crate) fn fail(&self, err: Error) {
        let mut assembly = self.assembly.lock().unwrap();
        if assembly.error.is_none() {
            assembly.error = Some(err);
            assembly.segments.clear();
        }
    }

    /// Resolve one outstanding page (or the dispatcher's hold), delivering the result if it was the
    /// last.
    pub(crate) fn settle(&self) {
        let (done, result) = {
            let mut assembly = self.assembly.lock().unwrap();
            assert!(assembly.outstanding > 0, "request settled too many times");
            assembly.outstanding -= 1;
            if assembly.outstanding > 0 {
                return;
            }
            let Some(done) = assembly.done.take() else {
                return;
            };
            let result = match assembly.error.take() {
                Some(err) => Err(err),
                None => Ok(self.assemble(mem::take(&mut assembly.segments))),
            };
            (done, result)
        };

        // The reader may have gone away, in which case there is nobody left to tell.
        let _ = done.send(result);
    }

    /// Build the reply from the contiguous prefix of `segments` starting at the requested offset.
    /// Anything after a gap (a short page at the end of the file) is dropped.
    fn assemble(&self, segments: BTreeMap<u64, Bytes>) -> Reply {
        let mut reply = Reply::default();
        let mut next = self.offset;
        for (offset, data) in segments {
            if offset != next {
                break;
            }
            next += data.len() as u64;
            reply.len += data.len();
            reply.segments.push(Segment { offset, data });
        }
        reply
    }
}
