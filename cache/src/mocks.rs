//! An in-memory [Backend] for exercising a [Cache](crate::Cache).

use crate::{Attributes, Backend, Error, Fetched, FileId};
use bytes::Bytes;
use futures::channel::oneshot;
use std::{
    collections::HashMap,
    io::{Error as IoError, ErrorKind},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

/// A backend serving files held in memory.
///
/// Every fetch is counted per page, and fetches can be made to fail or to wait until released
/// (see [Memory::fail] and [Memory::hold]). Clones share the same files and counters.
#[derive(Clone, Default)]
pub struct Memory {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    files: HashMap<FileId, File>,

    /// Fetches issued, keyed by file and offset.
    reads: HashMap<(FileId, u64), usize>,

    /// Remaining fetches to fail, keyed by file and offset.
    failures: HashMap<(FileId, u64), usize>,

    /// Fetches that wait for a [Gate] to open before completing.
    gates: HashMap<(FileId, u64), oneshot::Receiver<()>>,

    /// Incremented by every write, standing in for the modification time.
    version: u64,

    /// If set, fetched data is returned in segments of this many bytes.
    segment_size: Option<usize>,

    /// Extra bytes returned past the requested length.
    overread: usize,
}

struct File {
    data: Bytes,
    attributes: Attributes,
}

/// Holds back a fetch until opened (or dropped).
pub struct Gate(oneshot::Sender<()>);

impl Gate {
    /// Let the held fetch complete.
    pub fn open(self) {
        let _ = self.0.send(());
    }
}

impl Memory {
    /// Create or replace `file`, giving it a new modification time.
    pub fn insert(&self, file: FileId, data: impl Into<Bytes>) {
        let data = data.into();
        let mut inner = self.inner.lock().unwrap();
        inner.version += 1;
        let attributes = Attributes {
            size: data.len() as u64,
            mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(inner.version),
        };
        inner.files.insert(file, File { data, attributes });
    }

    pub fn attributes(&self, file: FileId) -> Option<Attributes> {
        let inner = self.inner.lock().unwrap();
        inner.files.get(&file).map(|file| file.attributes)
    }

    /// The bytes of `file` in `[offset, offset + len)`, truncated at the end of the file.
    pub fn contents(&self, file: FileId, offset: u64, len: usize) -> Bytes {
        let inner = self.inner.lock().unwrap();
        inner
            .files
            .get(&file)
            .map(|file| slice(&file.data, offset, len))
            .unwrap_or_default()
    }

    /// The number of fetches issued for the page of `file` at `offset`.
    pub fn reads(&self, file: FileId, offset: u64) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.reads.get(&(file, offset)).copied().unwrap_or(0)
    }

    pub fn total_reads(&self) -> usize {
        self.inner.lock().unwrap().reads.values().sum()
    }

    /// Fail the next `times` fetches of the page of `file` at `offset`.
    pub fn fail(&self, file: FileId, offset: u64, times: usize) {
        let mut inner = self.inner.lock().unwrap();
        *inner.failures.entry((file, offset)).or_default() += times;
    }

    /// Hold the next fetch of the page of `file` at `offset` until the returned [Gate] is opened.
    pub fn hold(&self, file: FileId, offset: u64) -> Gate {
        let (sender, receiver) = oneshot::channel();
        self.inner
            .lock()
            .unwrap()
            .gates
            .insert((file, offset), receiver);
        Gate(sender)
    }

    /// Split fetched data into segments of `size` bytes, or return it whole if `None`.
    pub fn set_segment_size(&self, size: Option<usize>) {
        self.inner.lock().unwrap().segment_size = size;
    }

    /// Return `extra` bytes more than requested from every fetch.
    pub fn set_overread(&self, extra: usize) {
        self.inner.lock().unwrap().overread = extra;
    }
}

impl Backend for Memory {
    async fn read(&self, file: FileId, offset: u64, len: usize) -> Result<Fetched, Error> {
        let gate = {
            let mut inner = self.inner.lock().unwrap();
            *inner.reads.entry((file, offset)).or_default() += 1;
            inner.gates.remove(&(file, offset))
        };
        if let Some(gate) = gate {
            // A dropped gate releases the fetch just like an opened one.
            let _ = gate.await;
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(remaining) = inner.failures.get_mut(&(file, offset)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(IoError::other("injected failure").into());
            }
        }
        let overread = inner.overread;
        let segment_size = inner.segment_size;
        let file = inner
            .files
            .get(&file)
            .ok_or_else(|| IoError::from(ErrorKind::NotFound))?;

        let data = slice(&file.data, offset, len + overread);
        let segments = match segment_size {
            Some(size) if size > 0 => (0..data.len())
                .step_by(size)
                .map(|start| data.slice(start..data.len().min(start + size)))
                .collect(),
            _ if data.is_empty() => Vec::new(),
            _ => vec![data],
        };
        Ok(Fetched {
            segments,
            attributes: file.attributes,
        })
    }
}

fn slice(data: &Bytes, offset: u64, len: usize) -> Bytes {
    let Ok(start) = usize::try_from(offset) else {
        return Bytes::new();
    };
    let start = start.min(data.len());
    let end = start.saturating_add(len).min(data.len());
    data.slice(start..end)
}
