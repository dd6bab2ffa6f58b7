//! Request model: incoming I/O, cluster splitting, and parent bookkeeping
//!
//! An incoming request is split into one sub-request per logical cluster it
//! touches. The parent carries an atomic pending count, an error
//! accumulator, and the caller's completion continuation; the request
//! completes all-or-nothing once every piece has finished, with the first
//! non-retriable error winning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::core::error::{Error, Result};
use crate::core::types::{CancelToken, SECTOR_SIZE};
use crate::system::metrics::Metrics;

use super::InflightGate;

/// Direction of an I/O request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    /// Read `sectors` sectors at `offset_sectors`
    Read,
    /// Write the payload at `offset_sectors`
    Write,
    /// Barrier: drain, commit metadata, flush every delta
    Flush,
}

/// Completion continuation. Receives the read data (empty for writes and
/// barriers) or the accumulated error.
pub type Completion = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;

/// An incoming logical read, write, or barrier.
pub struct IoRequest {
    /// Start offset in 512-byte sectors
    pub offset_sectors: u64,
    /// Length in sectors (must match the payload for writes; 0 for flush)
    pub sectors: u64,
    /// Direction
    pub kind: IoKind,
    /// Write payload; empty for reads and barriers
    pub payload: Bytes,
    /// Honoured while the request is still queued; ignored once it becomes
    /// the owner I/O of its cluster slot
    pub cancel: Option<CancelToken>,
    /// Caller continuation
    pub completion: Completion,
}

impl IoRequest {
    /// A read of `sectors` sectors at `offset_sectors`.
    pub fn read(offset_sectors: u64, sectors: u64, completion: Completion) -> Self {
        Self {
            offset_sectors,
            sectors,
            kind: IoKind::Read,
            payload: Bytes::new(),
            cancel: None,
            completion,
        }
    }

    /// A write of `payload` at `offset_sectors`.
    pub fn write(offset_sectors: u64, payload: Bytes, completion: Completion) -> Self {
        let sectors = payload.len() as u64 / SECTOR_SIZE;
        Self {
            offset_sectors,
            sectors,
            kind: IoKind::Write,
            payload,
            cancel: None,
            completion,
        }
    }

    /// A barrier with empty payload.
    pub fn barrier(completion: Completion) -> Self {
        Self {
            offset_sectors: 0,
            sectors: 0,
            kind: IoKind::Flush,
            payload: Bytes::new(),
            cancel: None,
            completion,
        }
    }

    /// Attach a cancellation token.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// One cluster-sized extent of a split request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Logical cluster index
    pub cluster: u64,
    /// Offset within the cluster, in sectors
    pub offset_sectors: u32,
    /// Length, in sectors
    pub sectors: u32,
}

/// Split `[offset_sectors, offset_sectors + sectors)` at cluster
/// boundaries. Alignment to clusters is not required; alignment to sectors
/// is inherent in the types.
///
/// Exposed for property tests: the extents always cover the input range
/// exactly, in order, and no extent crosses a cluster boundary.
pub fn split_extents(offset_sectors: u64, sectors: u64, cluster_shift: u32) -> Vec<Extent> {
    let per_cluster = 1u64 << cluster_shift;
    let mut extents = Vec::new();
    let mut at = offset_sectors;
    let end = offset_sectors + sectors;
    while at < end {
        let cluster = at >> cluster_shift;
        let in_cluster = at & (per_cluster - 1);
        let take = (per_cluster - in_cluster).min(end - at);
        extents.push(Extent {
            cluster,
            offset_sectors: in_cluster as u32,
            sectors: take as u32,
        });
        at += take;
    }
    extents
}

/// Shared state of a split request.
pub(crate) struct ParentIo {
    pending: AtomicUsize,
    error: Mutex<Option<Error>>,
    /// Assembly buffer for reads; `None` for writes.
    read_buf: Mutex<Option<BytesMut>>,
    completion: Mutex<Option<Completion>>,
    inflight: Arc<InflightGate>,
}

impl ParentIo {
    pub(crate) fn new_read(
        pieces: usize,
        total_bytes: usize,
        completion: Completion,
        inflight: Arc<InflightGate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(pieces),
            error: Mutex::new(None),
            read_buf: Mutex::new(Some(BytesMut::zeroed(total_bytes))),
            completion: Mutex::new(Some(completion)),
            inflight,
        })
    }

    pub(crate) fn new_write(
        pieces: usize,
        completion: Completion,
        inflight: Arc<InflightGate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(pieces),
            error: Mutex::new(None),
            read_buf: Mutex::new(None),
            completion: Mutex::new(Some(completion)),
            inflight,
        })
    }

    /// Copy one finished piece into the read assembly buffer.
    pub(crate) fn fill(&self, offset: usize, data: &[u8]) {
        let mut buf = self.read_buf.lock();
        if let Some(buf) = buf.as_mut() {
            buf[offset..offset + data.len()].copy_from_slice(data);
        }
    }

    /// Accumulate an error: the first non-retriable error wins; a
    /// retriable error is kept only until something worse arrives.
    pub(crate) fn record_error(&self, e: Error) {
        let mut slot = self.error.lock();
        match slot.as_ref() {
            None => *slot = Some(e),
            Some(held) if held.is_retryable() && !e.is_retryable() => *slot = Some(e),
            Some(_) => {}
        }
    }

    /// One piece finished. Fires the caller completion when the last piece
    /// lands, then releases the in-flight gate.
    pub(crate) fn child_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let error = self.error.lock().take();
        let completion = self.completion.lock().take();
        let data = self
            .read_buf
            .lock()
            .take()
            .map(BytesMut::freeze)
            .unwrap_or_default();

        let metrics = Metrics::global();
        metrics.engine.requests_completed.inc();
        if error.is_some() {
            metrics.engine.request_errors.inc();
        }

        if let Some(completion) = completion {
            match error {
                Some(e) => completion(Err(e)),
                None => completion(Ok(data)),
            }
        }
        self.inflight.exit();
    }
}

/// One per-cluster piece of a split request.
pub(crate) struct SubRequest {
    /// Logical cluster this piece targets
    pub cluster: u64,
    /// Offset within the cluster, in sectors
    pub offset_sectors: u32,
    /// Length, in sectors
    pub sectors: u32,
    /// Slice of the parent payload (writes only)
    pub payload: Option<Bytes>,
    /// Byte offset of this piece within the parent buffer
    pub parent_offset: usize,
    pub parent: Arc<ParentIo>,
    pub cancel: Option<CancelToken>,
}

impl SubRequest {
    /// Whether this piece is a write.
    pub(crate) fn is_write(&self) -> bool {
        self.payload.is_some()
    }

    /// Complete this piece successfully with read data.
    pub(crate) fn complete_read(&self, data: &[u8]) {
        self.parent.fill(self.parent_offset, data);
        self.parent.child_done();
    }

    /// Complete this piece successfully (write path).
    pub(crate) fn complete_ok(&self) {
        self.parent.child_done();
    }

    /// Complete this piece with an error.
    pub(crate) fn complete_err(&self, e: Error) {
        self.parent.record_error(e);
        self.parent.child_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_within_one_cluster() {
        // 4 KiB clusters = 8 sectors.
        let extents = split_extents(2, 4, 3);
        assert_eq!(
            extents,
            vec![Extent {
                cluster: 0,
                offset_sectors: 2,
                sectors: 4
            }]
        );
    }

    #[test]
    fn test_split_exactly_one_aligned_cluster() {
        let extents = split_extents(8, 8, 3);
        assert_eq!(
            extents,
            vec![Extent {
                cluster: 1,
                offset_sectors: 0,
                sectors: 8
            }]
        );
    }

    #[test]
    fn test_split_spanning_clusters() {
        // Sectors 6..19 over 8-sector clusters: [6..8) [8..16) [16..19).
        let extents = split_extents(6, 13, 3);
        assert_eq!(extents.len(), 3);
        assert_eq!(extents[0], Extent { cluster: 0, offset_sectors: 6, sectors: 2 });
        assert_eq!(extents[1], Extent { cluster: 1, offset_sectors: 0, sectors: 8 });
        assert_eq!(extents[2], Extent { cluster: 2, offset_sectors: 0, sectors: 3 });
    }

    #[test]
    fn test_split_zero_length() {
        assert!(split_extents(10, 0, 3).is_empty());
    }

    #[test]
    fn test_error_accumulator_prefers_non_retriable() {
        let inflight = Arc::new(InflightGate::new());
        inflight.enter();
        let parent = ParentIo::new_write(3, Box::new(|_| {}), inflight);

        parent.record_error(Error::MetadataBackpressure);
        parent.record_error(Error::OutOfSpace);
        parent.record_error(Error::StackBusy);

        assert_eq!(*parent.error.lock(), Some(Error::OutOfSpace));
    }
}
