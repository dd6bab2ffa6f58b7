//! Control operations: barrier, snapshot, merge, grow, relocate, close
//!
//! Every structural change follows the same protocol: serialize on the
//! control mutex, stall new submissions at the gate (stall, not abort),
//! wait for in-flight work to drain, mutate the stack, republish, resume.
//! Cancellation tokens are observed at quiescence checks only; partial
//! work already committed stays committed.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel::bounded;
use parking_lot::MutexGuard;

use crate::core::error::{Error, Result};
use crate::core::types::{CancelToken, DeltaId, Generation};
use crate::delta::backing::{BackingStore, FileBacking};
use crate::delta::{Delta, DeltaOptions};
use crate::format;
use crate::system::metrics::Metrics;

use super::request::Completion;
use super::slot::SlotOp;
use super::{EngineInner, GateWriteGuard, MergeTracker};

/// Where a snapshot's fresh top delta is created.
pub enum SnapshotTarget {
    /// Create a new image file at this path
    Path(PathBuf),
    /// Format onto an injected backing store (tests, embedders)
    Store(Arc<dyn BackingStore>),
}

impl SnapshotTarget {
    fn open(self) -> Result<Arc<dyn BackingStore>> {
        match self {
            SnapshotTarget::Path(path) => Ok(Arc::new(FileBacking::create(&path)?)),
            SnapshotTarget::Store(store) => Ok(store),
        }
    }
}

/// Exclusive hold over the stack: control serialized, submissions stalled,
/// in-flight drained.
pub(crate) struct QuiesceGuard<'a> {
    _control: MutexGuard<'a, ()>,
    _gate: GateWriteGuard<'a>,
}

pub(crate) fn quiesce<'a>(
    inner: &'a EngineInner,
    cancel: Option<&CancelToken>,
) -> Result<QuiesceGuard<'a>> {
    let control = inner.control.try_lock().ok_or(Error::StackBusy)?;
    let gate = inner.gate.enter_write();
    inner.inflight.wait_drained();
    if let Some(token) = cancel {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
    }
    Ok(QuiesceGuard {
        _control: control,
        _gate: gate,
    })
}

/// Run a barrier on a dedicated thread. The exclusive gate intent was
/// registered by `submit` before spawning, so requests submitted after the
/// barrier stall behind it while in-flight work drains.
pub(crate) fn spawn_barrier(inner: Arc<EngineInner>, completion: Completion) {
    std::thread::spawn(move || {
        // Hold the gate across the completion call: requests submitted
        // after the barrier must not start (let alone complete) first.
        let gate = inner.gate.acquire_registered();
        let result = (|| -> Result<()> {
            inner.inflight.wait_drained();
            inner.pipeline.commit_all()?;
            let stack = inner.stack.read().clone();
            // Flush in stack order, base to top.
            for delta in stack.iter() {
                delta.flush()?;
            }
            Ok(())
        })();
        Metrics::global().engine.barriers.inc();
        completion(result.map(|_| Bytes::new()));
        drop(gate);
    });
}

/// Attach-delta: freeze the current top, create a fresh empty top above
/// it, publish the new stack.
pub(crate) fn snapshot(inner: &Arc<EngineInner>, target: SnapshotTarget) -> Result<()> {
    if inner.closed.load(Ordering::SeqCst) {
        return Err(Error::Closed);
    }
    let _q = quiesce(inner, None)?;
    inner.pipeline.commit_all()?;

    let stack = inner.stack.read().clone();
    let top = stack.top().clone();
    top.flush()?;

    let backing = target.open()?;
    let id = DeltaId(inner.next_delta_id.fetch_add(1, Ordering::SeqCst));
    let opts = DeltaOptions::from(&inner.config.engine);
    let new_top = Delta::create_image(
        id,
        backing,
        stack.cluster_shift(),
        stack.virtual_clusters(),
        0,
        &opts,
    )?;

    let new_stack = stack.with_new_top(Arc::new(new_top))?;
    top.set_read_only(true);
    *inner.stack.write() = Arc::new(new_stack);
    tracing::info!(new_top = %id, "snapshot published");
    Ok(())
}

/// Merge `upper` into the adjacent `lower` below it and drop `upper`.
///
/// The sweep runs concurrently with user I/O, copying cluster by cluster
/// through each cluster's slot. Clusters the user re-dirties during the
/// sweep are re-copied under final quiescence before publish.
pub(crate) fn merge(
    inner: &Arc<EngineInner>,
    lower_id: DeltaId,
    upper_id: DeltaId,
    cancel: &CancelToken,
) -> Result<()> {
    if inner.closed.load(Ordering::SeqCst) {
        return Err(Error::Closed);
    }
    let _control = inner.control.try_lock().ok_or(Error::StackBusy)?;

    let stack = inner.stack.read().clone();
    let lower_pos = stack
        .position(lower_id)
        .ok_or_else(|| Error::invalid_argument(format!("{} not in the stack", lower_id)))?;
    let upper_pos = stack
        .position(upper_id)
        .ok_or_else(|| Error::invalid_argument(format!("{} not in the stack", upper_id)))?;
    if upper_pos != lower_pos + 1 {
        return Err(Error::invalid_argument(
            "merge requires adjacent deltas, lower below upper",
        ));
    }
    let lower = stack.get(lower_id).cloned().ok_or(Error::StackBusy)?;
    let upper = stack.get(upper_id).cloned().ok_or(Error::StackBusy)?;
    if !lower.kind().is_image() {
        return Err(Error::invalid_argument("cannot merge into a raw base"));
    }
    if lower.is_failed() || upper.is_failed() {
        return Err(Error::BackingIo {
            kind: std::io::ErrorKind::Other,
            message: "merge target is offline".into(),
        });
    }
    let upper_is_top = upper_pos == stack.len() - 1;
    let lower_was_read_only = lower.is_read_only();

    lower.set_read_only(false);
    *inner.merge_tracker.lock() = Some(MergeTracker {
        redirty: std::collections::HashSet::new(),
    });

    let merged = run_merge(inner, &lower, &upper, upper_is_top, cancel);
    if merged.is_err() {
        *inner.merge_tracker.lock() = None;
        lower.set_read_only(lower_was_read_only);
    }
    merged
}

fn run_merge(
    inner: &Arc<EngineInner>,
    lower: &Arc<Delta>,
    upper: &Arc<Delta>,
    upper_is_top: bool,
    cancel: &CancelToken,
) -> Result<()> {
    // Sweep: user I/O continues; per-cluster quiescence comes from the
    // slot queue.
    for cluster in 0..upper.virtual_clusters() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if upper.lookup(cluster)?.is_none() {
            continue;
        }
        let (tx, rx) = bounded(1);
        super::enqueue_slot(
            inner,
            cluster,
            SlotOp::MergeCopy {
                lower: lower.clone(),
                upper: upper.clone(),
                done: tx,
            },
        );
        rx.recv().map_err(|_| Error::Closed)??;
    }

    // Final pass under quiescence: catch clusters re-dirtied during the
    // sweep, then publish the stack without the upper.
    let _gate = inner.gate.enter_write();
    inner.inflight.wait_drained();
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let redirty: Vec<u64> = inner
        .merge_tracker
        .lock()
        .take()
        .map(|t| t.redirty.into_iter().collect())
        .unwrap_or_default();
    for cluster in redirty {
        if upper.lookup(cluster)?.is_some() {
            merge_copy_cluster(inner, lower, upper, cluster)?;
        }
    }

    inner.pipeline.commit_all()?;
    lower.flush()?;

    let current = inner.stack.read().clone();
    let new_stack = current.without(upper.id())?;
    if !upper_is_top {
        lower.set_read_only(true);
    }
    *inner.stack.write() = Arc::new(new_stack);
    inner.pipeline.forget(upper.id());
    tracing::info!(lower = %lower.id(), upper = %upper.id(), "merge published");
    Ok(())
}

/// Copy one cluster from `upper` into `lower`.
///
/// When the lower already maps the cluster the copy goes in place: the
/// upper still shadows it until publish, so a crash mid-copy is invisible.
/// Otherwise the data lands in a fresh lower tail slot behind a committed
/// BAT update.
pub(crate) fn merge_copy_cluster(
    inner: &Arc<EngineInner>,
    lower: &Arc<Delta>,
    upper: &Arc<Delta>,
    cluster: u64,
) -> Result<()> {
    let up_phys = match upper.lookup(cluster)? {
        Some(phys) => phys,
        None => return Ok(()),
    };
    let mut buf = vec![0u8; upper.cluster_bytes() as usize];
    upper.read_range(up_phys, 0, &mut buf)?;

    match lower.lookup(cluster)? {
        Some(low_phys) => {
            lower.write_range(low_phys, 0, &buf)?;
        }
        None => {
            let dst = lower.allocate_tail()?;
            lower.write_range(dst as u64, 0, &buf)?;
            lower.flush()?;
            let ticket = inner.pipeline.record_write(lower, cluster, dst)?;
            inner.pipeline.wait_committed(lower.id(), ticket)?;
        }
    }
    Ok(())
}

/// Extend the top's virtual size, growing the BAT region first when the
/// new geometry needs physical slots that currently hold data.
pub(crate) fn grow(inner: &Arc<EngineInner>, new_virtual_clusters: u64) -> Result<()> {
    if inner.closed.load(Ordering::SeqCst) {
        return Err(Error::Closed);
    }
    let _q = quiesce(inner, None)?;

    let stack = inner.stack.read().clone();
    let top = stack.top().clone();
    if !top.kind().is_image() {
        return Err(Error::invalid_argument("grow requires an image top"));
    }
    if top.is_failed() {
        return Err(Error::BackingIo {
            kind: std::io::ErrorKind::Other,
            message: "top delta is offline".into(),
        });
    }
    let current = top.virtual_clusters();
    if new_virtual_clusters <= current {
        return Err(Error::invalid_argument(format!(
            "grow target {} does not exceed current size {}",
            new_virtual_clusters, current
        )));
    }
    if new_virtual_clusters > u32::MAX as u64 {
        return Err(Error::invalid_argument(
            "grow target exceeds addressable clusters",
        ));
    }
    let bat = top
        .bat()
        .ok_or_else(|| Error::invalid_argument("grow requires an image top"))?;

    inner.pipeline.commit_all()?;

    let shift = top.cluster_shift();
    let old_entries = bat.entries_total();
    let new_entries = new_virtual_clusters as u32;
    let old_pages = format::bat_pages(old_entries);
    let new_pages = format::bat_pages(new_entries);
    let new_first = format::first_data_cluster(shift, new_entries);
    let old_first = top.first_data_cluster();

    if new_first > old_first {
        // The expanded BAT region swallows physical slots that may hold
        // data: relocate those clusters tail-ward behind committed BAT
        // updates before the region grows over them.
        top.reserve_metadata_region(new_first);
        let mut victims: Vec<(u64, u32)> = Vec::new();
        bat.scan(|logical, phys| {
            if phys < new_first {
                victims.push((logical, phys));
            }
        })?;
        tracing::debug!(
            victims = victims.len(),
            old_first,
            new_first,
            "relocating data out of the expanded BAT region"
        );
        for (logical, phys) in victims {
            let dst = top.allocate_tail()?;
            let mut buf = vec![0u8; top.cluster_bytes() as usize];
            top.read_range(phys as u64, 0, &mut buf)?;
            top.write_range(dst as u64, 0, &buf)?;
            inner.pipeline.record_write(&top, logical, dst)?;
        }
        top.flush()?;
        inner.pipeline.commit_all()?;
    }

    // Append zeroed BAT pages (stamp 0: all-hole, older than any commit),
    // make them durable, then switch the header to the new geometry. A
    // crash between the two leaves the old geometry: safe.
    for page in old_pages..new_pages {
        top.write_bat_page(page, Generation(0), &[])?;
    }
    top.flush()?;
    top.write_header_geometry(new_virtual_clusters, new_entries)?;
    top.flush()?;
    top.clear_space_exhausted();

    // Reopen the top from the same backing so every cached size and the
    // BAT cache pick up the new geometry, then republish.
    let opts = DeltaOptions::from(&inner.config.engine);
    let reopened = Delta::open_image(top.id(), top.backing_arc(), false, &opts)?;
    inner.pipeline.forget(top.id());
    let new_stack = stack.with_replaced_top(Arc::new(reopened));
    *inner.stack.write() = Arc::new(new_stack);
    tracing::info!(
        clusters = new_virtual_clusters,
        "virtual size grown and republished"
    );
    Ok(())
}

/// Public relocate: route through the cluster's slot so it serializes
/// with user I/O on the same cluster.
pub(crate) fn relocate(inner: &Arc<EngineInner>, cluster: u64) -> Result<()> {
    if inner.closed.load(Ordering::SeqCst) {
        return Err(Error::Closed);
    }
    let (tx, rx) = bounded(1);
    {
        let _gate = inner.gate.enter_read();
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let stack = inner.stack.read().clone();
        if cluster >= stack.virtual_clusters() {
            let per_cluster = crate::core::types::cluster_sectors(stack.cluster_shift());
            return Err(Error::OutOfRange {
                offset_sectors: cluster * per_cluster,
                sectors: per_cluster,
                virtual_sectors: stack.virtual_sectors(),
            });
        }
        if !stack.top().kind().is_image() {
            return Err(Error::invalid_argument("relocate requires an image top"));
        }
        inner.inflight.enter();
        super::enqueue_slot(inner, cluster, SlotOp::Relocate { done: tx });
    }
    let result = match rx.recv() {
        Ok(result) => result,
        Err(_) => Err(Error::Closed),
    };
    inner.inflight.exit();
    if result.is_ok() {
        Metrics::global().engine.relocations.inc();
    }
    result
}

/// Slot-context relocate: move the cluster's physical location within the
/// top, commit the new mapping, and only then free the old slot.
pub(crate) fn do_relocate(inner: &Arc<EngineInner>, cluster: u64) -> Result<()> {
    let stack = inner.stack.read().clone();
    let top = stack.top().clone();
    let bat = top
        .bat()
        .ok_or_else(|| Error::invalid_argument("relocate requires an image top"))?;
    top.ensure_writable()?;

    let src = match bat.lookup(cluster)? {
        Some(phys) => phys,
        // Not mapped in the top: nothing to move.
        None => return Ok(()),
    };

    let dst = match top.take_free_slot() {
        Some(slot) => slot,
        None => top.allocate_tail()?,
    };

    let mut buf = vec![0u8; top.cluster_bytes() as usize];
    top.read_range(src as u64, 0, &mut buf)?;
    top.write_range(dst as u64, 0, &buf)?;
    top.flush()?;

    let ticket = inner.pipeline.record_write(&top, cluster, dst)?;
    inner.pipeline.wait_committed(top.id(), ticket)?;

    // Only now is the old slot reusable: recovery up to this point still
    // observes the pre-transaction mapping at src.
    top.grant_free(src);
    tracing::debug!(cluster, src, dst, "relocated");
    Ok(())
}

/// Drain, commit, flush, trim tail garbage, and stop worker contexts.
pub(crate) fn close(inner: &Arc<EngineInner>) -> Result<()> {
    if inner.closed.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    // Wait out any control operation in progress, then stall submissions.
    let _control = inner.control.lock();
    let _gate = inner.gate.enter_write();
    inner.inflight.wait_drained();

    let result = (|| -> Result<()> {
        inner.pipeline.commit_all()?;
        let stack = inner.stack.read().clone();
        for delta in stack.iter() {
            delta.flush()?;
        }
        let top = stack.top();
        if top.kind().is_image() && !top.is_read_only() && !top.is_failed() {
            top.trim_tail()?;
            top.flush()?;
        }
        Ok(())
    })();

    inner.pipeline.shutdown();
    inner.pool.shutdown();
    tracing::info!("engine closed");
    result
}
