//! The I/O translation engine
//!
//! The engine sits between an incoming stream of block requests and the
//! layered stack of backing files. `submit` splits each request at cluster
//! boundaries, routes every piece through its logical cluster's slot, and
//! completes the request all-or-nothing once every piece has finished.
//! Writes complete only after their data is flushed to stable storage and
//! any new BAT mapping has a durable metadata commit.
//!
//! There is no process-wide singleton: every entry point goes through an
//! [`Engine`] handle, which owns the worker pool, the metadata pipeline,
//! the slot table, and the dirty-page budget.

pub(crate) mod ops;
pub(crate) mod pipeline;
pub(crate) mod request;
pub(crate) mod slot;
pub(crate) mod worker;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::channel::bounded;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::{cluster_bytes, cluster_sectors, CancelToken, DeltaId, SECTOR_SIZE};
use crate::delta::stack::{DeltaStack, LayerInfo, StackSpec};
use crate::system::metrics::Metrics;

pub use ops::SnapshotTarget;
pub use request::{split_extents, Completion, Extent, IoKind, IoRequest};

use pipeline::Pipeline;
use request::{ParentIo, SubRequest};
use slot::{Slot, SlotOp, SlotState};
use worker::WorkerPool;

/// Count of in-flight requests, with a drain wait for quiescence.
pub(crate) struct InflightGate {
    active: Mutex<usize>,
    cond: Condvar,
}

impl InflightGate {
    pub(crate) fn new() -> Self {
        Self {
            active: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn enter(&self) {
        *self.active.lock() += 1;
    }

    pub(crate) fn exit(&self) {
        let mut active = self.active.lock();
        *active -= 1;
        if *active == 0 {
            self.cond.notify_all();
        }
    }

    pub(crate) fn wait_drained(&self) {
        let mut active = self.active.lock();
        while *active > 0 {
            self.cond.wait(&mut active);
        }
    }
}

struct GateState {
    readers: usize,
    writer_active: bool,
    writers_waiting: usize,
}

/// Submission gate. Plain submissions enter shared; barriers and control
/// operations register exclusive intent *synchronously at submission time*
/// and complete the acquisition later, so everything submitted after them
/// stalls behind them while in-flight work keeps running.
pub(crate) struct SubmitGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

pub(crate) struct GateReadGuard<'a> {
    gate: &'a SubmitGate,
}

pub(crate) struct GateWriteGuard<'a> {
    gate: &'a SubmitGate,
}

impl SubmitGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                readers: 0,
                writer_active: false,
                writers_waiting: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Shared entry; stalls while any exclusive holder is active or
    /// registered.
    pub(crate) fn enter_read(&self) -> GateReadGuard<'_> {
        let mut state = self.state.lock();
        while state.writer_active || state.writers_waiting > 0 {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
        GateReadGuard { gate: self }
    }

    /// Register exclusive intent without blocking. Later shared entries
    /// stall until the registration is acquired and released.
    pub(crate) fn register_writer(&self) {
        self.state.lock().writers_waiting += 1;
    }

    /// Complete a registered exclusive acquisition.
    pub(crate) fn acquire_registered(&self) -> GateWriteGuard<'_> {
        let mut state = self.state.lock();
        while state.writer_active || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer_active = true;
        GateWriteGuard { gate: self }
    }

    /// Register and acquire in one step (control operations).
    pub(crate) fn enter_write(&self) -> GateWriteGuard<'_> {
        self.register_writer();
        self.acquire_registered()
    }
}

impl Drop for GateReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.readers -= 1;
        self.gate.cond.notify_all();
    }
}

impl Drop for GateWriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.writer_active = false;
        self.gate.cond.notify_all();
    }
}

/// Clusters re-dirtied by user writes while a merge sweep is running; the
/// merge re-copies them under final quiescence.
pub(crate) struct MergeTracker {
    pub(crate) redirty: HashSet<u64>,
}

pub(crate) struct EngineInner {
    pub(crate) config: Config,
    pub(crate) stack: RwLock<Arc<DeltaStack>>,
    pub(crate) slots: DashMap<u64, Arc<Slot>>,
    pub(crate) pool: WorkerPool,
    pub(crate) pipeline: Pipeline,
    pub(crate) inflight: Arc<InflightGate>,
    pub(crate) gate: SubmitGate,
    pub(crate) control: Mutex<()>,
    pub(crate) merge_tracker: Mutex<Option<MergeTracker>>,
    pub(crate) next_delta_id: AtomicU32,
    pub(crate) closed: AtomicBool,
}

/// Handle to one open delta stack.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open a stack and start the engine's worker contexts.
    pub fn open(config: Config, spec: StackSpec) -> Result<Engine> {
        config.validate()?;
        let stack = DeltaStack::open(&spec, &config)?;
        let next_delta_id = stack.len() as u32;
        let pool = WorkerPool::new(config.optimal_worker_threads())
            .map_err(Error::from)?;
        let pipeline = Pipeline::start(&config.pipeline).map_err(Error::from)?;

        let inner = Arc::new(EngineInner {
            config,
            stack: RwLock::new(Arc::new(stack)),
            slots: DashMap::new(),
            pool,
            pipeline,
            inflight: Arc::new(InflightGate::new()),
            gate: SubmitGate::new(),
            control: Mutex::new(()),
            merge_tracker: Mutex::new(None),
            next_delta_id: AtomicU32::new(next_delta_id),
            closed: AtomicBool::new(false),
        });
        tracing::info!(
            workers = inner.config.optimal_worker_threads(),
            "engine started"
        );
        Ok(Engine { inner })
    }

    /// Submit a request. Caller errors are returned synchronously and the
    /// completion is *not* invoked for them; an accepted request always
    /// reports its outcome through the completion.
    pub fn submit(&self, req: IoRequest) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        if req.kind == IoKind::Flush {
            // Barriers bypass cluster slots: register the exclusive intent
            // now so everything submitted later queues behind the barrier,
            // then drain and flush on a dedicated thread.
            inner.gate.register_writer();
            ops::spawn_barrier(inner.clone(), req.completion);
            return Ok(());
        }

        let _gate = inner.gate.enter_read();
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let stack = inner.stack.read().clone();

        let is_write = req.kind == IoKind::Write;
        if is_write {
            if req.payload.len() as u64 % SECTOR_SIZE != 0 {
                return Err(Error::invalid_alignment(format!(
                    "payload of {} bytes is not sector-granular",
                    req.payload.len()
                )));
            }
            if req.sectors != req.payload.len() as u64 / SECTOR_SIZE {
                return Err(Error::invalid_alignment(
                    "declared sectors do not match the payload",
                ));
            }
        }

        // Zero-length: immediate success, no backing I/O.
        if req.sectors == 0 {
            (req.completion)(Ok(Bytes::new()));
            return Ok(());
        }

        let virtual_sectors = stack.virtual_sectors();
        let end = req
            .offset_sectors
            .checked_add(req.sectors)
            .unwrap_or(u64::MAX);
        if end > virtual_sectors {
            return Err(Error::OutOfRange {
                offset_sectors: req.offset_sectors,
                sectors: req.sectors,
                virtual_sectors,
            });
        }

        if is_write {
            stack.top().ensure_writable()?;
            if inner.pipeline.over_watermark() {
                return Err(Error::MetadataBackpressure);
            }
        }

        Metrics::global().engine.requests_submitted.inc();
        inner.inflight.enter();

        let extents = split_extents(req.offset_sectors, req.sectors, stack.cluster_shift());
        let parent = if is_write {
            ParentIo::new_write(extents.len(), req.completion, inner.inflight.clone())
        } else {
            ParentIo::new_read(
                extents.len(),
                (req.sectors * SECTOR_SIZE) as usize,
                req.completion,
                inner.inflight.clone(),
            )
        };

        let mut byte_off = 0usize;
        for ext in extents {
            let len_bytes = ext.sectors as usize * SECTOR_SIZE as usize;
            let payload = if is_write {
                Some(req.payload.slice(byte_off..byte_off + len_bytes))
            } else {
                None
            };
            let sub = SubRequest {
                cluster: ext.cluster,
                offset_sectors: ext.offset_sectors,
                sectors: ext.sectors,
                payload,
                parent_offset: byte_off,
                parent: parent.clone(),
                cancel: req.cancel.clone(),
            };
            enqueue_slot(inner, ext.cluster, SlotOp::Io(sub));
            byte_off += len_bytes;
        }
        Ok(())
    }

    /// Blocking read of `sectors` sectors at `offset_sectors`.
    pub fn read(&self, offset_sectors: u64, sectors: u64) -> Result<Bytes> {
        let (tx, rx) = bounded(1);
        self.submit(IoRequest::read(
            offset_sectors,
            sectors,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        ))?;
        rx.recv().map_err(|_| Error::Closed)?
    }

    /// Blocking write of `payload` at `offset_sectors`.
    pub fn write(&self, offset_sectors: u64, payload: Bytes) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.submit(IoRequest::write(
            offset_sectors,
            payload,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        ))?;
        rx.recv().map_err(|_| Error::Closed)?.map(|_| ())
    }

    /// Blocking barrier: drain, commit metadata, flush every delta.
    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.submit(IoRequest::barrier(Box::new(move |result| {
            let _ = tx.send(result);
        })))?;
        rx.recv().map_err(|_| Error::Closed)?.map(|_| ())
    }

    /// Freeze the current top and attach a fresh empty top above it.
    pub fn snapshot(&self, target: SnapshotTarget) -> Result<()> {
        ops::snapshot(&self.inner, target)
    }

    /// Merge the `upper` delta into the adjacent `lower` delta and drop it
    /// from the stack. Runs concurrently with user I/O; observes `cancel`
    /// between clusters.
    pub fn merge(&self, lower: DeltaId, upper: DeltaId, cancel: &CancelToken) -> Result<()> {
        ops::merge(&self.inner, lower, upper, cancel)
    }

    /// Extend the virtual disk to `new_virtual_clusters`, growing the
    /// top's BAT region (with relocation) as needed.
    pub fn grow(&self, new_virtual_clusters: u64) -> Result<()> {
        ops::grow(&self.inner, new_virtual_clusters)
    }

    /// Move the physical location of `cluster` within the top delta.
    pub fn relocate(&self, cluster: u64) -> Result<()> {
        ops::relocate(&self.inner, cluster)
    }

    /// Introspection snapshot of the stack, base first.
    pub fn layers(&self) -> Vec<LayerInfo> {
        self.inner.stack.read().layers()
    }

    /// Virtual size of the disk in sectors.
    pub fn virtual_sectors(&self) -> u64 {
        self.inner.stack.read().virtual_sectors()
    }

    /// The stack's cluster shift.
    pub fn cluster_shift(&self) -> u32 {
        self.inner.stack.read().cluster_shift()
    }

    /// Drain, commit, flush, and stop the engine. Idempotent.
    pub fn close(&self) -> Result<()> {
        ops::close(&self.inner)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::SeqCst) {
            if let Err(e) = ops::close(&self.inner) {
                tracing::warn!(error = %e, "engine close on drop failed");
            }
        }
    }
}

/// Queue an operation on a cluster slot, creating the slot on first
/// access and dispatching a worker if the slot was not running.
pub(crate) fn enqueue_slot(inner: &Arc<EngineInner>, cluster: u64, op: SlotOp) {
    let mut dispatch = false;
    {
        let entry = inner
            .slots
            .entry(cluster)
            .or_insert_with(|| Arc::new(Slot::new(cluster)));
        let slot = entry.value().clone();
        let mut si = slot.inner.lock();
        si.queue.push_back(op);
        if !si.running {
            si.running = true;
            dispatch = true;
        }
    }
    if dispatch {
        let worker_inner = inner.clone();
        inner
            .pool
            .execute(Box::new(move || run_slot(&worker_inner, cluster)));
    }
}

/// Drain a slot's queue in arrival order, then retire the slot.
fn run_slot(inner: &Arc<EngineInner>, cluster: u64) {
    loop {
        let slot = match inner.slots.get(&cluster) {
            Some(entry) => entry.value().clone(),
            None => return,
        };
        let op = {
            let mut si = slot.inner.lock();
            match si.queue.pop_front() {
                Some(op) => op,
                None => {
                    si.running = false;
                    si.state = SlotState::Idle;
                    drop(si);
                    // Destroy the slot unless someone enqueued between
                    // the unlock and here.
                    inner.slots.remove_if(&cluster, |_, s| {
                        let g = s.inner.lock();
                        !g.running && g.queue.is_empty()
                    });
                    return;
                }
            }
        };
        execute_op(inner, &slot, op);
    }
}

fn execute_op(inner: &Arc<EngineInner>, slot: &Arc<Slot>, op: SlotOp) {
    match op {
        SlotOp::Io(sub) => {
            if let Some(token) = &sub.cancel {
                // Cancellable only while queued; from here on this is
                // the owner I/O.
                if token.is_cancelled() {
                    sub.complete_err(Error::Cancelled);
                    return;
                }
            }
            if sub.is_write() {
                execute_write(inner, slot, sub);
            } else {
                execute_read(inner, slot, sub);
            }
        }
        SlotOp::Relocate { done } => {
            slot.set_state(SlotState::Relocating);
            let result = ops::do_relocate(inner, slot.cluster);
            let _ = done.send(result);
        }
        SlotOp::MergeCopy { lower, upper, done } => {
            slot.set_state(SlotState::Relocating);
            let result = ops::merge_copy_cluster(inner, &lower, &upper, slot.cluster);
            let _ = done.send(result);
        }
    }
}

fn execute_read(inner: &Arc<EngineInner>, slot: &Arc<Slot>, sub: SubRequest) {
    slot.set_state(SlotState::Reading);
    let stack = inner.stack.read().clone();
    let result = (|| -> Result<Vec<u8>> {
        let mut buf = vec![0u8; sub.sectors as usize * SECTOR_SIZE as usize];
        if let Some((delta, phys)) = stack.lookup(sub.cluster)? {
            delta.read_range(phys, sub.offset_sectors as u64 * SECTOR_SIZE, &mut buf)?;
        }
        // A hole everywhere reads as zeros.
        Ok(buf)
    })();
    match result {
        Ok(buf) => sub.complete_read(&buf),
        Err(e) => sub.complete_err(e),
    }
}

fn execute_write(inner: &Arc<EngineInner>, slot: &Arc<Slot>, sub: SubRequest) {
    let mut group = vec![sub];

    // Coalesce immediately following contiguous writes into one
    // backing I/O; completions still fire per piece, in order.
    {
        let mut si = slot.inner.lock();
        loop {
            let contiguous = match si.queue.front() {
                Some(SlotOp::Io(next)) => {
                    let last = &group[group.len() - 1];
                    next.is_write()
                        && next.cancel.as_ref().is_none_or(|t| !t.is_cancelled())
                        && next.offset_sectors == last.offset_sectors + last.sectors
                }
                _ => false,
            };
            if !contiguous {
                break;
            }
            match si.queue.pop_front() {
                Some(SlotOp::Io(next)) => group.push(next),
                _ => break,
            }
        }
    }

    let stack = inner.stack.read().clone();
    let result = write_group(inner, &stack, slot, &group);

    if matches!(result, Err(Error::OutOfSpace)) {
        // Read-only until grown.
        stack.top().mark_space_exhausted();
    }

    match result {
        Ok(()) => {
            if let Some(tracker) = inner.merge_tracker.lock().as_mut() {
                tracker.redirty.insert(slot.cluster);
            }
            for sub in &group {
                sub.complete_ok();
            }
        }
        Err(e) => {
            for sub in &group {
                sub.complete_err(e.clone());
            }
        }
    }
}

/// Execute one write group against the top delta.
fn write_group(
    inner: &Arc<EngineInner>,
    stack: &Arc<DeltaStack>,
    slot: &Arc<Slot>,
    group: &[SubRequest],
) -> Result<()> {
    let cluster = group[0].cluster;
    let top = stack.top().clone();
    top.ensure_writable()?;

    let shift = stack.cluster_shift();
    let first_off = group[0].offset_sectors as u64;
    let total_sectors: u64 = group.iter().map(|s| s.sectors as u64).sum();
    let full_cover = first_off == 0 && total_sectors == cluster_sectors(shift);

    if let Some(phys) = top.lookup(cluster)? {
        // In-place write: the cluster already lives in the top, its
        // content outside the payload is valid, no metadata changes.
        slot.set_state(SlotState::Writing);
        let data = concat_payload(group);
        top.write_range(phys, first_off * SECTOR_SIZE, &data)?;
        top.flush()?;
        return Ok(());
    }

    let below = stack.lookup_below_top(cluster)?;
    let metrics = Metrics::global();
    if below.is_some() {
        slot.set_state(SlotState::CopyingUp);
        metrics.engine.copy_ups.inc();
    } else {
        slot.set_state(SlotState::Allocating);
        metrics.engine.allocations.inc();
    }

    let new_phys = top.allocate_tail()?;

    if full_cover {
        // Bulk writeback: the write covers the whole cluster, so the
        // pre-image read is elided.
        let data = concat_payload(group);
        top.write_range(new_phys as u64, 0, &data)?;
    } else {
        let mut buf = vec![0u8; cluster_bytes(shift) as usize];
        if let Some((delta, phys)) = below {
            delta.read_range(phys, 0, &mut buf)?;
        }
        for sub in group {
            if let Some(payload) = &sub.payload {
                let at = sub.offset_sectors as usize * SECTOR_SIZE as usize;
                buf[at..at + payload.len()].copy_from_slice(payload);
            }
        }
        top.write_range(new_phys as u64, 0, &buf)?;
    }
    top.flush()?;

    // The mapping becomes visible (and the write completes) only once
    // the BAT update is durable.
    let ticket = inner.pipeline.record_write(&top, cluster, new_phys)?;
    inner.pipeline.wait_committed(top.id(), ticket)?;
    Ok(())
}

fn concat_payload(group: &[SubRequest]) -> Bytes {
    if group.len() == 1 {
        return group[0].payload.clone().unwrap_or_default();
    }
    let total: usize = group
        .iter()
        .map(|s| s.payload.as_ref().map_or(0, Bytes::len))
        .sum();
    let mut buf = BytesMut::with_capacity(total);
    for sub in group {
        if let Some(payload) = &sub.payload {
            buf.extend_from_slice(payload);
        }
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_gate_orders_writers_before_later_readers() {
        let gate = Arc::new(SubmitGate::new());
        gate.register_writer();

        let reader_gate = gate.clone();
        let entered = Arc::new(AtomicBool::new(false));
        let entered_clone = entered.clone();
        let reader = std::thread::spawn(move || {
            let _g = reader_gate.enter_read();
            entered_clone.store(true, Ordering::SeqCst);
        });

        // The registered writer keeps the reader out until released.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        let w = gate.acquire_registered();
        drop(w);
        reader.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_inflight_gate_drains() {
        let gate = Arc::new(InflightGate::new());
        gate.enter();
        gate.enter();
        let waiter_gate = gate.clone();
        let drained = Arc::new(AtomicBool::new(false));
        let drained_clone = drained.clone();
        let waiter = std::thread::spawn(move || {
            waiter_gate.wait_drained();
            drained_clone.store(true, Ordering::SeqCst);
        });
        gate.exit();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!drained.load(Ordering::SeqCst));
        gate.exit();
        waiter.join().unwrap();
        assert!(drained.load(Ordering::SeqCst));
    }
}
