//! Metadata commit pipeline
//!
//! A single background worker drains dirty BAT pages into commit
//! transactions. Per delta, a transaction seals the dirty-page set under a
//! generation number `G`, writes every sealed page stamped `G`, flushes,
//! writes the delta header with generation `G`, flushes again, then wakes
//! every waiter with a ticket ≤ `G`. Pages dirtied after sealing belong to
//! the next transaction.
//!
//! Producers are throttled two ways: the dirty-page budget suspends a
//! producer that would dirty another page while the pipeline is full, and
//! above the backpressure watermark the translator refuses new writes with
//! a transient error before they ever reach a slot.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::core::config::PipelineConfig;
use crate::core::error::{Error, Result};
use crate::core::types::{DeltaId, Generation};
use crate::delta::Delta;
use crate::format::bat_position;
use crate::system::metrics::Metrics;

enum PipeMsg {
    /// Dirty pages are waiting; commit at the next opportunity.
    Kick,
    /// Commit everything pending and reply when durable.
    CommitAll(Sender<Result<()>>),
}

/// Per-delta pipeline bookkeeping.
struct DeltaPipe {
    delta: Arc<Delta>,
    /// Generation the next commit transaction will carry.
    pending: u64,
    /// Highest durable generation.
    committed: u64,
    /// Pages awaiting the next transaction.
    dirty: BTreeSet<u32>,
    /// Set once a commit write failed; waiters and future producers get
    /// this error and the delta is taken offline.
    failed: Option<Error>,
}

#[derive(Default)]
struct PipeState {
    deltas: HashMap<DeltaId, DeltaPipe>,
    total_dirty: usize,
}

struct PipelineShared {
    state: Mutex<PipeState>,
    /// Producers waiting on the dirty-page budget.
    budget_cond: Condvar,
    /// Waiters on committed generations.
    commit_cond: Condvar,
    dirty_budget: usize,
    watermark: usize,
    /// Lock-free mirror of `total_dirty` for the translator's watermark
    /// check.
    dirty_total: AtomicUsize,
}

/// Handle to the pipeline worker.
pub(crate) struct Pipeline {
    shared: Arc<PipelineShared>,
    tx: Mutex<Option<Sender<PipeMsg>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    pub(crate) fn start(config: &PipelineConfig) -> std::io::Result<Self> {
        let shared = Arc::new(PipelineShared {
            state: Mutex::new(PipeState::default()),
            budget_cond: Condvar::new(),
            commit_cond: Condvar::new(),
            dirty_budget: config.dirty_page_budget,
            watermark: config.backpressure_watermark,
            dirty_total: AtomicUsize::new(0),
        });
        let (tx, rx) = unbounded();
        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("dd-pipeline".into())
            .spawn(move || run_pipeline(worker_shared, rx))?;
        Ok(Self {
            shared,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Whether the translator should refuse new writes.
    pub(crate) fn over_watermark(&self) -> bool {
        self.shared.dirty_total.load(Ordering::SeqCst) > self.shared.watermark
    }

    /// Record a new mapping `cluster → phys` in `delta`'s BAT and queue its
    /// page for commit. Returns the ticket generation the caller must wait
    /// for before reporting completion upward.
    ///
    /// Suspends while the dirty-page budget is exhausted, unless the page
    /// is already dirty (re-dirtying an accounted page is free).
    pub(crate) fn record_write(
        &self,
        delta: &Arc<Delta>,
        cluster: u64,
        phys: u32,
    ) -> Result<Generation> {
        let bat = delta
            .bat()
            .ok_or_else(|| Error::invalid_argument("raw base carries no BAT"))?;
        // Load and pin the page outside the pipeline lock: the load may do
        // backing I/O.
        let pin = bat.pin_for(cluster)?;
        let (page_idx, _) = bat_position(cluster);

        let mut state = self.shared.state.lock();
        loop {
            let already_dirty = state
                .deltas
                .get(&delta.id())
                .is_some_and(|dp| dp.dirty.contains(&page_idx));
            if already_dirty || state.total_dirty < self.shared.dirty_budget {
                break;
            }
            Metrics::global().pipeline.backpressure_stalls.inc();
            self.shared.budget_cond.wait(&mut state);
        }

        let st = &mut *state;
        let generation = delta.generation().0;
        let dp = st.deltas.entry(delta.id()).or_insert_with(|| DeltaPipe {
            delta: delta.clone(),
            pending: generation + 1,
            committed: generation,
            dirty: BTreeSet::new(),
            failed: None,
        });
        if let Some(e) = &dp.failed {
            return Err(e.clone());
        }

        bat.set_entry(&pin, cluster, phys);
        if dp.dirty.insert(page_idx) {
            st.total_dirty += 1;
            self.shared
                .dirty_total
                .store(st.total_dirty, Ordering::SeqCst);
            Metrics::global()
                .pipeline
                .dirty_pages
                .set(st.total_dirty as i64);
        }
        let ticket = Generation(dp.pending);
        drop(state);

        self.kick();
        Ok(ticket)
    }

    /// Block until `delta`'s committed generation reaches `ticket`.
    pub(crate) fn wait_committed(&self, delta_id: DeltaId, ticket: Generation) -> Result<()> {
        let mut state = self.shared.state.lock();
        loop {
            let dp = match state.deltas.get(&delta_id) {
                Some(dp) => dp,
                // Nothing pending for this delta: already durable.
                None => return Ok(()),
            };
            if dp.committed >= ticket.0 {
                return Ok(());
            }
            if let Some(e) = &dp.failed {
                return Err(e.clone());
            }
            self.shared.commit_cond.wait(&mut state);
        }
    }

    /// Force a commit of everything pending and wait until durable.
    pub(crate) fn commit_all(&self) -> Result<()> {
        let (reply_tx, reply_rx) = unbounded();
        {
            let tx = self.tx.lock();
            match tx.as_ref() {
                Some(tx) => tx
                    .send(PipeMsg::CommitAll(reply_tx))
                    .map_err(|_| Error::Closed)?,
                None => return Err(Error::Closed),
            }
        }
        reply_rx.recv().map_err(|_| Error::Closed)?
    }

    /// Drop pipeline bookkeeping for a delta that left the stack (merge)
    /// or was reopened (grow). Only valid once its dirty set is empty.
    pub(crate) fn forget(&self, delta_id: DeltaId) {
        let mut state = self.shared.state.lock();
        if let Some(dp) = state.deltas.get(&delta_id) {
            debug_assert!(dp.dirty.is_empty());
        }
        state.deltas.remove(&delta_id);
    }

    /// Commit what remains and stop the worker.
    pub(crate) fn shutdown(&self) {
        let _ = self.commit_all();
        self.tx.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn kick(&self) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(PipeMsg::Kick);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_pipeline(shared: Arc<PipelineShared>, rx: Receiver<PipeMsg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            PipeMsg::Kick => {
                let _ = commit_pass(&shared);
            }
            PipeMsg::CommitAll(reply) => {
                let result = commit_pass(&shared);
                let _ = reply.send(result);
            }
        }
    }
}

/// Commit every delta with dirty pages. Returns the first error, after
/// attempting the rest.
fn commit_pass(shared: &Arc<PipelineShared>) -> Result<()> {
    let targets: Vec<DeltaId> = {
        let state = shared.state.lock();
        state
            .deltas
            .iter()
            .filter(|(_, dp)| !dp.dirty.is_empty())
            .map(|(id, _)| *id)
            .collect()
    };

    let mut first_err = Ok(());
    for id in targets {
        if let Err(e) = commit_delta(shared, id) {
            if first_err.is_ok() {
                first_err = Err(e);
            }
        }
    }
    first_err
}

/// Run one commit transaction for one delta.
fn commit_delta(shared: &Arc<PipelineShared>, id: DeltaId) -> Result<()> {
    // Seal: take the dirty set, assign the transaction generation, and
    // snapshot the page contents while still holding the pipeline lock.
    // Entries dirtied from here on belong to the next transaction and must
    // not leak into this one's page images (their data would otherwise
    // become visible under a generation their writer never waited for).
    let (delta, generation, sealed) = {
        let mut state = shared.state.lock();
        let st = &mut *state;
        let dp = match st.deltas.get_mut(&id) {
            Some(dp) => dp,
            None => return Ok(()),
        };
        if dp.dirty.is_empty() {
            return Ok(());
        }
        let generation = Generation(dp.pending);
        dp.pending += 1;
        let pages: Vec<u32> = std::mem::take(&mut dp.dirty).into_iter().collect();
        st.total_dirty -= pages.len();
        shared.dirty_total.store(st.total_dirty, Ordering::SeqCst);
        Metrics::global()
            .pipeline
            .dirty_pages
            .set(st.total_dirty as i64);
        let delta = dp.delta.clone();
        let sealed: Vec<(u32, Vec<u32>)> = match delta.bat() {
            Some(bat) => pages
                .iter()
                .filter_map(|&page| bat.seal_page(page).map(|entries| (page, entries)))
                .collect(),
            None => Vec::new(),
        };
        (delta, generation, sealed)
    };
    // Producers blocked on the budget can make progress now.
    shared.budget_cond.notify_all();

    let metrics = Metrics::global();
    let timer = metrics.pipeline.commit_seconds.start_timer();
    let result = write_transaction(&delta, generation, &sealed);
    timer.observe_duration();

    let mut state = shared.state.lock();
    if let Some(dp) = state.deltas.get_mut(&id) {
        match &result {
            Ok(()) => {
                dp.committed = generation.0;
                delta.set_committed_generation(generation);
                if let Some(bat) = delta.bat() {
                    for (page, _) in &sealed {
                        bat.commit_page(*page);
                    }
                }
                metrics.pipeline.commits.inc();
                metrics.pipeline.pages_committed.inc_by(sealed.len() as u64);
                tracing::debug!(
                    delta = %id,
                    generation = %generation,
                    pages = sealed.len(),
                    "metadata transaction committed"
                );
            }
            Err(e) => {
                // Not fatal for crash consistency: the data covered by
                // these pages is simply invisible on the next open. The
                // delta is done taking writes though.
                dp.failed = Some(e.clone());
                delta.mark_failed();
                tracing::error!(delta = %id, error = %e, "metadata commit failed; delta offline");
            }
        }
    }
    drop(state);
    shared.commit_cond.notify_all();
    shared.budget_cond.notify_all();
    result
}

/// The durable write sequence of one transaction.
fn write_transaction(
    delta: &Arc<Delta>,
    generation: Generation,
    sealed: &[(u32, Vec<u32>)],
) -> Result<()> {
    for (page_idx, entries) in sealed {
        delta.write_bat_page(*page_idx, generation, entries)?;
    }
    delta.flush()?;
    delta.write_header_generation(generation)?;
    delta.flush()?;
    Ok(())
}
