//! Delta files and the delta stack
//!
//! A delta is one backing file in the stack. The topmost delta accepts
//! writes; everything below is read-only. Three kinds exist: a raw base (a
//! flat file with no header or BAT that unconditionally covers the whole
//! virtual range), an image base, and an image delta. Image kinds carry the
//! on-disk header and a BAT mapping logical clusters to physical clusters
//! within the same file.

/// Backing store abstraction and the file implementation
pub mod backing;
/// BAT cache
pub(crate) mod bat;
/// Fault-injecting in-memory backing store for crash tests
pub mod sim;
/// The delta stack and stack descriptors
pub mod stack;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::core::config::EngineConfig;
use crate::core::error::{Error, Result};
use crate::core::types::{cluster_bytes, clusters_for_bytes, DeltaId, Generation, MAX_CLUSTER_SHIFT, MIN_CLUSTER_SHIFT};
use crate::format::{self, DeltaHeader, BAT_PAGE_SIZE, FLAG_BASE};
use crate::system::metrics::Metrics;

use backing::BackingStore;
use bat::BatCache;

/// The three delta kinds. Dispatch is on the tag; there is no inheritance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaKind {
    /// Flat file, no header, no BAT; covers the whole virtual range
    RawBase,
    /// Image file at the bottom of the stack
    ImageBase,
    /// Image file layered above a base
    ImageDelta,
}

impl DeltaKind {
    /// Whether this kind carries a header and BAT.
    pub fn is_image(self) -> bool {
        !matches!(self, DeltaKind::RawBase)
    }
}

/// Per-delta tuning derived from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct DeltaOptions {
    /// In-flight backing request budget
    pub max_inflight: usize,
    /// Resident BAT page budget
    pub bat_cache_pages: usize,
}

impl Default for DeltaOptions {
    fn default() -> Self {
        Self {
            max_inflight: 128,
            bat_cache_pages: 1024,
        }
    }
}

impl From<&EngineConfig> for DeltaOptions {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            max_inflight: cfg.max_inflight_per_delta,
            bat_cache_pages: cfg.bat_cache_pages,
        }
    }
}

/// Bounded in-flight request budget, so a slow lower layer cannot starve
/// the top of backing-queue slots.
struct IoBudget {
    max: usize,
    active: Mutex<usize>,
    cond: Condvar,
}

impl IoBudget {
    fn new(max: usize) -> Self {
        Self {
            max,
            active: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self) -> BudgetGuard<'_> {
        let mut active = self.active.lock();
        while *active >= self.max {
            self.cond.wait(&mut active);
        }
        *active += 1;
        BudgetGuard { budget: self }
    }
}

struct BudgetGuard<'a> {
    budget: &'a IoBudget,
}

impl Drop for BudgetGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.budget.active.lock();
        *active -= 1;
        self.budget.cond.notify_one();
    }
}

struct AllocState {
    /// Next tail physical cluster; allocation is monotonic.
    next_tail: u32,
    /// First physical cluster usable for data (everything below is header
    /// and BAT region).
    first_data: u32,
    /// Physical slots vacated by relocate, reusable only as relocate
    /// destinations.
    free: Vec<u32>,
}

/// One backing file in the stack.
pub struct Delta {
    id: DeltaId,
    kind: DeltaKind,
    backing: Arc<dyn BackingStore>,
    cluster_shift: u32,
    virtual_clusters: u64,
    flags: u32,
    read_only: AtomicBool,
    failed: AtomicBool,
    space_exhausted: AtomicBool,
    /// Highest durably committed metadata generation (shared with the BAT
    /// cache as its recovery bound).
    committed: Arc<AtomicU64>,
    alloc: Mutex<AllocState>,
    bat: Option<BatCache>,
    budget: IoBudget,
}

impl Delta {
    /// Create a fresh image file: header, zeroed BAT region, no data.
    pub fn create_image(
        id: DeltaId,
        backing: Arc<dyn BackingStore>,
        cluster_shift: u32,
        virtual_clusters: u64,
        flags: u32,
        opts: &DeltaOptions,
    ) -> Result<Self> {
        if !(MIN_CLUSTER_SHIFT..=MAX_CLUSTER_SHIFT).contains(&cluster_shift) {
            return Err(Error::invalid_argument(format!(
                "cluster shift {} out of range",
                cluster_shift
            )));
        }
        if virtual_clusters == 0 || virtual_clusters > u32::MAX as u64 {
            return Err(Error::invalid_argument(format!(
                "virtual size {} clusters not addressable",
                virtual_clusters
            )));
        }

        let bat_entries = virtual_clusters as u32;
        let header = DeltaHeader {
            cluster_shift,
            virtual_clusters,
            generation: Generation::INITIAL,
            bat_entries,
            flags,
        };
        backing.write_at(&header.encode(), 0)?;

        // Zeroed BAT pages stamped generation 0: all-hole and always older
        // than the header generation.
        let empty = format::encode_bat_page(Generation(0), &[]);
        for page in 0..format::bat_pages(bat_entries) {
            backing.write_at(&empty, format::bat_page_offset(cluster_shift, page))?;
        }
        backing.flush()?;

        let kind = if flags & FLAG_BASE != 0 {
            DeltaKind::ImageBase
        } else {
            DeltaKind::ImageDelta
        };
        let len = backing.len()?;
        Ok(Self::assemble(id, kind, backing, header, len, false, opts))
    }

    /// Open an existing image file, validating the header and applying the
    /// crash-recovery rules.
    pub fn open_image(
        id: DeltaId,
        backing: Arc<dyn BackingStore>,
        read_only: bool,
        opts: &DeltaOptions,
    ) -> Result<Self> {
        let mut buf = [0u8; BAT_PAGE_SIZE];
        backing.read_at(&mut buf, 0).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::CorruptHeader("file shorter than a header".into())
            } else {
                Error::from(e)
            }
        })?;
        let header = DeltaHeader::decode(&buf)?;

        let kind = if header.flags & FLAG_BASE != 0 {
            DeltaKind::ImageBase
        } else {
            DeltaKind::ImageDelta
        };
        let len = backing.len()?;
        let delta = Self::assemble(id, kind, backing, header, len, read_only, opts);
        tracing::debug!(
            id = %delta.id,
            kind = ?delta.kind,
            generation = %delta.generation(),
            clusters = delta.virtual_clusters,
            "opened image delta"
        );
        Ok(delta)
    }

    /// Open a raw base. It has no header; the stack assigns its cluster
    /// size, and its length defines the virtual size it covers.
    pub fn open_raw(
        id: DeltaId,
        backing: Arc<dyn BackingStore>,
        cluster_shift: u32,
        writable: bool,
        opts: &DeltaOptions,
    ) -> Result<Self> {
        let len = backing.len()?;
        let virtual_clusters = clusters_for_bytes(len, cluster_shift);
        Ok(Self {
            id,
            kind: DeltaKind::RawBase,
            backing,
            cluster_shift,
            virtual_clusters,
            flags: 0,
            read_only: AtomicBool::new(!writable),
            failed: AtomicBool::new(false),
            space_exhausted: AtomicBool::new(false),
            committed: Arc::new(AtomicU64::new(0)),
            alloc: Mutex::new(AllocState {
                next_tail: 0,
                first_data: 0,
                free: Vec::new(),
            }),
            bat: None,
            budget: IoBudget::new(opts.max_inflight),
        })
    }

    fn assemble(
        id: DeltaId,
        kind: DeltaKind,
        backing: Arc<dyn BackingStore>,
        header: DeltaHeader,
        file_len: u64,
        read_only: bool,
        opts: &DeltaOptions,
    ) -> Self {
        let committed = Arc::new(AtomicU64::new(header.generation.0));
        let bat = BatCache::new(
            backing.clone(),
            header.cluster_shift,
            header.bat_entries,
            committed.clone(),
            opts.bat_cache_pages,
        );
        let first_data = format::first_data_cluster(header.cluster_shift, header.bat_entries);
        let csize = cluster_bytes(header.cluster_shift);
        let next_tail = (file_len.div_ceil(csize))
            .max(first_data as u64)
            .min(u32::MAX as u64) as u32;
        Self {
            id,
            kind,
            backing,
            cluster_shift: header.cluster_shift,
            virtual_clusters: header.virtual_clusters,
            flags: header.flags,
            read_only: AtomicBool::new(read_only),
            failed: AtomicBool::new(false),
            space_exhausted: AtomicBool::new(false),
            committed,
            alloc: Mutex::new(AllocState {
                next_tail,
                first_data,
                free: Vec::new(),
            }),
            bat: Some(bat),
            budget: IoBudget::new(opts.max_inflight),
        }
    }

    /// Identifier within the stack.
    pub fn id(&self) -> DeltaId {
        self.id
    }

    /// Delta kind tag.
    pub fn kind(&self) -> DeltaKind {
        self.kind
    }

    /// log2 of the cluster size in sectors.
    pub fn cluster_shift(&self) -> u32 {
        self.cluster_shift
    }

    /// Cluster size in bytes.
    pub fn cluster_bytes(&self) -> u64 {
        cluster_bytes(self.cluster_shift)
    }

    /// Virtual size covered by this delta, in clusters.
    pub fn virtual_clusters(&self) -> u64 {
        self.virtual_clusters
    }

    /// Highest durably committed metadata generation.
    pub fn generation(&self) -> Generation {
        Generation(self.committed.load(Ordering::SeqCst))
    }

    /// Number of data clusters currently allocated past the BAT region.
    pub fn allocated_clusters(&self) -> u64 {
        let alloc = self.alloc.lock();
        (alloc.next_tail - alloc.first_data) as u64
    }

    /// First physical cluster index usable for data.
    pub fn first_data_cluster(&self) -> u32 {
        self.alloc.lock().first_data
    }

    /// Whether writes are refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Freeze or thaw this delta for writes.
    pub fn set_read_only(&self, ro: bool) {
        self.read_only.store(ro, Ordering::SeqCst);
    }

    /// Whether the delta was taken offline after a metadata failure.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_space_exhausted(&self) {
        self.space_exhausted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_space_exhausted(&self) {
        self.space_exhausted.store(false, Ordering::SeqCst);
    }

    /// Check that this delta accepts writes right now.
    pub fn ensure_writable(&self) -> Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::BackingIo {
                kind: io::ErrorKind::Other,
                message: "delta is offline after a metadata failure".into(),
            });
        }
        if self.space_exhausted.load(Ordering::SeqCst) {
            return Err(Error::OutOfSpace);
        }
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::invalid_argument("write to a read-only delta"));
        }
        Ok(())
    }

    pub(crate) fn backing_arc(&self) -> Arc<dyn BackingStore> {
        self.backing.clone()
    }

    pub(crate) fn bat(&self) -> Option<&BatCache> {
        self.bat.as_ref()
    }

    /// Resolve a logical cluster to a physical cluster within this delta.
    ///
    /// A raw base maps every logical cluster it covers to itself; an image
    /// consults its BAT.
    pub fn lookup(&self, cluster: u64) -> Result<Option<u64>> {
        match &self.bat {
            None => {
                if cluster < self.virtual_clusters {
                    Ok(Some(cluster))
                } else {
                    Ok(None)
                }
            }
            Some(bat) => Ok(bat.lookup(cluster)?.map(u64::from)),
        }
    }

    /// Read part of a physical cluster into `buf`.
    pub fn read_range(&self, phys: u64, offset_in_cluster: u64, buf: &mut [u8]) -> Result<()> {
        let _guard = self.budget.acquire();
        let offset = phys * self.cluster_bytes() + offset_in_cluster;
        let metrics = Metrics::global();
        metrics.backing.reads.inc();
        metrics.backing.read_bytes.inc_by(buf.len() as u64);

        if self.kind == DeltaKind::RawBase {
            // The final cluster of a raw base may be partial; the tail
            // reads as zeros.
            let len = self.backing.len()?;
            if offset >= len {
                buf.fill(0);
                return Ok(());
            }
            let avail = ((len - offset).min(buf.len() as u64)) as usize;
            self.backing.read_at(&mut buf[..avail], offset)?;
            buf[avail..].fill(0);
            return Ok(());
        }

        self.backing.read_at(buf, offset)?;
        Ok(())
    }

    /// Write part of a physical cluster.
    pub fn write_range(&self, phys: u64, offset_in_cluster: u64, data: &[u8]) -> Result<()> {
        let _guard = self.budget.acquire();
        let offset = phys * self.cluster_bytes() + offset_in_cluster;
        let metrics = Metrics::global();
        metrics.backing.writes.inc();
        metrics.backing.write_bytes.inc_by(data.len() as u64);
        self.backing.write_at(data, offset)?;
        Ok(())
    }

    /// Durability barrier on the backing file.
    pub fn flush(&self) -> Result<()> {
        Metrics::global().backing.flushes.inc();
        self.backing.flush()?;
        Ok(())
    }

    /// Reserve the next tail cluster. Monotonic: tail slots are handed out
    /// in file order and never reused (relocate destinations are the only
    /// consumers of vacated slots).
    pub fn allocate_tail(&self) -> Result<u32> {
        let mut alloc = self.alloc.lock();
        if alloc.next_tail == u32::MAX {
            self.space_exhausted.store(true, Ordering::SeqCst);
            return Err(Error::OutOfSpace);
        }
        let slot = alloc.next_tail;
        alloc.next_tail += 1;
        Ok(slot)
    }

    /// Hand a vacated physical slot to the free list. Only called after
    /// the relocate that vacated it has a durable commit.
    pub(crate) fn grant_free(&self, phys: u32) {
        self.alloc.lock().free.push(phys);
    }

    /// Take a vacated slot for use as a relocate destination.
    pub(crate) fn take_free_slot(&self) -> Option<u32> {
        self.alloc.lock().free.pop()
    }

    /// Raise the floor of tail allocation (BAT-region grow) and drop free
    /// slots that the new metadata region swallows.
    pub(crate) fn reserve_metadata_region(&self, new_first_data: u32) {
        let mut alloc = self.alloc.lock();
        alloc.first_data = alloc.first_data.max(new_first_data);
        alloc.next_tail = alloc.next_tail.max(new_first_data);
        alloc.free.retain(|&slot| slot >= new_first_data);
    }

    /// Truncate unreferenced tail garbage (crash leftovers) on clean close.
    pub(crate) fn trim_tail(&self) -> Result<()> {
        let next_tail = self.alloc.lock().next_tail;
        self.backing.set_len(next_tail as u64 * self.cluster_bytes())?;
        Ok(())
    }

    /// Write one sealed BAT page stamped with its transaction generation.
    pub(crate) fn write_bat_page(
        &self,
        page_idx: u32,
        generation: Generation,
        entries: &[u32],
    ) -> Result<()> {
        let buf = format::encode_bat_page(generation, entries);
        self.backing
            .write_at(&buf, format::bat_page_offset(self.cluster_shift, page_idx))?;
        Ok(())
    }

    /// Rewrite the header with a new committed generation.
    pub(crate) fn write_header_generation(&self, generation: Generation) -> Result<()> {
        let header = DeltaHeader {
            cluster_shift: self.cluster_shift,
            virtual_clusters: self.virtual_clusters,
            generation,
            bat_entries: self.bat.as_ref().map_or(0, |b| b.entries_total()),
            flags: self.flags,
        };
        self.backing.write_at(&header.encode(), 0)?;
        Ok(())
    }

    pub(crate) fn set_committed_generation(&self, generation: Generation) {
        self.committed.store(generation.0, Ordering::SeqCst);
    }

    /// Rewrite the header with new geometry after a grow, keeping the
    /// current committed generation.
    pub(crate) fn write_header_geometry(
        &self,
        virtual_clusters: u64,
        bat_entries: u32,
    ) -> Result<()> {
        let header = DeltaHeader {
            cluster_shift: self.cluster_shift,
            virtual_clusters,
            generation: self.generation(),
            bat_entries,
            flags: self.flags,
        };
        self.backing.write_at(&header.encode(), 0)?;
        Ok(())
    }
}

impl std::fmt::Debug for Delta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delta")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("cluster_shift", &self.cluster_shift)
            .field("virtual_clusters", &self.virtual_clusters)
            .field("generation", &self.generation())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

/// Format a fresh image onto `backing`: header plus an all-hole BAT.
///
/// This is the bootstrap used by tests and by snapshot targets; preparing
/// production images stays with external tooling.
pub fn format_image(
    backing: &Arc<dyn BackingStore>,
    cluster_shift: u32,
    virtual_clusters: u64,
    base: bool,
) -> Result<()> {
    let flags = if base { FLAG_BASE } else { 0 };
    Delta::create_image(
        DeltaId(0),
        backing.clone(),
        cluster_shift,
        virtual_clusters,
        flags,
        &DeltaOptions::default(),
    )?;
    Ok(())
}
