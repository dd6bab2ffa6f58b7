//! BAT cache: the in-memory image of a delta's block allocation table
//!
//! Pages are demand-loaded at 4 KiB granularity, evicted clean-and-unpinned
//! only (LRU), and pinned while dirty. A page moves Clean → Dirty when an
//! entry is set, Dirty → Writing when the metadata pipeline seals a commit
//! transaction, and Writing → Clean once that transaction is durable —
//! unless a new write re-dirtied it in the meantime.
//!
//! Loading applies the recovery rule: a page whose on-disk generation stamp
//! exceeds the delta's committed generation was written by a commit that
//! never became durable, and reads as all-hole.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::error::Result;
use crate::core::types::{Generation, HOLE};
use crate::format::{
    self, bat_position, decode_bat_page, BAT_ENTRIES_PER_PAGE, BAT_PAGE_SIZE,
};
use crate::system::metrics::Metrics;

use super::backing::BackingStore;

/// Lifecycle state of a resident BAT page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PageState {
    /// In sync with stable storage; evictable when unpinned.
    Clean,
    /// Holds entries newer than stable storage; pinned.
    Dirty,
    /// Sealed into an in-flight commit transaction.
    Writing,
}

struct PageInner {
    entries: Vec<u32>,
    state: PageState,
}

/// One resident BAT page.
pub(crate) struct BatPage {
    inner: Mutex<PageInner>,
    pins: AtomicU32,
}

/// Pin on a resident page, preventing eviction while held.
pub(crate) struct PagePin {
    page: Arc<BatPage>,
}

impl PagePin {
    pub(crate) fn page(&self) -> &Arc<BatPage> {
        &self.page
    }
}

impl Drop for PagePin {
    fn drop(&mut self) {
        self.page.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PageMap {
    map: HashMap<u32, Arc<BatPage>>,
    /// Access order for clean-page eviction, least recent first.
    lru: Vec<u32>,
}

/// Per-delta BAT cache.
pub(crate) struct BatCache {
    backing: Arc<dyn BackingStore>,
    cluster_shift: u32,
    entries_total: AtomicU32,
    /// Committed generation of the owning delta; the recovery bound for
    /// page stamps seen at load time. Shared with the delta itself.
    committed: Arc<AtomicU64>,
    resident_cap: usize,
    pages: Mutex<PageMap>,
}

impl BatCache {
    pub(crate) fn new(
        backing: Arc<dyn BackingStore>,
        cluster_shift: u32,
        entries_total: u32,
        committed: Arc<AtomicU64>,
        resident_cap: usize,
    ) -> Self {
        Self {
            backing,
            cluster_shift,
            entries_total: AtomicU32::new(entries_total),
            committed,
            resident_cap,
            pages: Mutex::new(PageMap {
                map: HashMap::new(),
                lru: Vec::new(),
            }),
        }
    }

    pub(crate) fn entries_total(&self) -> u32 {
        self.entries_total.load(Ordering::SeqCst)
    }

    /// Look up the physical cluster mapped for `cluster`, if any.
    pub(crate) fn lookup(&self, cluster: u64) -> Result<Option<u32>> {
        if cluster >= self.entries_total() as u64 {
            return Ok(None);
        }
        let (page_idx, slot) = bat_position(cluster);
        let page = self.page(page_idx)?;
        let inner = page.inner.lock();
        let entry = inner.entries[slot];
        if entry == HOLE {
            Ok(None)
        } else {
            Ok(Some(entry))
        }
    }

    /// Pin the page covering `cluster`, loading it if necessary.
    ///
    /// Mutations go through a pin so the page cannot be evicted between
    /// the load and the entry update.
    pub(crate) fn pin_for(&self, cluster: u64) -> Result<PagePin> {
        let (page_idx, _) = bat_position(cluster);
        let page = self.page(page_idx)?;
        page.pins.fetch_add(1, Ordering::SeqCst);
        Ok(PagePin { page })
    }

    /// Set the entry for `cluster` through a held pin, dirtying the page.
    pub(crate) fn set_entry(&self, pin: &PagePin, cluster: u64, phys: u32) {
        let (_, slot) = bat_position(cluster);
        let page = pin.page();
        let mut inner = page.inner.lock();
        inner.entries[slot] = phys;
        match inner.state {
            PageState::Clean => {
                // The dirty state itself holds one pin until the page is
                // committed back to Clean.
                page.pins.fetch_add(1, Ordering::SeqCst);
                inner.state = PageState::Dirty;
            }
            PageState::Writing => {
                // Re-dirtied while a commit is in flight; the commit keeps
                // the existing dirty pin alive.
                inner.state = PageState::Dirty;
            }
            PageState::Dirty => {}
        }
    }

    /// Seal a dirty page into a commit transaction: returns a snapshot of
    /// its entries and marks it Writing. `None` if the page is not dirty
    /// (it was already committed by an earlier pass).
    pub(crate) fn seal_page(&self, page_idx: u32) -> Option<Vec<u32>> {
        let page = {
            let pages = self.pages.lock();
            pages.map.get(&page_idx)?.clone()
        };
        let mut inner = page.inner.lock();
        if inner.state != PageState::Dirty {
            return None;
        }
        inner.state = PageState::Writing;
        Some(inner.entries.clone())
    }

    /// Mark a sealed page durable. If it was re-dirtied during the commit
    /// it stays dirty (and pinned) for the next transaction.
    pub(crate) fn commit_page(&self, page_idx: u32) {
        let page = {
            let pages = self.pages.lock();
            match pages.map.get(&page_idx) {
                Some(p) => p.clone(),
                None => return,
            }
        };
        let mut inner = page.inner.lock();
        if inner.state == PageState::Writing {
            inner.state = PageState::Clean;
            page.pins.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Walk every present mapping, calling `f(logical, physical)`.
    ///
    /// Loads each BAT page in turn; used by merge sweeps and BAT-region
    /// grow, not by the I/O path.
    pub(crate) fn scan(&self, mut f: impl FnMut(u64, u32)) -> Result<()> {
        let total = self.entries_total() as u64;
        let pages = format::bat_pages(self.entries_total());
        for page_idx in 0..pages {
            let page = self.page(page_idx)?;
            let inner = page.inner.lock();
            let base = page_idx as u64 * BAT_ENTRIES_PER_PAGE as u64;
            for (slot, &entry) in inner.entries.iter().enumerate() {
                let cluster = base + slot as u64;
                if cluster >= total {
                    break;
                }
                if entry != HOLE {
                    f(cluster, entry);
                }
            }
        }
        Ok(())
    }

    /// Fetch a page, loading from the backing store on miss.
    fn page(&self, page_idx: u32) -> Result<Arc<BatPage>> {
        {
            let mut pages = self.pages.lock();
            if let Some(page) = pages.map.get(&page_idx) {
                let page = page.clone();
                touch_lru(&mut pages.lru, page_idx);
                Metrics::global().cache.bat_hits.inc();
                return Ok(page);
            }
        }
        Metrics::global().cache.bat_misses.inc();

        // Load without holding the map lock.
        let mut buf = [0u8; BAT_PAGE_SIZE];
        self.backing
            .read_at(&mut buf, format::bat_page_offset(self.cluster_shift, page_idx))?;
        let (stamp, mut entries) = decode_bat_page(&buf);

        // Recovery rule: a stamp from the future belongs to a commit that
        // never became durable. The whole page reads as holes.
        if stamp.0 > self.committed.load(Ordering::SeqCst) {
            tracing::warn!(
                page = page_idx,
                stamp = stamp.0,
                committed = self.committed.load(Ordering::SeqCst),
                "BAT page stamped past committed generation; treating as holes"
            );
            entries = vec![HOLE; BAT_ENTRIES_PER_PAGE];
        }

        let mut pages = self.pages.lock();
        // Double-check: someone else may have loaded it meanwhile.
        if let Some(page) = pages.map.get(&page_idx) {
            let page = page.clone();
            touch_lru(&mut pages.lru, page_idx);
            return Ok(page);
        }

        self.evict_locked(&mut pages);

        let page = Arc::new(BatPage {
            inner: Mutex::new(PageInner {
                entries,
                state: PageState::Clean,
            }),
            pins: AtomicU32::new(0),
        });
        pages.map.insert(page_idx, page.clone());
        pages.lru.push(page_idx);
        Ok(page)
    }

    /// Evict clean unpinned pages while over the residency cap.
    fn evict_locked(&self, pages: &mut PageMap) {
        while pages.map.len() >= self.resident_cap {
            let victim = pages.lru.iter().copied().find(|idx| {
                pages.map.get(idx).is_some_and(|p| {
                    p.pins.load(Ordering::SeqCst) == 0
                        && p.inner.lock().state == PageState::Clean
                })
            });
            match victim {
                Some(idx) => {
                    pages.map.remove(&idx);
                    pages.lru.retain(|&i| i != idx);
                    Metrics::global().cache.bat_evictions.inc();
                }
                // Everything is pinned or dirty; run over cap rather than
                // block the I/O path.
                None => break,
            }
        }
    }
}

fn touch_lru(lru: &mut Vec<u32>, page_idx: u32) {
    lru.retain(|&i| i != page_idx);
    lru.push(page_idx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::sim::SimBacking;
    use crate::format::encode_bat_page;

    fn cache_over(sim: &SimBacking, entries: u32, committed: u64) -> BatCache {
        BatCache::new(
            Arc::new(sim.clone()),
            3, // 4 KiB clusters
            entries,
            Arc::new(AtomicU64::new(committed)),
            8,
        )
    }

    fn seed_page(sim: &SimBacking, page_idx: u32, stamp: u64, entries: &[u32]) {
        let buf = encode_bat_page(Generation(stamp), entries);
        sim.write_at(&buf, format::bat_page_offset(3, page_idx))
            .unwrap();
        sim.flush().unwrap();
    }

    #[test]
    fn test_lookup_and_set() {
        let sim = SimBacking::new();
        let mut entries = vec![0u32; BAT_ENTRIES_PER_PAGE];
        entries[5] = 9;
        seed_page(&sim, 0, 1, &entries);

        let cache = cache_over(&sim, 100, 1);
        assert_eq!(cache.lookup(5).unwrap(), Some(9));
        assert_eq!(cache.lookup(6).unwrap(), None);
        // Beyond the addressable range.
        assert_eq!(cache.lookup(100).unwrap(), None);

        let pin = cache.pin_for(6).unwrap();
        cache.set_entry(&pin, 6, 12);
        assert_eq!(cache.lookup(6).unwrap(), Some(12));
    }

    #[test]
    fn test_future_stamp_reads_as_holes() {
        let sim = SimBacking::new();
        let mut entries = vec![0u32; BAT_ENTRIES_PER_PAGE];
        entries[0] = 7;
        // Stamp 5 but the delta only committed up to 3.
        seed_page(&sim, 0, 5, &entries);

        let cache = cache_over(&sim, 100, 3);
        assert_eq!(cache.lookup(0).unwrap(), None);
    }

    #[test]
    fn test_seal_and_commit_lifecycle() {
        let sim = SimBacking::new();
        seed_page(&sim, 0, 1, &vec![0u32; BAT_ENTRIES_PER_PAGE]);
        let cache = cache_over(&sim, 100, 1);

        let pin = cache.pin_for(3).unwrap();
        cache.set_entry(&pin, 3, 4);
        drop(pin);

        let sealed = cache.seal_page(0).expect("page is dirty");
        assert_eq!(sealed[3], 4);
        // Not dirty any more, so a second seal finds nothing.
        assert!(cache.seal_page(0).is_none());

        cache.commit_page(0);
        assert_eq!(cache.lookup(3).unwrap(), Some(4));
    }

    #[test]
    fn test_redirty_during_commit_stays_dirty() {
        let sim = SimBacking::new();
        seed_page(&sim, 0, 1, &vec![0u32; BAT_ENTRIES_PER_PAGE]);
        let cache = cache_over(&sim, 100, 1);

        let pin = cache.pin_for(3).unwrap();
        cache.set_entry(&pin, 3, 4);
        let _sealed = cache.seal_page(0).unwrap();

        // Re-dirty while the commit is in flight.
        cache.set_entry(&pin, 3, 5);
        cache.commit_page(0);

        // The newer value must still be sealable for the next transaction.
        let sealed = cache.seal_page(0).expect("re-dirtied page");
        assert_eq!(sealed[3], 5);
    }
}
