//! Core type definitions for the deltadisk engine
//!
//! Sector-native geometry types shared by every layer of the stack. All
//! sizes in the system are expressed in 512-byte sectors; cluster sizes are
//! powers of two recorded as a shift (log2 of the cluster size in sectors).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Size of one logical sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// log2 of [`SECTOR_SIZE`].
pub const SECTOR_SHIFT: u32 = 9;

/// Minimum supported cluster shift (4 KiB clusters).
pub const MIN_CLUSTER_SHIFT: u32 = 3;

/// Maximum supported cluster shift (1 GiB clusters).
pub const MAX_CLUSTER_SHIFT: u32 = 21;

/// Physical cluster index 0 is reserved: a BAT entry of 0 means "hole".
pub const HOLE: u32 = 0;

/// Identifier of one delta within a stack, assigned in open order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DeltaId(pub u32);

impl fmt::Display for DeltaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delta#{}", self.0)
    }
}

/// Monotonically increasing metadata generation counter.
///
/// The highest durably persisted generation in a delta's header defines the
/// visible mapping after crash recovery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Generation(pub u64);

impl Generation {
    /// The generation a freshly created image starts at.
    pub const INITIAL: Generation = Generation(1);

    /// The next generation in sequence.
    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// Shared cancellation flag observed by long-running control operations.
///
/// Cancellation is honoured only at quiescence checks: work already
/// committed when the token fires stays committed.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cluster size in bytes for a given cluster shift.
pub fn cluster_bytes(cluster_shift: u32) -> u64 {
    SECTOR_SIZE << cluster_shift
}

/// Cluster size in sectors for a given cluster shift.
pub fn cluster_sectors(cluster_shift: u32) -> u64 {
    1u64 << cluster_shift
}

/// Number of clusters needed to cover `bytes`.
pub fn clusters_for_bytes(bytes: u64, cluster_shift: u32) -> u64 {
    let size = cluster_bytes(cluster_shift);
    bytes.div_ceil(size)
}
