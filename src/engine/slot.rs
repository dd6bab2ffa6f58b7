//! Cluster slots: per-cluster serialisation of in-flight work
//!
//! A slot owns all in-flight operations for one logical cluster. Exactly
//! one operation group executes at a time (the owner I/O); everything else
//! queues in arrival order. Slots are created on first access and removed
//! once idle with an empty queue.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::Mutex;

use crate::core::error::Result;
use crate::delta::Delta;

use super::request::SubRequest;

/// State of a cluster slot, as driven by the operation it is executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// No I/O in flight
    Idle,
    /// Read from some layer in progress
    Reading,
    /// In-place write on the top delta
    Writing,
    /// New tail cluster being reserved and written
    Allocating,
    /// Read from a lower layer feeding a new top cluster
    CopyingUp,
    /// Physical move within the top awaiting its metadata commit
    Relocating,
}

/// One queued operation on a cluster slot.
pub(crate) enum SlotOp {
    /// A piece of a user read or write
    Io(SubRequest),
    /// Move the cluster's physical location within the top delta
    Relocate { done: Sender<Result<()>> },
    /// Copy this cluster from `upper` into `lower` (merge sweep)
    MergeCopy {
        lower: Arc<Delta>,
        upper: Arc<Delta>,
        done: Sender<Result<()>>,
    },
}

pub(crate) struct SlotInner {
    pub state: SlotState,
    pub queue: VecDeque<SlotOp>,
    /// Whether a worker currently owns this slot's execution.
    pub running: bool,
}

/// Control block for one logical cluster.
pub(crate) struct Slot {
    pub cluster: u64,
    pub inner: Mutex<SlotInner>,
}

impl Slot {
    pub(crate) fn new(cluster: u64) -> Self {
        Self {
            cluster,
            inner: Mutex::new(SlotInner {
                state: SlotState::Idle,
                queue: VecDeque::new(),
                running: false,
            }),
        }
    }

    pub(crate) fn set_state(&self, state: SlotState) {
        self.inner.lock().state = state;
    }
}
