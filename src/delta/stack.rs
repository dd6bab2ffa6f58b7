//! The delta stack: an ordered chain of deltas composing one virtual disk
//!
//! The stack is kept base-first; only the last element (the top) accepts
//! writes. Lookup walks top-down and returns the first layer whose mapping
//! for the requested logical cluster is present. Control operations build a
//! new stack value and publish it wholesale; readers hold an `Arc` snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::{cluster_sectors, DeltaId, Generation};

use super::backing::{BackingStore, FileBacking};
use super::{Delta, DeltaKind, DeltaOptions};

/// Where a layer's bytes live.
pub enum LayerSource {
    /// A file on disk
    Path(PathBuf),
    /// An injected backing store (tests, embedders)
    Store(Arc<dyn BackingStore>),
}

/// Declared kind of a layer in a [`StackSpec`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    /// Raw flat file; only valid as the bottom layer
    Raw,
    /// Image file with header and BAT
    Image,
}

/// One layer of a stack descriptor.
pub struct LayerSpec {
    /// Raw or image
    pub kind: LayerKind,
    /// File path or injected store
    pub source: LayerSource,
}

impl LayerSpec {
    /// Raw layer from a path.
    pub fn raw_path(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: LayerKind::Raw,
            source: LayerSource::Path(path.into()),
        }
    }

    /// Image layer from a path.
    pub fn image_path(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: LayerKind::Image,
            source: LayerSource::Path(path.into()),
        }
    }

    /// Raw layer from an injected store.
    pub fn raw_store(store: Arc<dyn BackingStore>) -> Self {
        Self {
            kind: LayerKind::Raw,
            source: LayerSource::Store(store),
        }
    }

    /// Image layer from an injected store.
    pub fn image_store(store: Arc<dyn BackingStore>) -> Self {
        Self {
            kind: LayerKind::Image,
            source: LayerSource::Store(store),
        }
    }
}

/// Descriptor of a stack to open, base first.
pub struct StackSpec {
    /// Layers, base first; the last is the writable top
    pub layers: Vec<LayerSpec>,
}

impl StackSpec {
    /// Descriptor over the given layers, base first.
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        Self { layers }
    }
}

/// Introspection snapshot of one layer.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    /// Identifier within the stack
    pub id: DeltaId,
    /// Delta kind
    pub kind: DeltaKind,
    /// Whether the layer refuses writes
    pub read_only: bool,
    /// Committed metadata generation (0 for raw)
    pub generation: Generation,
    /// Virtual clusters this layer covers
    pub virtual_clusters: u64,
}

/// An ordered, immutable snapshot of the delta chain.
pub struct DeltaStack {
    deltas: Vec<Arc<Delta>>,
}

impl DeltaStack {
    /// Open a stack from its descriptor.
    ///
    /// Cluster-size negotiation: every image layer must share one cluster
    /// shift; a raw base is assigned the stack's; a raw-only stack takes
    /// the configured default and its raw base is the writable top.
    pub fn open(spec: &StackSpec, config: &Config) -> Result<Self> {
        if spec.layers.is_empty() {
            return Err(Error::invalid_argument("stack descriptor has no layers"));
        }
        for (i, layer) in spec.layers.iter().enumerate() {
            if layer.kind == LayerKind::Raw && i != 0 {
                return Err(Error::invalid_argument(
                    "a raw layer is only valid as the base",
                ));
            }
        }

        let opts = DeltaOptions::from(&config.engine);
        let top_index = spec.layers.len() - 1;

        // Open image layers first: the stack's cluster size comes from
        // them, and a raw base cannot be opened until it is known.
        let mut images: Vec<(usize, Arc<Delta>)> = Vec::new();
        let mut stack_shift: Option<u32> = None;
        for (i, layer) in spec.layers.iter().enumerate() {
            if layer.kind != LayerKind::Image {
                continue;
            }
            let writable = i == top_index;
            let backing = open_source(&layer.source, writable)?;
            let delta = Delta::open_image(DeltaId(i as u32), backing, !writable, &opts)?;
            match stack_shift {
                None => stack_shift = Some(delta.cluster_shift()),
                Some(shift) if shift != delta.cluster_shift() => {
                    return Err(Error::IncompatibleClusterSize {
                        stack_shift: shift,
                        delta_shift: delta.cluster_shift(),
                    });
                }
                Some(_) => {}
            }
            images.push((i, Arc::new(delta)));
        }

        let shift = stack_shift.unwrap_or(config.engine.default_cluster_shift);

        let mut deltas: Vec<Arc<Delta>> = Vec::with_capacity(spec.layers.len());
        for (i, layer) in spec.layers.iter().enumerate() {
            match layer.kind {
                LayerKind::Raw => {
                    let writable = i == top_index;
                    let backing = open_source(&layer.source, writable)?;
                    let delta =
                        Delta::open_raw(DeltaId(i as u32), backing, shift, writable, &opts)?;
                    deltas.push(Arc::new(delta));
                }
                LayerKind::Image => {
                    let (_, delta) = images.remove(0);
                    deltas.push(delta);
                }
            }
        }

        let stack = Self { deltas };
        tracing::info!(
            layers = stack.deltas.len(),
            cluster_shift = shift,
            virtual_clusters = stack.virtual_clusters(),
            "opened delta stack"
        );
        Ok(stack)
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// Whether the stack has no layers (never true for an opened stack).
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// The writable top layer.
    pub fn top(&self) -> &Arc<Delta> {
        self.deltas.last().expect("a stack always has a top")
    }

    /// Iterate base → top.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Delta>> {
        self.deltas.iter()
    }

    /// Find a layer by id.
    pub fn get(&self, id: DeltaId) -> Option<&Arc<Delta>> {
        self.deltas.iter().find(|d| d.id() == id)
    }

    /// Position of a layer by id, base-first.
    pub fn position(&self, id: DeltaId) -> Option<usize> {
        self.deltas.iter().position(|d| d.id() == id)
    }

    /// The stack's cluster shift (all layers share it).
    pub fn cluster_shift(&self) -> u32 {
        self.top().cluster_shift()
    }

    /// Virtual size of the disk in clusters (the top layer governs).
    pub fn virtual_clusters(&self) -> u64 {
        self.top().virtual_clusters()
    }

    /// Virtual size of the disk in sectors.
    pub fn virtual_sectors(&self) -> u64 {
        self.virtual_clusters() * cluster_sectors(self.cluster_shift())
    }

    /// Resolve a logical cluster: walk top-down, first present mapping
    /// wins. `None` means the cluster reads as zeros.
    pub fn lookup(&self, cluster: u64) -> Result<Option<(Arc<Delta>, u64)>> {
        for delta in self.deltas.iter().rev() {
            if let Some(phys) = delta.lookup(cluster)? {
                return Ok(Some((delta.clone(), phys)));
            }
        }
        Ok(None)
    }

    /// Resolve a logical cluster through the layers below the top: the
    /// copy-up pre-image source.
    pub fn lookup_below_top(&self, cluster: u64) -> Result<Option<(Arc<Delta>, u64)>> {
        for delta in self.deltas.iter().rev().skip(1) {
            if let Some(phys) = delta.lookup(cluster)? {
                return Ok(Some((delta.clone(), phys)));
            }
        }
        Ok(None)
    }

    /// A new stack with `top` pushed above the current layers.
    pub(crate) fn with_new_top(&self, top: Arc<Delta>) -> Result<Self> {
        if top.cluster_shift() != self.cluster_shift() {
            return Err(Error::IncompatibleClusterSize {
                stack_shift: self.cluster_shift(),
                delta_shift: top.cluster_shift(),
            });
        }
        let mut deltas = self.deltas.clone();
        deltas.push(top);
        Ok(Self { deltas })
    }

    /// A new stack with the top layer replaced (reopen after grow).
    pub(crate) fn with_replaced_top(&self, top: Arc<Delta>) -> Self {
        let mut deltas = self.deltas.clone();
        deltas.pop();
        deltas.push(top);
        Self { deltas }
    }

    /// A new stack with the given layer removed (merge publish).
    pub(crate) fn without(&self, id: DeltaId) -> Result<Self> {
        if self.get(id).is_none() {
            return Err(Error::invalid_argument(format!("{} not in the stack", id)));
        }
        let deltas: Vec<Arc<Delta>> =
            self.deltas.iter().filter(|d| d.id() != id).cloned().collect();
        if deltas.is_empty() {
            return Err(Error::invalid_argument("cannot remove the only layer"));
        }
        Ok(Self { deltas })
    }

    /// Introspection snapshot, base first.
    pub fn layers(&self) -> Vec<LayerInfo> {
        self.deltas
            .iter()
            .map(|d| LayerInfo {
                id: d.id(),
                kind: d.kind(),
                read_only: d.is_read_only(),
                generation: d.generation(),
                virtual_clusters: d.virtual_clusters(),
            })
            .collect()
    }
}

fn open_source(source: &LayerSource, writable: bool) -> Result<Arc<dyn BackingStore>> {
    match source {
        LayerSource::Path(path) => Ok(Arc::new(FileBacking::open(path, writable)?)),
        LayerSource::Store(store) => Ok(store.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::sim::SimBacking;
    use crate::delta::format_image;

    fn store(sim: &SimBacking) -> Arc<dyn BackingStore> {
        Arc::new(sim.clone())
    }

    fn image_store(shift: u32, clusters: u64) -> Arc<dyn BackingStore> {
        let sim = SimBacking::new();
        let backing = store(&sim);
        format_image(&backing, shift, clusters, true).unwrap();
        backing
    }

    #[test]
    fn test_open_single_image_stack() {
        let backing = image_store(3, 64);
        let spec = StackSpec::new(vec![LayerSpec::image_store(backing)]);
        let stack = DeltaStack::open(&spec, &Config::default()).unwrap();
        assert_eq!(stack.len(), 1);
        assert!(!stack.top().is_read_only());
        assert_eq!(stack.virtual_clusters(), 64);
        assert_eq!(stack.virtual_sectors(), 64 * 8);
    }

    #[test]
    fn test_raw_base_with_image_top() {
        let raw = SimBacking::with_image(vec![0x11; 8 * 4096]);
        let top = {
            let sim = SimBacking::new();
            let backing = store(&sim);
            format_image(&backing, 3, 8, false).unwrap();
            backing
        };
        let spec = StackSpec::new(vec![
            LayerSpec::raw_store(store(&raw)),
            LayerSpec::image_store(top),
        ]);
        let stack = DeltaStack::open(&spec, &Config::default()).unwrap();
        assert_eq!(stack.len(), 2);
        assert!(stack.iter().next().unwrap().is_read_only());

        // The raw base provides every mapping the top lacks.
        let (owner, phys) = stack.lookup(3).unwrap().unwrap();
        assert_eq!(owner.kind(), DeltaKind::RawBase);
        assert_eq!(phys, 3);
    }

    #[test]
    fn test_mismatched_cluster_sizes_rejected() {
        let base = image_store(3, 64);
        let top = image_store(4, 32);
        let spec = StackSpec::new(vec![
            LayerSpec::image_store(base),
            LayerSpec::image_store(top),
        ]);
        assert!(matches!(
            DeltaStack::open(&spec, &Config::default()),
            Err(Error::IncompatibleClusterSize { .. })
        ));
    }

    #[test]
    fn test_raw_layer_above_base_rejected() {
        let base = image_store(3, 64);
        let raw = SimBacking::with_image(vec![0u8; 4096]);
        let spec = StackSpec::new(vec![
            LayerSpec::image_store(base),
            LayerSpec::raw_store(store(&raw)),
        ]);
        assert!(DeltaStack::open(&spec, &Config::default()).is_err());
    }

    #[test]
    fn test_top_down_lookup_order() {
        let base_sim = SimBacking::new();
        let base_backing = store(&base_sim);
        format_image(&base_backing, 3, 16, true).unwrap();
        let top_sim = SimBacking::new();
        let top_backing = store(&top_sim);
        format_image(&top_backing, 3, 16, false).unwrap();

        let spec = StackSpec::new(vec![
            LayerSpec::image_store(base_backing.clone()),
            LayerSpec::image_store(top_backing.clone()),
        ]);
        let stack = DeltaStack::open(&spec, &Config::default()).unwrap();

        // Plant a mapping in the base through its own delta handle.
        let base = stack.iter().next().unwrap();
        let bat = base.bat().unwrap();
        let pin = bat.pin_for(7).unwrap();
        bat.set_entry(&pin, 7, 3);
        drop(pin);

        // The top has a hole at 7, so lookup falls through to the base.
        let (owner, phys) = stack.lookup(7).unwrap().unwrap();
        assert_eq!(owner.id(), DeltaId(0));
        assert_eq!(phys, 3);
        assert!(stack.lookup_below_top(7).unwrap().is_some());
        assert!(stack.lookup(8).unwrap().is_none());
    }
}
