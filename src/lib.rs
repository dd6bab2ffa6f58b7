//! Deltadisk - A Stackable Copy-on-Write Virtual Block Device Engine
//!
//! Deltadisk presents a linear virtual disk on top of a chain of sparse
//! image files - a base plus zero or more deltas - with copy-on-write
//! between layers, crash-consistent metadata updates, and ordered
//! in-flight I/O.
#![warn(missing_docs)]

// Configure global allocator for maximum performance
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

// Core foundational modules
pub mod core;

// Main functional modules
pub mod delta;
pub mod engine;
pub mod format;
pub mod system;

// Re-export commonly used items for convenience
pub use core::{Config, Error, Result};
pub use delta::stack::{LayerKind, LayerSpec, StackSpec};
pub use engine::{Engine, IoKind, IoRequest, SnapshotTarget};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize tracing and the metrics registry
pub fn init() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Initializing {} v{}", NAME, VERSION);

    // Initialize metrics registry
    system::metrics::init_registry();

    Ok(())
}
