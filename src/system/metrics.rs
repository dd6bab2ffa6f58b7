//! Metrics collection and monitoring for the deltadisk engine
//!
//! This module provides high-performance metrics collection using
//! Prometheus, optimized for minimal overhead on the I/O path.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};

/// Engine operation counters
pub struct EngineMetrics {
    /// Requests accepted by the translator
    pub requests_submitted: IntCounter,
    /// Requests whose completion fired
    pub requests_completed: IntCounter,
    /// Requests completed with an error
    pub request_errors: IntCounter,
    /// Copy-up transitions (write over a lower-layer mapping)
    pub copy_ups: IntCounter,
    /// Fresh cluster allocations (write into a hole)
    pub allocations: IntCounter,
    /// Relocations performed
    pub relocations: IntCounter,
    /// Barrier flushes completed
    pub barriers: IntCounter,
}

/// BAT cache counters
pub struct CacheMetrics {
    /// Page lookups satisfied from memory
    pub bat_hits: IntCounter,
    /// Page lookups that loaded from disk
    pub bat_misses: IntCounter,
    /// Clean pages evicted
    pub bat_evictions: IntCounter,
}

/// Backing I/O counters
pub struct BackingMetrics {
    /// Read calls issued to backing stores
    pub reads: IntCounter,
    /// Write calls issued to backing stores
    pub writes: IntCounter,
    /// Flush barriers issued to backing stores
    pub flushes: IntCounter,
    /// Bytes read
    pub read_bytes: IntCounter,
    /// Bytes written
    pub write_bytes: IntCounter,
}

/// Metadata pipeline counters
pub struct PipelineMetrics {
    /// Commit transactions completed
    pub commits: IntCounter,
    /// BAT pages written by commits
    pub pages_committed: IntCounter,
    /// Producers suspended on the dirty-page budget
    pub backpressure_stalls: IntCounter,
    /// Dirty BAT pages awaiting commit
    pub dirty_pages: IntGauge,
    /// Commit transaction duration
    pub commit_seconds: Histogram,
}

/// Centralized metrics collection
pub struct Metrics {
    /// Engine operations
    pub engine: EngineMetrics,
    /// BAT cache
    pub cache: CacheMetrics,
    /// Backing I/O
    pub backing: BackingMetrics,
    /// Metadata pipeline
    pub pipeline: PipelineMetrics,
}

impl Metrics {
    /// Create new metrics instance
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            engine: EngineMetrics::new()?,
            cache: CacheMetrics::new()?,
            backing: BackingMetrics::new()?,
            pipeline: PipelineMetrics::new()?,
        })
    }

    /// Get the global metrics instance
    pub fn global() -> &'static Metrics {
        static INSTANCE: Lazy<Metrics> =
            Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
        &INSTANCE
    }
}

impl EngineMetrics {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            requests_submitted: register_int_counter!(
                "dd_requests_submitted_total",
                "Total requests accepted by the translator"
            )?,
            requests_completed: register_int_counter!(
                "dd_requests_completed_total",
                "Total requests whose completion fired"
            )?,
            request_errors: register_int_counter!(
                "dd_request_errors_total",
                "Total requests completed with an error"
            )?,
            copy_ups: register_int_counter!(
                "dd_copy_ups_total",
                "Total copy-up transitions"
            )?,
            allocations: register_int_counter!(
                "dd_allocations_total",
                "Total fresh cluster allocations"
            )?,
            relocations: register_int_counter!(
                "dd_relocations_total",
                "Total relocations performed"
            )?,
            barriers: register_int_counter!(
                "dd_barriers_total",
                "Total barrier flushes completed"
            )?,
        })
    }
}

impl CacheMetrics {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            bat_hits: register_int_counter!(
                "dd_bat_cache_hits_total",
                "BAT page lookups satisfied from memory"
            )?,
            bat_misses: register_int_counter!(
                "dd_bat_cache_misses_total",
                "BAT page lookups that loaded from disk"
            )?,
            bat_evictions: register_int_counter!(
                "dd_bat_cache_evictions_total",
                "Clean BAT pages evicted"
            )?,
        })
    }
}

impl BackingMetrics {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            reads: register_int_counter!(
                "dd_backing_reads_total",
                "Read calls issued to backing stores"
            )?,
            writes: register_int_counter!(
                "dd_backing_writes_total",
                "Write calls issued to backing stores"
            )?,
            flushes: register_int_counter!(
                "dd_backing_flushes_total",
                "Flush barriers issued to backing stores"
            )?,
            read_bytes: register_int_counter!(
                "dd_backing_read_bytes_total",
                "Bytes read from backing stores"
            )?,
            write_bytes: register_int_counter!(
                "dd_backing_write_bytes_total",
                "Bytes written to backing stores"
            )?,
        })
    }
}

impl PipelineMetrics {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            commits: register_int_counter!(
                "dd_pipeline_commits_total",
                "Commit transactions completed"
            )?,
            pages_committed: register_int_counter!(
                "dd_pipeline_pages_committed_total",
                "BAT pages written by commit transactions"
            )?,
            backpressure_stalls: register_int_counter!(
                "dd_pipeline_backpressure_stalls_total",
                "Producers suspended on the dirty-page budget"
            )?,
            dirty_pages: register_int_gauge!(
                "dd_pipeline_dirty_pages",
                "Dirty BAT pages awaiting commit"
            )?,
            commit_seconds: register_histogram!(
                "dd_pipeline_commit_seconds",
                "Commit transaction duration in seconds"
            )?,
        })
    }
}

/// Initialize the metrics registry eagerly so registration failures
/// surface at startup rather than on the first I/O.
pub fn init_registry() {
    let _ = Metrics::global();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_metrics_register_once() {
        let a = Metrics::global();
        let b = Metrics::global();
        a.engine.requests_submitted.inc();
        assert!(b.engine.requests_submitted.get() >= 1);
    }
}
