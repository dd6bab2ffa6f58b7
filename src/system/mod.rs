//! System services: metrics and monitoring

/// Prometheus metrics collection
pub mod metrics;
