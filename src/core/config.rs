//! Configuration management for the deltadisk engine
//!
//! This module handles all configuration settings with performance-optimized
//! defaults. Settings load from an optional TOML file and may be overridden
//! through `DD_*` environment variables.

use crate::core::error::{Error, Result};
use crate::core::types::{MAX_CLUSTER_SHIFT, MIN_CLUSTER_SHIFT};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine tuning
    pub engine: EngineConfig,

    /// Metadata pipeline tuning
    pub pipeline: PipelineConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics and monitoring
    pub metrics: MetricsConfig,
}

/// Engine tuning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads servicing cluster slots (0 = auto-detect)
    pub worker_threads: usize,

    /// In-flight backing request budget per delta
    pub max_inflight_per_delta: usize,

    /// Resident BAT page budget per delta (clean pages beyond it are evicted)
    pub bat_cache_pages: usize,

    /// Cluster shift used for stacks whose base is raw and which carry no
    /// image layer to negotiate from (log2 of cluster size in sectors)
    pub default_cluster_shift: u32,
}

/// Metadata pipeline tuning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded dirty BAT page budget; producers that would exceed it
    /// suspend until the pipeline drains
    pub dirty_page_budget: usize,

    /// Above this many dirty pages the translator refuses new writes with
    /// a transient backpressure error (reads are unaffected)
    pub backpressure_watermark: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics registration
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0, // Auto-detect
            max_inflight_per_delta: 128,
            bat_cache_pages: 1024,
            default_cluster_shift: 11, // 1 MiB clusters
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dirty_page_budget: 256,
            backpressure_watermark: 192,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from environment variables and config file
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        // Try to load from config file first
        if let Ok(file_config) = Self::from_file("deltadisk.toml") {
            config = file_config;
        }

        // Override with environment variables
        config.apply_env_overrides()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        if let Ok(workers) = env::var("DD_WORKER_THREADS") {
            self.engine.worker_threads = workers
                .parse()
                .map_err(|e| Error::config(format!("Invalid worker threads: {}", e)))?;
        }

        if let Ok(budget) = env::var("DD_DIRTY_PAGE_BUDGET") {
            self.pipeline.dirty_page_budget = budget
                .parse()
                .map_err(|e| Error::config(format!("Invalid dirty page budget: {}", e)))?;
        }

        if let Ok(watermark) = env::var("DD_BACKPRESSURE_WATERMARK") {
            self.pipeline.backpressure_watermark = watermark
                .parse()
                .map_err(|e| Error::config(format!("Invalid backpressure watermark: {}", e)))?;
        }

        if let Ok(shift) = env::var("DD_DEFAULT_CLUSTER_SHIFT") {
            self.engine.default_cluster_shift = shift
                .parse()
                .map_err(|e| Error::config(format!("Invalid cluster shift: {}", e)))?;
        }

        if let Ok(level) = env::var("DD_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("DD_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.engine.worker_threads > 1024 {
            return Err(Error::config("Too many worker threads (maximum 1024)"));
        }

        if self.engine.max_inflight_per_delta == 0 {
            return Err(Error::config("max_inflight_per_delta must be nonzero"));
        }

        if self.engine.bat_cache_pages == 0 {
            return Err(Error::config("bat_cache_pages must be nonzero"));
        }

        if self.pipeline.dirty_page_budget == 0 {
            return Err(Error::config("dirty_page_budget must be nonzero"));
        }

        if self.pipeline.backpressure_watermark > self.pipeline.dirty_page_budget {
            return Err(Error::config(
                "backpressure_watermark must not exceed dirty_page_budget",
            ));
        }

        if self.engine.default_cluster_shift < MIN_CLUSTER_SHIFT
            || self.engine.default_cluster_shift > MAX_CLUSTER_SHIFT
        {
            return Err(Error::config("default_cluster_shift out of range"));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config("Invalid log level")),
        }

        Ok(())
    }

    /// Get optimal number of worker threads
    pub fn optimal_worker_threads(&self) -> usize {
        if self.engine.worker_threads == 0 {
            // Auto-detect: use number of CPU cores
            num_cpus::get().max(1)
        } else {
            self.engine.worker_threads
        }
    }
}

/// Load configuration from the given path, falling back to defaults.
///
/// A missing or invalid file is logged and ignored rather than fatal, so
/// the binary always comes up with a usable configuration.
pub fn load_config_or_default(path: Option<&str>) -> Config {
    let config = match path {
        Some(p) => match Config::from_file(p) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("failed to load config from {}: {}", p, e);
                Config::default()
            }
        },
        None => Config::load().unwrap_or_default(),
    };

    if let Err(e) = config.validate() {
        tracing::warn!("invalid configuration, using defaults: {}", e);
        return Config::default();
    }

    config
}
