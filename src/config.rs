//! Build configuration.
//!
//! All settings are plain data with serde derives so callers can load them from whatever
//! store they use. [`BuildConfig::validate`] is called by the builder before any work starts.

use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{HprofError, Result};

/// How irregular instance records are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strictness {
    /// Size mismatches abort the build; no length repairs.
    #[default]
    Strict,
    /// Mismatches and repairs are logged as warnings.
    Warning,
    /// Mismatches and repairs are logged at debug level.
    Permissive,
}

impl Strictness {
    /// Whether record length repairs may be applied.
    pub fn allows_repairs(self) -> bool {
        self != Strictness::Strict
    }
}

/// Sampling of objects to leave out of the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscardConfig {
    /// Fraction of matching objects to drop, in [0, 1].
    pub ratio: f64,
    /// Regex over normalised class names.
    pub pattern: String,
    /// Sampling seed.
    pub seed: u64,
    /// Start of the dropped slice of the sample space, in [0, 1).
    pub offset: f64,
}

impl Default for DiscardConfig {
    fn default() -> Self {
        Self {
            ratio: 0.0,
            pattern: String::from(".*"),
            seed: 0,
            offset: 0.0,
        }
    }
}

/// Pass 2 parallelism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Worker count; 0 uses the available parallelism.
    pub threads: usize,
    /// Maximum records per batch.
    pub batch_records: usize,
    /// Maximum record bytes per batch.
    pub batch_bytes: usize,
    /// Memory Pass 2 may use for in-flight batches.
    pub memory_budget: Option<u64>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            batch_records: 10_000,
            batch_bytes: 16 * 1024 * 1024,
            memory_budget: None,
        }
    }
}

impl ParallelConfig {
    /// Resolved worker count.
    pub fn effective_threads(&self) -> usize {
        match self.threads {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        }
    }
}

/// Settings of the gzip access layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompressionConfig {
    /// Stream pool size of the seekable layer; 0 derives it from the file size.
    pub max_streams: usize,
    /// Every k-th seek runs the smallest-gap sweep.
    pub sweep_interval: u64,
    /// Candidates examined per weighted eviction.
    pub lru_scan: usize,
    /// Minimum distance between waypoint clones.
    pub waypoint_min_gap: u64,
    /// Byte budget of the chunked member cache.
    pub chunk_cache_bytes: usize,
    /// Entry cap of the chunked member cache.
    pub max_cached_chunks: usize,
    /// Directory for offset-summary files; `None` writes them next to the source.
    pub summary_dir: Option<PathBuf>,
    /// Whether offset summaries are written to disk.
    pub persist_summaries: bool,
    /// Summaries kept by the in-memory mapping cache.
    pub stored_mappings: usize,
}

impl Default for DecompressionConfig {
    fn default() -> Self {
        Self {
            max_streams: 0,
            sweep_interval: 16,
            lru_scan: 8,
            waypoint_min_gap: 256 * 1024,
            chunk_cache_bytes: 5 * 1024 * 1024,
            max_cached_chunks: 1000,
            summary_dir: None,
            persist_summaries: true,
            stored_mappings: 5,
        }
    }
}

/// Everything the index builder needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Treatment of irregular records.
    pub strictness: Strictness,
    /// Which heap dump of the file to index.
    pub dump_number: usize,
    /// Reference width for size computation; defaults to the identifier width.
    pub reference_size: Option<u32>,
    /// Content byte count at and above which array content is deferred.
    pub lazy_array_threshold: usize,
    /// Object sampling; off when `None`.
    pub discard: Option<DiscardConfig>,
    /// Pass 2 parallelism.
    pub parallel: ParallelConfig,
    /// Gzip access layers.
    pub decompression: DecompressionConfig,
    /// LZ4-compress the outbound index (needs the `lz4_flex` feature).
    pub compress_adjacency: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            strictness: Strictness::default(),
            dump_number: 0,
            reference_size: None,
            lazy_array_threshold: 256,
            discard: None,
            parallel: ParallelConfig::default(),
            decompression: DecompressionConfig::default(),
            compress_adjacency: false,
        }
    }
}

impl BuildConfig {
    /// Checks every field; returns `InvalidArgument` on the first bad one.
    pub fn validate(&self) -> Result<()> {
        if self.lazy_array_threshold == 0 {
            return Err(invalid("lazy_array_threshold must be positive"));
        }
        if self.parallel.batch_records == 0 || self.parallel.batch_bytes == 0 {
            return Err(invalid("batch limits must be positive"));
        }
        if let Some(size) = self.reference_size
            && size != 4
            && size != 8
        {
            return Err(invalid(format!("reference size {size} is not 4 or 8")));
        }
        if let Some(discard) = &self.discard {
            discard.compile()?;
        }
        Ok(())
    }
}

impl DiscardConfig {
    /// Validates the ranges and compiles the class-name pattern.
    pub fn compile(&self) -> Result<Regex> {
        if !(0.0..=1.0).contains(&self.ratio) {
            return Err(invalid(format!("discard ratio {} is outside [0, 1]", self.ratio)));
        }
        if !(0.0..1.0).contains(&self.offset) {
            return Err(invalid(format!(
                "discard offset {} is outside [0, 1)",
                self.offset
            )));
        }
        Regex::new(&self.pattern)
            .map_err(|e| invalid(format!("bad discard pattern {:?}: {e}", self.pattern)))
    }
}

fn invalid(msg: impl Into<String>) -> HprofError {
    HprofError::InvalidArgument(msg.into())
}
