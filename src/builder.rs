//! The build orchestrator.
//!
//! [`IndexBuilder::build`] runs the whole pipeline for one dump:
//!
//! 1. Pass 1 scans the dump single-threaded and fills a [`Pass1Handler`].
//! 2. The handler is finalized: ids, alignment, synthesized classes, class sizes.
//! 3. The worker count is chosen from the configuration and the memory budget.
//! 4. Pass 2 decodes every object record, in parallel when more than one worker is allowed.
//! 5. The handler is sealed and the indices are written transactionally.
//!
//! Any error or cancellation before the final rename leaves no index file behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

use crate::config::BuildConfig;
use crate::error::{HprofError, Result};
use crate::executor::{Pass2Stats, execute_pass2};
use crate::gzip::OffsetMappingCache;
use crate::handler::{DiscardHistogram, HandlerStats, Pass1Handler};
use crate::index::{DumpInfo, write_sealed};
use crate::io::{BufferedInput, DumpSource, RandomSource, SourceKind};
use crate::monitor::{BuildHook, ClassNameProvider, ProgressMonitor};
use crate::parser::decode::DecodeContext;
use crate::parser::pass1::Pass1Scanner;
use crate::parser::pass2::{BatchLimits, BatchProducer};

/// Counters of a finished build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Storage of the dump.
    pub source: Option<SourceKind>,
    /// Object records found by Pass 1 in the selected dump.
    pub object_records: u64,
    /// Bytes scanned by Pass 1.
    pub bytes_scanned: u64,
    /// Largest array content seen, in bytes.
    pub largest_array_bytes: u64,
    /// Pass 2 counters.
    pub pass2: Pass2Stats,
    /// Handler counters.
    pub handler: HandlerStats,
}

/// What a successful build returns.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Dump metadata, as written to the info index.
    pub info: DumpInfo,
    /// Sampling totals, when sampling was enabled.
    pub histogram: Option<DiscardHistogram>,
    /// Tolerated irregularities, in the order they were met.
    pub warnings: Vec<String>,
    /// Counters.
    pub stats: BuildStats,
    /// Index files written.
    pub files: Vec<PathBuf>,
}

/// Builds the index set of a dump.
pub struct IndexBuilder {
    config: BuildConfig,
    hooks: Vec<Arc<dyn BuildHook>>,
    names: Option<Arc<dyn ClassNameProvider>>,
    mapping_cache: Option<Arc<OffsetMappingCache>>,
}

impl std::fmt::Debug for IndexBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBuilder")
            .field("config", &self.config)
            .field("hooks", &self.hooks.len())
            .field("names", &self.names.is_some())
            .field("mapping_cache", &self.mapping_cache)
            .finish()
    }
}

impl IndexBuilder {
    /// Creates a builder; fails with `InvalidArgument` on an invalid configuration.
    pub fn new(config: BuildConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            hooks: Vec::new(),
            names: None,
            mapping_cache: None,
        })
    }

    /// The configuration.
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Adds an observer.
    pub fn with_hook(mut self, hook: Arc<dyn BuildHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Sets the fallback for class names missing from the dump.
    pub fn with_name_provider(mut self, names: Arc<dyn ClassNameProvider>) -> Self {
        self.names = Some(names);
        self
    }

    /// Shares an offset-mapping cache with other handles on the same files.
    pub fn with_mapping_cache(mut self, cache: Arc<OffsetMappingCache>) -> Self {
        self.mapping_cache = Some(cache);
        self
    }

    /// Worker count for Pass 2.
    ///
    /// Every worker may hold two batches, and a batch is at least as large as the largest
    /// array record; the count is lowered until that fits the memory budget.
    pub fn plan_threads(&self, largest_array_bytes: u64) -> usize {
        let parallel = &self.config.parallel;
        let wanted = parallel.effective_threads();
        let Some(budget) = parallel.memory_budget else {
            return wanted;
        };
        let per_worker = 2 * (parallel.batch_bytes as u64).max(largest_array_bytes);
        let fits = usize::try_from(budget / per_worker.max(1)).unwrap_or(usize::MAX);
        if fits < wanted {
            info!(
                "memory budget of {budget} bytes allows {} workers instead of {wanted}",
                fits.max(1)
            );
        }
        wanted.min(fits).max(1)
    }

    /// Indexes `dump`, writing `<prefix>.<kind>.index` files.
    pub fn build(
        &self,
        dump: &Path,
        prefix: &Path,
        monitor: &dyn ProgressMonitor,
    ) -> Result<BuildOutput> {
        let config = &self.config;
        let source = DumpSource::open(dump, &config.decompression, self.mapping_cache.clone())?;
        let kind = source.kind();
        // Length repairs need the exact length, which compressed sources do not provide.
        let exact_len = match kind {
            SourceKind::Plain => source.exact_len(),
            SourceKind::Gzip | SourceKind::ChunkedGzip => None,
        };
        let estimated_len = source.estimated_len();
        info!(
            "indexing {} ({kind:?}, ~{estimated_len} bytes)",
            dump.display()
        );

        let mut input = BufferedInput::new(source);
        let mut pass1 = Pass1Handler::new(config)?;
        let scanner = Pass1Scanner::new(config, monitor, self.names.as_deref());
        let summary = scanner.scan(&mut input, exact_len, estimated_len, &mut pass1)?;
        let largest_array_bytes = pass1.largest_array_bytes();

        let pass2 = pass1.finish_pass1()?;
        for hook in &self.hooks {
            hook.after_pass1(pass2.classes());
        }

        let threads = self.plan_threads(largest_array_bytes);
        let body_len: u64 = summary.segments.iter().map(|s| s.len()).sum();
        monitor.begin("Decoding objects", body_len);
        let pass2_stats = {
            let limits = BatchLimits {
                records: config.parallel.batch_records,
                bytes: config.parallel.batch_bytes,
                lazy_threshold: config.lazy_array_threshold as u64,
            };
            let mut producer = BatchProducer::new(
                input,
                summary.segments.clone(),
                summary.header.id_size,
                limits,
                monitor,
            );
            let decode = DecodeContext {
                classes: pass2.classes(),
                layout: pass2.layout(),
                lazy_threshold: limits.lazy_threshold,
                strictness: config.strictness,
                collect_references: true,
            };
            execute_pass2(&mut producer, &pass2, decode, &self.hooks, monitor, threads)?
        };
        monitor.done();
        if pass2_stats.records != summary.object_records {
            warn!(
                "pass 1 found {} object records, pass 2 decoded {}",
                summary.object_records, pass2_stats.records
            );
        }

        let sealed = pass2.finish()?;
        for hook in &self.hooks {
            hook.before_completion(&sealed.classes);
        }
        if monitor.is_cancelled() {
            return Err(HprofError::Cancelled);
        }

        let files = write_sealed(prefix, &sealed, config.compress_adjacency)?;
        info!(
            "indexed {} objects of dump {} into {} files",
            sealed.info.object_count,
            sealed.info.dump_number,
            files.len()
        );

        Ok(BuildOutput {
            info: sealed.info.clone(),
            histogram: sealed.histogram.clone(),
            warnings: sealed.warnings.clone(),
            stats: BuildStats {
                source: Some(kind),
                object_records: summary.object_records,
                bytes_scanned: summary.bytes,
                largest_array_bytes,
                pass2: pass2_stats,
                handler: sealed.stats,
            },
            files,
        })
    }
}
