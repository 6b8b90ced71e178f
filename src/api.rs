//! Convenience entry points over [`IndexBuilder`] and [`HprofReader`].

use std::path::Path;

use crate::builder::{BuildOutput, IndexBuilder};
use crate::config::BuildConfig;
use crate::error::Result;
use crate::monitor::NullMonitor;
use crate::reader::HprofReader;

/// The main entry point for indexing and reading dumps.
#[derive(Debug)]
pub struct HprofIndex;

impl HprofIndex {
    /// Indexes a dump with the given configuration.
    ///
    /// # Arguments
    /// * `dump`: The heap dump, plain or gzip-compressed.
    /// * `prefix`: Path prefix of the index files; `<prefix>.<kind>.index` are written.
    pub fn build<D, P>(dump: D, prefix: P, config: &BuildConfig) -> Result<BuildOutput>
    where
        D: AsRef<Path>,
        P: AsRef<Path>,
    {
        IndexBuilder::new(config.clone())?.build(dump.as_ref(), prefix.as_ref(), &NullMonitor)
    }

    /// Opens a dump together with the indices previously built for it.
    pub fn open<D, P>(dump: D, prefix: P, config: &BuildConfig) -> Result<HprofReader>
    where
        D: AsRef<Path>,
        P: AsRef<Path>,
    {
        HprofReader::open(dump.as_ref(), prefix.as_ref(), config)
    }
}
