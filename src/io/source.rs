//! Opening a dump file with the right access path.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use super::RandomSource;
use crate::config::DecompressionConfig;
use crate::error::Result;
use crate::gzip::{self, ChunkedGzipFile, OffsetMappingCache, SeekableGzip};

/// How a dump file is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// Uncompressed.
    Plain,
    /// Gzip without a block size; served by [`SeekableGzip`].
    Gzip,
    /// Chunked gzip; served by [`ChunkedGzipFile`].
    ChunkedGzip,
}

impl SourceKind {
    /// Detects the storage of the file at `path`.
    pub fn detect(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        if !gzip::is_gzip(&mut file)? {
            return Ok(Self::Plain);
        }
        Ok(match gzip::chunk_size(&mut file)? {
            Some(_) => Self::ChunkedGzip,
            None => Self::Gzip,
        })
    }

    /// Whether the file is compressed.
    pub fn is_compressed(self) -> bool {
        self != Self::Plain
    }
}

/// Random access to the uncompressed bytes of a dump, whatever its storage.
#[derive(Debug)]
pub enum DumpSource {
    /// Direct file access.
    Plain {
        /// The open file.
        file: File,
        /// File length.
        len: u64,
    },
    /// Seekable gzip emulation.
    Gzip(SeekableGzip),
    /// Chunked gzip access.
    Chunked(ChunkedGzipFile),
}

impl DumpSource {
    /// Opens `path`, detecting gzip and chunked gzip.
    pub fn open(
        path: &Path,
        config: &DecompressionConfig,
        mapping_cache: Option<Arc<OffsetMappingCache>>,
    ) -> Result<Self> {
        let kind = SourceKind::detect(path)?;
        debug!("opening {} as {kind:?}", path.display());
        Ok(match kind {
            SourceKind::Plain => {
                let file = File::open(path)?;
                let len = file.metadata()?.len();
                Self::Plain { file, len }
            }
            SourceKind::Gzip => Self::Gzip(SeekableGzip::open_with(path, config, mapping_cache)?),
            SourceKind::ChunkedGzip => {
                Self::Chunked(ChunkedGzipFile::open_with(path, config, mapping_cache)?)
            }
        })
    }

    /// Storage of the open file.
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Plain { .. } => SourceKind::Plain,
            Self::Gzip(_) => SourceKind::Gzip,
            Self::Chunked(_) => SourceKind::ChunkedGzip,
        }
    }
}

impl RandomSource for DumpSource {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Plain { file, .. } => RandomSource::read_at(file, pos, buf),
            Self::Gzip(gz) => gz.read_at(pos, buf),
            Self::Chunked(chunked) => RandomSource::read_at(chunked, pos, buf),
        }
    }

    fn exact_len(&self) -> Option<u64> {
        match self {
            Self::Plain { len, .. } => Some(*len),
            Self::Gzip(gz) => gz.exact_len(),
            Self::Chunked(chunked) => chunked.exact_len(),
        }
    }

    fn estimated_len(&self) -> u64 {
        match self {
            Self::Plain { len, .. } => *len,
            Self::Gzip(gz) => gz.estimated_len(),
            Self::Chunked(chunked) => chunked.estimated_len(),
        }
    }
}
