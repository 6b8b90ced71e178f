//! Random access over chunked gzip files.
//!
//! A chunked file is a concatenation of independent gzip members that each decompress to
//! the same block size (except the last). The first member's comment advertises that size
//! as `HPROF BLOCKSIZE=<n>`. Any member can be inflated on its own, so random access only
//! needs to know where each member starts: decompressing member *i* reveals the start of
//! member *i + 1*, and the resulting boundary table grows as the file is explored.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::{Decompress, FlushDecompress, Status};
use log::{debug, trace};
use lru::LruCache;

use super::header::{check_trailer, read_header};
use super::summary::{Boundary, FileStamp, OffsetMappingCache, OffsetSummary};
use crate::config::DecompressionConfig;
use crate::error::{HprofError, Result};
use crate::io::RandomSource;

const INPUT_SIZE: usize = 64 * 1024;

/// Cache counters of a chunked handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    /// Members inflated.
    pub loads: u64,
    /// Reads served from a cached member.
    pub hits: u64,
    /// Members evicted from the cache.
    pub evictions: u64,
}

/// Random-access reader over a chunked gzip file.
pub struct ChunkedGzipFile {
    path: PathBuf,
    file: File,
    stamp: FileStamp,
    chunk_size: u32,
    /// Sorted; element 0 is (0, 0). When `complete`, the last element marks the end.
    boundaries: Vec<Boundary>,
    complete: bool,
    cache: LruCache<usize, Arc<[u8]>>,
    cached_bytes: usize,
    max_cached_bytes: usize,
    max_cached_chunks: usize,
    input: Box<[u8]>,
    inflater: Decompress,
    mapping_cache: Option<Arc<OffsetMappingCache>>,
    persisted_boundaries: usize,
    stats: ChunkStats,
}

impl std::fmt::Debug for ChunkedGzipFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedGzipFile")
            .field("path", &self.path)
            .field("chunk_size", &self.chunk_size)
            .field("boundaries", &self.boundaries.len())
            .field("complete", &self.complete)
            .field("stats", &self.stats)
            .finish()
    }
}

impl ChunkedGzipFile {
    /// Opens a chunked file with default settings and no summary cache.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &DecompressionConfig::default(), None)
    }

    /// Opens a chunked file; fails with `InvalidArgument` if it is not chunked.
    pub fn open_with(
        path: &Path,
        config: &DecompressionConfig,
        mapping_cache: Option<Arc<OffsetMappingCache>>,
    ) -> Result<Self> {
        let mut file = File::open(path)?;
        let chunk_size = super::chunk_size(&mut file)?.ok_or_else(|| {
            HprofError::InvalidArgument(format!("{} is not a chunked gzip file", path.display()))
        })?;
        let stamp = FileStamp::of(path)?;

        let mut boundaries = vec![Boundary {
            file_offset: 0,
            logical_offset: 0,
        }];
        if let Some(summary) = mapping_cache
            .as_ref()
            .and_then(|cache| cache.lookup(path, stamp, chunk_size))
        {
            debug!(
                "{}: reusing {} chunk boundaries",
                path.display(),
                summary.chunks.len()
            );
            boundaries = summary.boundaries();
        }
        let complete = boundaries
            .last()
            .is_some_and(|b| b.file_offset >= stamp.size && boundaries.len() > 1);
        let persisted_boundaries = boundaries.len();

        let per_chunk = chunk_size as usize;
        let max_cached_chunks = (config.chunk_cache_bytes / per_chunk.max(1))
            .min(config.max_cached_chunks)
            .max(1);

        Ok(Self {
            path: path.to_path_buf(),
            file,
            stamp,
            chunk_size,
            boundaries,
            complete,
            cache: LruCache::unbounded(),
            cached_bytes: 0,
            max_cached_bytes: config.chunk_cache_bytes.max(per_chunk),
            max_cached_chunks,
            input: vec![0u8; INPUT_SIZE].into_boxed_slice(),
            inflater: Decompress::new(false),
            mapping_cache,
            persisted_boundaries,
            stats: ChunkStats::default(),
        })
    }

    /// Declared uncompressed block size.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Chunk boundaries discovered so far.
    pub fn boundaries(&self) -> &[Boundary] {
        &self.boundaries
    }

    /// Cache counters.
    pub fn stats(&self) -> ChunkStats {
        self.stats
    }

    /// Uncompressed length, once the last member has been seen.
    pub fn known_len(&self) -> Option<u64> {
        match self.complete {
            true => self.boundaries.last().map(|b| b.logical_offset),
            false => None,
        }
    }

    /// Reads up to `buf.len()` bytes at logical offset `pos`; returns 0 at end of data.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let idx = self
                .boundaries
                .partition_point(|b| b.logical_offset <= pos)
                .saturating_sub(1);
            if self.complete && idx + 1 == self.boundaries.len() {
                return Ok(0);
            }

            let chunk = self.chunk(idx)?;
            let offset = (pos - self.boundaries[idx].logical_offset) as usize;
            if offset < chunk.len() {
                let n = buf.len().min(chunk.len() - offset);
                buf[..n].copy_from_slice(&chunk[offset..offset + n]);
                return Ok(n);
            }
            if idx + 1 >= self.boundaries.len() || chunk.is_empty() {
                return Ok(0);
            }
        }
    }

    fn chunk(&mut self, idx: usize) -> Result<Arc<[u8]>> {
        if let Some(hit) = self.cache.get(&idx) {
            self.stats.hits += 1;
            return Ok(Arc::clone(hit));
        }
        let data: Arc<[u8]> = self.load_chunk(idx)?.into();
        self.stats.loads += 1;

        while !self.cache.is_empty()
            && (self.cache.len() >= self.max_cached_chunks
                || self.cached_bytes + data.len() > self.max_cached_bytes)
        {
            if let Some((evicted, buffer)) = self.cache.pop_lru() {
                trace!("evicting chunk {evicted}");
                self.cached_bytes -= buffer.len();
                self.stats.evictions += 1;
            }
        }
        self.cached_bytes += data.len();
        self.cache.put(idx, Arc::clone(&data));
        Ok(data)
    }

    /// Inflates member `idx` and records the boundary that follows it.
    fn load_chunk(&mut self, idx: usize) -> Result<Vec<u8>> {
        let start = self.boundaries[idx];
        if start.file_offset >= self.stamp.size {
            self.mark_complete(idx);
            return Ok(Vec::new());
        }

        // Zero padding where a header would start ends the data.
        self.file.seek(SeekFrom::Start(start.file_offset))?;
        let mut first = [0u8; 1];
        if self.file.read(&mut first)? == 0 || first[0] == 0 {
            debug!("end of members at offset {}", start.file_offset);
            self.mark_complete(idx);
            return Ok(Vec::new());
        }

        self.file.seek(SeekFrom::Start(start.file_offset))?;
        let header = read_header(&mut BufReader::new(&mut self.file))?;

        // One spare byte lets the inflater see the end of a member that fills a whole block.
        let mut out = Vec::with_capacity(self.chunk_size as usize + 1);
        let mut in_pos = start.file_offset + header.length as u64;
        self.inflater.reset(false);
        loop {
            self.file.seek(SeekFrom::Start(in_pos))?;
            let n = self.file.read(&mut self.input)?;
            if n == 0 {
                return Err(HprofError::eof(format!(
                    "gzip member at offset {} is truncated",
                    start.file_offset
                )));
            }
            let in_before = self.inflater.total_in();
            let out_before = out.len();
            let status = self
                .inflater
                .decompress_vec(&self.input[..n], &mut out, FlushDecompress::None)
                .map_err(|e| {
                    HprofError::format(format!(
                        "corrupt deflate data in member at offset {}: {e}",
                        start.file_offset
                    ))
                })?;
            let used = self.inflater.total_in() - in_before;
            in_pos += used;
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if out.len() > self.chunk_size as usize {
                        return Err(HprofError::format(format!(
                            "gzip member at offset {} exceeds the declared block size {}",
                            start.file_offset, self.chunk_size
                        )));
                    }
                    if out.len() == out.capacity() {
                        out.reserve(1);
                    }
                    if used == 0 && out.len() == out_before {
                        return Err(HprofError::format(format!(
                            "no progress inflating member at offset {}",
                            start.file_offset
                        )));
                    }
                }
            }
        }

        let mut trailer = [0u8; 8];
        self.file.seek(SeekFrom::Start(in_pos))?;
        self.file
            .read_exact(&mut trailer)
            .map_err(|_| HprofError::eof("gzip trailer is truncated"))?;
        check_trailer(&trailer, crc32fast::hash(&out), out.len() as u64)?;

        let next = Boundary {
            file_offset: in_pos + 8,
            logical_offset: start.logical_offset + out.len() as u64,
        };
        if idx + 1 == self.boundaries.len() {
            self.boundaries.push(next);
        }
        if out.is_empty() || next.file_offset >= self.stamp.size {
            self.mark_complete(idx + 1);
        }
        Ok(out)
    }

    fn mark_complete(&mut self, last: usize) {
        self.boundaries.truncate(last + 1);
        self.complete = true;
    }

    /// Offers the boundary table to the mapping cache.
    pub fn persist_summary(&mut self) {
        if self.boundaries.len() <= self.persisted_boundaries {
            return;
        }
        let Some(cache) = &self.mapping_cache else {
            return;
        };
        let summary = OffsetSummary::from_boundaries(self.chunk_size, self.stamp, &self.boundaries);
        if cache.store(&self.path, summary) {
            self.persisted_boundaries = self.boundaries.len();
        }
    }
}

impl Drop for ChunkedGzipFile {
    fn drop(&mut self) {
        self.persist_summary();
    }
}

impl RandomSource for ChunkedGzipFile {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        ChunkedGzipFile::read_at(self, pos, buf)
    }

    fn exact_len(&self) -> Option<u64> {
        self.known_len()
    }

    fn estimated_len(&self) -> u64 {
        self.known_len().unwrap_or_else(|| {
            let mut raw = match File::open(&self.path) {
                Ok(f) => f,
                Err(_) => return 0,
            };
            super::estimated_length(&mut raw).unwrap_or(0)
        })
    }
}
