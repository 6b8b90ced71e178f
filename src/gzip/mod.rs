//! Gzip support: detection, seekable decompression and chunked random access.
//!
//! Dumps are often shipped gzip-compressed. Two access paths exist:
//!
//! - [`ChunkedGzipFile`] for files written as independent fixed-size members, announced by
//!   an `HPROF BLOCKSIZE=<n>` comment in the first member header;
//! - [`SeekableGzip`] for everything else, emulating random access with a pool of parked
//!   decompressors.
//!
//! Both remember member boundaries in an [`OffsetMappingCache`] so reopening the same file
//! skips work already done.

pub mod chunked;
mod header;
pub mod seekable;
mod stream;
pub mod summary;
mod writer;

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

pub use chunked::{ChunkStats, ChunkedGzipFile};
pub use header::{GZIP_MAGIC, GzipHeader, METHOD_DEFLATE, read_header};
pub use seekable::{SeekStats, SeekableGzip, default_stream_count};
pub use stream::{GzipStream, MemberSpan, STREAM_FOOTPRINT, SharedFile};
pub use summary::{Boundary, ChunkLengths, FileStamp, OffsetMappingCache, OffsetSummary};
pub use writer::{DEFAULT_CHUNK_SIZE, compress_file_chunked, compress_chunked};

use crate::error::Result;

/// Comment prefix announcing a chunked dump.
pub const BLOCKSIZE_PREFIX: &str = "HPROF BLOCKSIZE=";

/// Multiplier used to guess the uncompressed size from the compressed size.
const ESTIMATE_RATIO: u64 = 5;

/// Whether the file starts with a gzip member header (magic and deflate method).
pub fn is_gzip(file: &mut File) -> Result<bool> {
    let mut magic = [0u8; 3];
    file.seek(SeekFrom::Start(0))?;
    let mut filled = 0;
    while filled < magic.len() {
        let n = file.read(&mut magic[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(magic[0..2] == GZIP_MAGIC && magic[2] == METHOD_DEFLATE)
}

/// Whether the file at `path` is gzip-compressed.
pub fn is_gzip_file(path: &Path) -> Result<bool> {
    is_gzip(&mut File::open(path)?)
}

/// The block size advertised by a chunked file, `None` for other files.
pub fn chunk_size(file: &mut File) -> Result<Option<u32>> {
    if !is_gzip(file)? {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(0))?;
    match read_header(&mut BufReader::new(&mut *file)) {
        Ok(header) => Ok(header.block_size()),
        Err(_) => Ok(None),
    }
}

/// Whether the file at `path` is a chunked gzip dump.
pub fn is_chunked_gzip_file(path: &Path) -> Result<bool> {
    Ok(chunk_size(&mut File::open(path)?)?.is_some())
}

/// Estimates the uncompressed length of a gzip file.
///
/// The low 32 bits come from the ISIZE field of the last member; the high bits are taken
/// from five times the compressed size, which is a typical ratio for heap dumps.
pub fn estimated_length(file: &mut File) -> Result<u64> {
    let len = file.metadata()?.len();
    if len < 18 {
        return Ok(len);
    }
    file.seek(SeekFrom::End(-4))?;
    let mut isize = [0u8; 4];
    file.read_exact(&mut isize)?;
    Ok(estimate_from_isize(len, u32::from_le_bytes(isize)))
}

/// Combines a compressed length with the last member's ISIZE into an estimate.
pub(crate) fn estimate_from_isize(len: u64, isize: u32) -> u64 {
    let low = u64::from(isize);
    let guess = len.saturating_mul(ESTIMATE_RATIO);
    let mut estimate = (guess & !0xffff_ffff) | low;
    if estimate < guess.saturating_sub(1 << 31) {
        estimate += 1 << 32;
    }
    estimate.max(low)
}
