//! Writes chunked gzip files readable by [`ChunkedGzipFile`](super::ChunkedGzipFile).

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use flate2::{Compression, GzBuilder};
use log::debug;

use super::BLOCKSIZE_PREFIX;
use crate::error::{HprofError, Result};

/// Default block size of chunked output.
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

/// Compresses `reader` into `writer` as independent members of `chunk_size` bytes each.
///
/// Only the first member carries the `HPROF BLOCKSIZE=<n>` comment. Returns the number of
/// members written.
pub fn compress_chunked<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    chunk_size: u32,
) -> Result<u64> {
    if chunk_size == 0 {
        return Err(HprofError::InvalidArgument(
            "chunk size must be positive".into(),
        ));
    }
    let mut block = vec![0u8; chunk_size as usize];
    let mut members = 0u64;
    loop {
        let filled = fill_block(&mut reader, &mut block)?;
        if filled == 0 && members > 0 {
            break;
        }

        let builder = match members {
            0 => GzBuilder::new().comment(format!("{BLOCKSIZE_PREFIX}{chunk_size}")),
            _ => GzBuilder::new(),
        };
        let mut encoder = builder.write(&mut writer, Compression::default());
        encoder.write_all(&block[..filled])?;
        encoder.finish()?;
        members += 1;

        if filled < block.len() {
            break;
        }
    }
    writer.flush()?;
    Ok(members)
}

/// Compresses the file at `src` into a chunked gzip file at `dst`.
pub fn compress_file_chunked(src: &Path, dst: &Path, chunk_size: u32) -> Result<u64> {
    let input = File::open(src)?;
    let output = BufWriter::new(File::create(dst)?);
    let members = compress_chunked(input, output, chunk_size)?;
    debug!(
        "compressed {} into {members} members of {chunk_size} bytes",
        src.display()
    );
    Ok(members)
}

fn fill_block<R: Read>(reader: &mut R, block: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < block.len() {
        match reader.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
