//! Transactional writing of an index set.
//!
//! Every index is first written to `<final>.tmp`. [`IndexWriter::commit`] renames the
//! temporaries into place only after all of them were written; dropping an uncommitted
//! writer removes them, so a failed build never leaves a partial set behind.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Serialize;

use super::{index_path, temp_path};
use crate::compression::{Compressor, CompressorRegistry, NoCompression};
use crate::error::Result;
use crate::format::{IndexKind, MetaByte, TailHeader};
use crate::handler::SealedIndex;

/// Writes index files for one prefix.
#[derive(Debug)]
pub struct IndexWriter {
    prefix: PathBuf,
    pending: Vec<(IndexKind, PathBuf)>,
    committed: bool,
    bytes_written: u64,
}

impl IndexWriter {
    /// Creates a writer for `<prefix>.<kind>.index` files.
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            pending: Vec::new(),
            committed: false,
            bytes_written: 0,
        }
    }

    /// Bytes written so far, tails included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Writes a payload to the temporary file of `kind`.
    pub fn write_payload(
        &mut self,
        kind: IndexKind,
        entries: u64,
        payload: &[u8],
        compressor: &dyn Compressor,
    ) -> Result<()> {
        let stored = compressor.compress(payload)?;
        let tail = TailHeader::new(kind, MetaByte::new(compressor.id()), entries, &stored);

        let path = temp_path(&self.prefix, kind);
        // Registered before creation so a failed write is still cleaned up.
        self.pending.push((kind, path.clone()));
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(&stored)?;
        writer.write_all(&tail.to_bytes())?;
        writer.flush()?;

        let total = stored.len() as u64 + crate::format::TAIL_HEADER_SIZE as u64;
        self.bytes_written += total;
        debug!(
            "wrote {kind} index: {entries} entries, {total} bytes ({})",
            compressor.name()
        );
        Ok(())
    }

    /// Writes a word array index.
    pub fn write_u64s(&mut self, kind: IndexKind, values: &[u64]) -> Result<()> {
        let mut payload = Vec::with_capacity(values.len() * 8);
        for v in values {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        self.write_payload(kind, values.len() as u64, &payload, &NoCompression)
    }

    /// Writes a half-word array index.
    pub fn write_u32s(&mut self, kind: IndexKind, values: &[u32]) -> Result<()> {
        let mut payload = Vec::with_capacity(values.len() * 4);
        for v in values {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        self.write_payload(kind, values.len() as u64, &payload, &NoCompression)
    }

    /// Writes a bincode-encoded structured index.
    pub fn write_encoded<T: Serialize>(
        &mut self,
        kind: IndexKind,
        entries: u64,
        value: &T,
    ) -> Result<()> {
        let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
        self.write_payload(kind, entries, &payload, &NoCompression)
    }

    /// Renames every temporary into place and returns the final paths.
    ///
    /// Index files of kinds that were not written in this transaction are removed, so a
    /// stale optional index from an earlier build cannot be mistaken for a current one.
    pub fn commit(mut self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(self.pending.len());
        for (kind, tmp) in &self.pending {
            let target = index_path(&self.prefix, *kind);
            fs::rename(tmp, &target)?;
            paths.push(target);
        }
        for kind in IndexKind::ALL {
            if !self.pending.iter().any(|(k, _)| *k == kind) {
                let stale = index_path(&self.prefix, kind);
                if stale.exists() {
                    fs::remove_file(&stale)?;
                }
            }
        }
        self.committed = true;
        Ok(paths)
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (_, tmp) in &self.pending {
            if let Err(e) = fs::remove_file(tmp)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("could not remove {}: {e}", tmp.display());
            }
        }
    }
}

/// Writes every index of a sealed build under `prefix`.
pub fn write_sealed(
    prefix: &Path,
    sealed: &SealedIndex,
    compress_adjacency: bool,
) -> Result<Vec<PathBuf>> {
    let registry = CompressorRegistry::new();
    let mut writer = IndexWriter::new(prefix);

    writer.write_u64s(IndexKind::Identifiers, sealed.identifiers.as_slice())?;
    writer.write_u32s(IndexKind::ObjectClass, &sealed.object_class)?;
    writer.write_u64s(IndexKind::ObjectPosition, &sealed.positions)?;
    writer.write_u64s(IndexKind::ArraySize, &sealed.array_sizes)?;

    let mut outbound =
        Vec::with_capacity(sealed.outbound_offsets.len() * 8 + sealed.outbound.len() * 4);
    for offset in &sealed.outbound_offsets {
        outbound.extend_from_slice(&offset.to_le_bytes());
    }
    for id in &sealed.outbound {
        outbound.extend_from_slice(&id.to_le_bytes());
    }
    writer.write_payload(
        IndexKind::Outbound,
        sealed.identifiers.len() as u64,
        &outbound,
        registry.for_adjacency(compress_adjacency),
    )?;

    let classes: Vec<_> = sealed.classes.records().into_iter().cloned().collect();
    writer.write_encoded(IndexKind::Classes, classes.len() as u64, &classes)?;
    writer.write_encoded(IndexKind::GcRoots, sealed.gc_roots.len() as u64, &sealed.gc_roots)?;
    writer.write_encoded(
        IndexKind::ThreadLocals,
        sealed.thread_locals.len() as u64,
        &sealed.thread_locals,
    )?;
    writer.write_encoded(IndexKind::DumpInfo, 1, &sealed.info)?;
    if let Some(histogram) = &sealed.histogram {
        writer.write_encoded(
            IndexKind::DiscardHistogram,
            histogram.entries.len() as u64,
            histogram,
        )?;
    }
    let written = writer.bytes_written();
    let paths = writer.commit()?;
    debug!("committed {} index files, {written} bytes", paths.len());
    Ok(paths)
}
