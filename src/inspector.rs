//! Tools for inspecting the index files of a build.
//! Useful for checking a build on disk and diagnosing damaged files.

use std::path::Path;

use serde::Serialize;

use crate::compression::CompressorRegistry;
use crate::error::Result;
use crate::format::{IndexKind, TAIL_HEADER_SIZE, TailHeader, payload_checksum};
use crate::index::{DumpInfo, index_path};

/// A structural report of the index set behind a prefix.
#[derive(Debug, Serialize)]
pub struct InspectionReport {
    /// The prefix, as given.
    pub prefix: String,
    /// Dump metadata, when the info index is readable.
    pub info: Option<DumpInfo>,
    /// One entry per file found.
    pub files: Vec<IndexFileInfo>,
    /// Required kinds with no file.
    pub missing: Vec<IndexKind>,
}

/// Metadata of one index file.
#[derive(Debug, Serialize)]
pub struct IndexFileInfo {
    /// Which index.
    pub kind: IndexKind,
    /// Size on disk.
    pub file_size: u64,
    /// Stored payload size.
    pub payload_size: u64,
    /// Logical entries.
    pub entries: u64,
    /// Compression algorithm used.
    pub compression_algo: String,
    /// Whether the payload matches its checksum.
    pub checksum_ok: bool,
    /// Why the file could not be read, if it could not.
    pub problem: Option<String>,
}

impl InspectionReport {
    /// Whether every required file exists and is intact.
    pub fn is_healthy(&self) -> bool {
        self.missing.is_empty()
            && self
                .files
                .iter()
                .all(|f| f.problem.is_none() && f.checksum_ok)
    }
}

/// The index inspector.
#[derive(Debug)]
pub struct IndexInspector;

impl IndexInspector {
    /// Reads every index file of `prefix` and reports on it.
    ///
    /// Damaged files are reported, not returned as errors; only I/O failures other than
    /// a missing file abort the inspection.
    pub fn inspect<P: AsRef<Path>>(prefix: P) -> Result<InspectionReport> {
        let prefix = prefix.as_ref();
        let registry = CompressorRegistry::new();
        let mut report = InspectionReport {
            prefix: prefix.display().to_string(),
            info: None,
            files: Vec::new(),
            missing: Vec::new(),
        };

        for kind in IndexKind::ALL {
            let path = index_path(prefix, kind);
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if !kind.is_optional() {
                        report.missing.push(kind);
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let file_size = bytes.len() as u64;
            let tail = match TailHeader::from_file_bytes(&bytes) {
                Ok(tail) => tail,
                Err(e) => {
                    report.files.push(IndexFileInfo {
                        kind,
                        file_size,
                        payload_size: 0,
                        entries: 0,
                        compression_algo: "?".into(),
                        checksum_ok: false,
                        problem: Some(e.to_string()),
                    });
                    continue;
                }
            };
            let payload = &bytes[..bytes.len() - TAIL_HEADER_SIZE];
            let algo_id = tail.meta.compression_method();
            let compression_algo = registry
                .get(algo_id)
                .map_or_else(|_| format!("unknown({algo_id})"), |c| c.name().to_string());
            let problem = (tail.kind != kind)
                .then(|| format!("holds a {} index", tail.kind));
            if kind == IndexKind::DumpInfo && algo_id == 0 {
                report.info =
                    bincode::serde::decode_from_slice(payload, bincode::config::standard())
                        .ok()
                        .map(|(info, _)| info);
            }
            report.files.push(IndexFileInfo {
                kind,
                file_size,
                payload_size: tail.payload_len,
                entries: tail.entries,
                compression_algo,
                checksum_ok: payload_checksum(payload) == tail.checksum,
                problem,
            });
        }
        Ok(report)
    }
}

impl std::fmt::Display for InspectionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== HPROF INDEX REPORT ===")?;
        writeln!(f, "Prefix:         {}", self.prefix)?;
        if let Some(info) = &self.info {
            writeln!(
                f,
                "Dump:           {} of {} | {:?} | id size {} | alignment {}",
                info.dump_number, info.dump_count, info.version, info.id_size, info.alignment
            )?;
            writeln!(
                f,
                "Objects:        {} ({} classes)",
                info.object_count, info.class_count
            )?;
        }
        writeln!(f, "\n[FILES]")?;
        for file in &self.files {
            let status = match (&file.problem, file.checksum_ok) {
                (Some(problem), _) => problem.as_str(),
                (None, true) => "ok",
                (None, false) => "CHECKSUM MISMATCH",
            };
            writeln!(
                f,
                "{:<12} {:>10} entries | {:>12}b | {:<5} | {}",
                file.kind.file_stem(),
                file.entries,
                file.payload_size,
                file.compression_algo,
                status
            )?;
        }
        for kind in &self.missing {
            writeln!(f, "{:<12} MISSING", kind.file_stem())?;
        }
        Ok(())
    }
}
