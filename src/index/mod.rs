//! On-disk indices: naming, writing and memory-mapped reading.
//!
//! A build leaves one file per [`IndexKind`] next to the chosen prefix, named
//! `<prefix>.<kind>.index`. Array-shaped indices (identifiers, object classes, positions,
//! array sizes, outbound references) are stored as raw little-endian words and read
//! through a memory map. The structured ones (classes, roots, dump metadata, discard
//! histogram) are bincode-encoded.

mod set;
mod writer;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::format::IndexKind;
use crate::hprof::Version;

pub use set::{IndexFile, IndexSet};
pub use writer::{IndexWriter, write_sealed};

/// Metadata of the indexed dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpInfo {
    /// Format version from the file header.
    pub version: Version,
    /// Identifier width in bytes.
    pub id_size: u32,
    /// Creation time, milliseconds since the epoch.
    pub timestamp: u64,
    /// Inferred object alignment.
    pub alignment: u32,
    /// Reference width used for heap sizes.
    pub reference_size: u32,
    /// Objects in the index, classes and the system class loader included.
    pub object_count: u64,
    /// Classes in the index, synthesized ones included.
    pub class_count: u64,
    /// Heap dumps found in the file.
    pub dump_count: usize,
    /// The dump that was indexed.
    pub dump_number: usize,
}

/// Path of the index file of `kind` for `prefix`.
pub fn index_path(prefix: &Path, kind: IndexKind) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(".");
    name.push(kind.file_stem());
    name.push(".index");
    PathBuf::from(name)
}

/// Path of the temporary file an index of `kind` is written to before commit.
pub(crate) fn temp_path(prefix: &Path, kind: IndexKind) -> PathBuf {
    let mut name = index_path(prefix, kind).into_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
