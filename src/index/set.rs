//! The read side: memory-mapped index files.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::de::DeserializeOwned;

use super::{DumpInfo, index_path};
use crate::compression::CompressorRegistry;
use crate::error::{HprofError, Result};
use crate::format::{IndexKind, TAIL_HEADER_SIZE, TailHeader, le_u32, le_u64, payload_checksum};
use crate::handler::{ClassTable, DiscardHistogram};
use crate::hprof::model::{ClassRecord, GcRootInfo};

/// One opened index file.
#[derive(Debug)]
pub struct IndexFile {
    path: PathBuf,
    mmap: Mmap,
    tail: TailHeader,
    decoded: Option<Vec<u8>>,
}

impl IndexFile {
    /// Maps a file and validates its tail. With `verify`, the payload checksum is checked.
    pub fn open(path: &Path, expected: IndexKind, verify: bool) -> Result<Self> {
        let file = File::open(path)?;
        // Safety: index files are owned by this crate and replaced only by rename.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };

        let tail = TailHeader::from_file_bytes(&mmap)?;
        if tail.kind != expected {
            return Err(HprofError::format(format!(
                "{} holds a {} index, expected {expected}",
                path.display(),
                tail.kind
            )));
        }
        let stored = &mmap[..mmap.len() - TAIL_HEADER_SIZE];
        if verify && payload_checksum(stored) != tail.checksum {
            return Err(HprofError::format(format!(
                "checksum mismatch in {}",
                path.display()
            )));
        }
        let decoded = match tail.meta.compression_method() {
            0 => None,
            id => {
                let registry = CompressorRegistry::new();
                Some(registry.get(id)?.decompress(stored)?.into_owned())
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            tail,
            decoded,
        })
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parsed tail.
    pub fn tail(&self) -> &TailHeader {
        &self.tail
    }

    /// Whether the stored payload matches its checksum.
    pub fn checksum_ok(&self) -> bool {
        payload_checksum(self.stored()) == self.tail.checksum
    }

    fn stored(&self) -> &[u8] {
        &self.mmap[..self.mmap.len() - TAIL_HEADER_SIZE]
    }

    /// The decompressed payload.
    pub fn payload(&self) -> &[u8] {
        match &self.decoded {
            Some(bytes) => bytes,
            None => self.stored(),
        }
    }

    /// Reads entry `i` of a word array.
    pub fn u64_at(&self, i: u64) -> Option<u64> {
        let start = usize::try_from(i.checked_mul(8)?).ok()?;
        self.payload().get(start..start + 8).map(le_u64)
    }

    /// Reads entry `i` of a half-word array.
    pub fn u32_at(&self, i: u64) -> Option<u32> {
        let start = usize::try_from(i.checked_mul(4)?).ok()?;
        self.payload().get(start..start + 4).map(le_u32)
    }

    /// Decodes a bincode payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let (value, _) =
            bincode::serde::decode_from_slice(self.payload(), bincode::config::standard())?;
        Ok(value)
    }

    fn expect_words(&self, width: u64, count: u64) -> Result<()> {
        if (self.payload().len() as u64) < width * count {
            return Err(HprofError::format(format!(
                "{} holds {} bytes, too few for {count} entries",
                self.path.display(),
                self.payload().len()
            )));
        }
        Ok(())
    }
}

/// All indices of one build, opened for lookup.
#[derive(Debug)]
pub struct IndexSet {
    identifiers: IndexFile,
    object_class: IndexFile,
    positions: IndexFile,
    array_sizes: IndexFile,
    outbound: IndexFile,
    info: DumpInfo,
    classes: Vec<ClassRecord>,
    gc_roots: Vec<(u32, Vec<GcRootInfo>)>,
    thread_locals: Vec<(u32, Vec<(u32, Vec<GcRootInfo>)>)>,
    histogram: Option<DiscardHistogram>,
}

impl IndexSet {
    /// Opens the index set written for `prefix`.
    ///
    /// Structured files are checksummed; the word arrays are mapped lazily and only checked
    /// for size.
    pub fn open(prefix: &Path) -> Result<Self> {
        let open = |kind: IndexKind, verify: bool| {
            IndexFile::open(&index_path(prefix, kind), kind, verify)
        };

        let info: DumpInfo = open(IndexKind::DumpInfo, true)?.decode()?;
        let n = info.object_count;

        let identifiers = open(IndexKind::Identifiers, false)?;
        identifiers.expect_words(8, n)?;
        let object_class = open(IndexKind::ObjectClass, false)?;
        object_class.expect_words(4, n)?;
        let positions = open(IndexKind::ObjectPosition, false)?;
        positions.expect_words(8, n)?;
        let array_sizes = open(IndexKind::ArraySize, false)?;
        array_sizes.expect_words(8, n)?;
        let outbound = open(IndexKind::Outbound, false)?;
        outbound.expect_words(8, n + 1)?;

        let histogram_path = index_path(prefix, IndexKind::DiscardHistogram);
        let histogram = if histogram_path.exists() {
            Some(IndexFile::open(&histogram_path, IndexKind::DiscardHistogram, true)?.decode()?)
        } else {
            None
        };

        Ok(Self {
            classes: open(IndexKind::Classes, true)?.decode()?,
            gc_roots: open(IndexKind::GcRoots, true)?.decode()?,
            thread_locals: open(IndexKind::ThreadLocals, true)?.decode()?,
            identifiers,
            object_class,
            positions,
            array_sizes,
            outbound,
            info,
            histogram,
        })
    }

    /// Dump metadata.
    pub fn info(&self) -> &DumpInfo {
        &self.info
    }

    /// Number of objects.
    pub fn len(&self) -> u64 {
        self.info.object_count
    }

    /// Whether the index holds no object.
    pub fn is_empty(&self) -> bool {
        self.info.object_count == 0
    }

    fn check_id(&self, id: u32) -> Result<u64> {
        let i = u64::from(id);
        if i >= self.info.object_count {
            return Err(HprofError::InvalidArgument(format!(
                "object id {id} is out of range (0..{})",
                self.info.object_count
            )));
        }
        Ok(i)
    }

    fn word(file: &IndexFile, i: u64) -> Result<u64> {
        file.u64_at(i)
            .ok_or_else(|| HprofError::format(format!("{} is truncated", file.path().display())))
    }

    /// Address of object `id`.
    pub fn address_of(&self, id: u32) -> Result<u64> {
        Self::word(&self.identifiers, self.check_id(id)?)
    }

    /// Id of the object at `address`, if indexed.
    pub fn id_of(&self, address: u64) -> Option<u32> {
        let (mut lo, mut hi) = (0u64, self.info.object_count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.identifiers.u64_at(mid)? {
                a if a < address => lo = mid + 1,
                a if a > address => hi = mid,
                _ => return u32::try_from(mid).ok(),
            }
        }
        None
    }

    /// Class id of object `id`.
    pub fn class_id_of(&self, id: u32) -> Result<u32> {
        let i = self.check_id(id)?;
        self.object_class
            .u32_at(i)
            .ok_or_else(|| HprofError::format("object class index is truncated"))
    }

    /// Record position of object `id`.
    pub fn position_of(&self, id: u32) -> Result<u64> {
        Self::word(&self.positions, self.check_id(id)?)
    }

    /// Heap size of array `id`, 0 for other objects.
    pub fn array_size_of(&self, id: u32) -> Result<u64> {
        Self::word(&self.array_sizes, self.check_id(id)?)
    }

    /// Outbound references of object `id`.
    pub fn outbound_of(&self, id: u32) -> Result<Vec<u32>> {
        let i = self.check_id(id)?;
        let start = Self::word(&self.outbound, i)?;
        let end = Self::word(&self.outbound, i + 1)?;
        let base = (self.info.object_count + 1) * 8;
        let bytes = self.outbound.payload();
        let range = usize::try_from(base + start * 4)
            .ok()
            .zip(usize::try_from(base + end * 4).ok())
            .filter(|(s, e)| s <= e && *e <= bytes.len())
            .ok_or_else(|| HprofError::format("outbound index is truncated"))?;
        Ok(bytes[range.0..range.1].chunks_exact(4).map(le_u32).collect())
    }

    /// Class records in object id order.
    pub fn classes(&self) -> &[ClassRecord] {
        &self.classes
    }

    /// Rebuilds the shared class table.
    pub fn class_table(&self) -> Result<ClassTable> {
        ClassTable::new(self.classes.clone(), self.info.id_size)
    }

    /// Global GC roots by object id.
    pub fn gc_roots(&self) -> &[(u32, Vec<GcRootInfo>)] {
        &self.gc_roots
    }

    /// Roots of object `id`, if it is a global root.
    pub fn roots_of(&self, id: u32) -> Option<&[GcRootInfo]> {
        self.gc_roots
            .binary_search_by_key(&id, |(i, _)| *i)
            .ok()
            .map(|i| self.gc_roots[i].1.as_slice())
    }

    /// Thread-local roots by thread id.
    pub fn thread_locals(&self) -> &[(u32, Vec<(u32, Vec<GcRootInfo>)>)] {
        &self.thread_locals
    }

    /// Sampling totals, when the build discarded objects.
    pub fn histogram(&self) -> Option<&DiscardHistogram> {
        self.histogram.as_ref()
    }
}
