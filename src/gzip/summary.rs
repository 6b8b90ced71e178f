//! Offset summaries: per-file tables of member lengths that survive between opens.
//!
//! A summary records, for each gzip member (or fixed-size chunk) already decoded, its
//! uncompressed and compressed length. Cumulative sums of those pairs give the member
//! boundaries, so a later open can jump straight to a boundary instead of re-inflating
//! everything before it.
//!
//! ## File layout (little endian)
//!
//! ```text
//! [magic "HPOS"] [version u32] [entries u32] [chunk size u32]
//! [source size u64] [source mtime ms u64] [created ms u64]
//! [(uncompressed u64, compressed u64) * entries] [xxhash64 of all previous bytes]
//! ```

use std::collections::HashMap;
use std::fs;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use parking_lot::Mutex;
use twox_hash::XxHash64;

use crate::config::DecompressionConfig;
use crate::error::{HprofError, Result};

/// Magic bytes of a summary file.
pub const SUMMARY_MAGIC: [u8; 4] = *b"HPOS";
/// Current summary layout version.
pub const SUMMARY_VERSION: u32 = 1;
/// Suffix appended to the source file name.
pub const SUMMARY_SUFFIX: &str = ".offsets";

const FIXED_HEADER: usize = 4 + 4 + 4 + 4 + 8 + 8 + 8;
const PAIR_SIZE: usize = 16;

/// Length pair of one member or chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLengths {
    /// Decompressed length.
    pub uncompressed: u64,
    /// Compressed length, header and trailer included.
    pub compressed: u64,
}

/// A chunk boundary: where a member starts in the file and in the logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Boundary {
    /// Offset of the member header in the compressed file.
    pub file_offset: u64,
    /// Offset of its first byte in the decompressed stream.
    pub logical_offset: u64,
}

/// Size and modification time of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    /// File size in bytes.
    pub size: u64,
    /// Modification time, ms since the epoch.
    pub modified: u64,
}

impl FileStamp {
    /// Reads the stamp of `path`.
    pub fn of(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self {
            size: meta.len(),
            modified,
        })
    }
}

/// The persisted member table of one compressed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetSummary {
    /// Declared block size for chunked files, 0 for plain gzip.
    pub chunk_size: u32,
    /// Stamp of the source when the table was built.
    pub stamp: FileStamp,
    /// Creation time of this summary, ms since the epoch.
    pub created: u64,
    /// Member lengths in file order.
    pub chunks: Vec<ChunkLengths>,
}

impl OffsetSummary {
    /// Builds a summary from member lengths.
    pub fn new(chunk_size: u32, stamp: FileStamp, chunks: Vec<ChunkLengths>) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            chunk_size,
            stamp,
            created,
            chunks,
        }
    }

    /// Rebuilds a summary from consecutive boundaries starting at (0, 0).
    ///
    /// Each pair of adjacent boundaries yields one entry.
    pub fn from_boundaries(chunk_size: u32, stamp: FileStamp, boundaries: &[Boundary]) -> Self {
        let chunks = boundaries
            .windows(2)
            .map(|w| ChunkLengths {
                uncompressed: w[1].logical_offset - w[0].logical_offset,
                compressed: w[1].file_offset - w[0].file_offset,
            })
            .collect();
        Self::new(chunk_size, stamp, chunks)
    }

    /// Boundaries implied by the table, including the one after the last entry.
    pub fn boundaries(&self) -> Vec<Boundary> {
        let mut out = Vec::with_capacity(self.chunks.len() + 1);
        let mut at = Boundary {
            file_offset: 0,
            logical_offset: 0,
        };
        out.push(at);
        for chunk in &self.chunks {
            at.file_offset += chunk.compressed;
            at.logical_offset += chunk.uncompressed;
            out.push(at);
        }
        out
    }

    /// Whether this summary describes the file with the given stamp and chunk size.
    pub fn matches(&self, stamp: FileStamp, chunk_size: u32) -> bool {
        self.stamp == stamp && self.chunk_size == chunk_size
    }

    /// Whether `other` should replace this summary in a cache.
    pub fn should_be_replaced_by(&self, other: &OffsetSummary) -> bool {
        self.stamp != other.stamp
            || self.chunk_size != other.chunk_size
            || other.chunks.len() > self.chunks.len()
    }

    /// The serialized entry table alone, without header or timestamps.
    pub fn chunk_table_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.chunks.len() * PAIR_SIZE);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.uncompressed.to_le_bytes());
            out.extend_from_slice(&chunk.compressed.to_le_bytes());
        }
        out
    }

    /// Serializes the summary.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_HEADER + self.chunks.len() * PAIR_SIZE + 8);
        out.extend_from_slice(&SUMMARY_MAGIC);
        out.extend_from_slice(&SUMMARY_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.chunk_size.to_le_bytes());
        out.extend_from_slice(&self.stamp.size.to_le_bytes());
        out.extend_from_slice(&self.stamp.modified.to_le_bytes());
        out.extend_from_slice(&self.created.to_le_bytes());
        out.extend_from_slice(&self.chunk_table_bytes());
        let checksum = checksum(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Parses a serialized summary, validating magic, version and checksum.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FIXED_HEADER + 8 {
            return Err(HprofError::format("offset summary is truncated"));
        }
        if bytes[0..4] != SUMMARY_MAGIC {
            return Err(HprofError::format("offset summary has wrong magic"));
        }
        let version = le_u32(bytes, 4);
        if version != SUMMARY_VERSION {
            return Err(HprofError::format(format!(
                "offset summary version {version} is not supported"
            )));
        }
        let entries = le_u32(bytes, 8) as usize;
        let expected = FIXED_HEADER + entries * PAIR_SIZE + 8;
        if bytes.len() != expected {
            return Err(HprofError::format(format!(
                "offset summary has {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        let body_end = expected - 8;
        if checksum(&bytes[..body_end]) != le_u64(bytes, body_end) {
            return Err(HprofError::format("offset summary checksum mismatch"));
        }

        let chunks = (0..entries)
            .map(|i| {
                let at = FIXED_HEADER + i * PAIR_SIZE;
                ChunkLengths {
                    uncompressed: le_u64(bytes, at),
                    compressed: le_u64(bytes, at + 8),
                }
            })
            .collect();
        Ok(Self {
            chunk_size: le_u32(bytes, 12),
            stamp: FileStamp {
                size: le_u64(bytes, 16),
                modified: le_u64(bytes, 24),
            },
            created: le_u64(bytes, 32),
            chunks,
        })
    }

    /// Writes the summary to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("offsets.tmp");
        fs::write(&tmp, self.to_bytes())?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Reads a summary from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(b)
}

fn checksum(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    hasher.finish()
}

/// Where the summary for `source` lives.
///
/// Without a summary directory the file sits next to the source as `<name>.offsets`.
/// With one, the name also carries a hash of the canonical source path so sources with
/// the same file name in different directories do not collide.
pub fn summary_path(source: &Path, summary_dir: Option<&Path>) -> PathBuf {
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dump".to_string());
    match summary_dir {
        None => source.with_file_name(format!("{file_name}{SUMMARY_SUFFIX}")),
        Some(dir) => {
            let canonical = fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf());
            let key = checksum(canonical.to_string_lossy().as_bytes());
            dir.join(format!("{file_name}-{key:016x}{SUMMARY_SUFFIX}"))
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    summary: OffsetSummary,
    inserted: u64,
}

/// Bounded cache of offset summaries shared by every handle the orchestrator opens.
///
/// Lookups consult memory first, then the summary file on disk. Stores keep at most
/// `capacity` summaries, evicting the oldest by creation time, and write the summary file
/// when persistence is enabled. Persistence failures are logged and otherwise ignored.
#[derive(Debug)]
pub struct OffsetMappingCache {
    capacity: usize,
    summary_dir: Option<PathBuf>,
    persist: bool,
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
    counter: std::sync::atomic::AtomicU64,
}

impl OffsetMappingCache {
    /// Creates a cache holding at most `capacity` summaries.
    pub fn new(capacity: usize, summary_dir: Option<PathBuf>, persist: bool) -> Self {
        Self {
            capacity: capacity.max(1),
            summary_dir,
            persist,
            entries: Mutex::new(HashMap::new()),
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Creates a cache from decompression settings.
    pub fn from_config(config: &DecompressionConfig) -> Self {
        Self::new(
            config.stored_mappings,
            config.summary_dir.clone(),
            config.persist_summaries,
        )
    }

    fn key(path: &Path) -> PathBuf {
        fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    /// Number of summaries held in memory.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no summary is held in memory.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the on-disk summary for `source`.
    pub fn path_for(&self, source: &Path) -> PathBuf {
        summary_path(source, self.summary_dir.as_deref())
    }

    /// Finds a summary valid for the current state of `source`.
    pub fn lookup(&self, source: &Path, stamp: FileStamp, chunk_size: u32) -> Option<OffsetSummary> {
        let key = Self::key(source);
        {
            let entries = self.entries.lock();
            if let Some(entry) = entries.get(&key)
                && entry.summary.matches(stamp, chunk_size)
            {
                return Some(entry.summary.clone());
            }
        }
        if !self.persist {
            return None;
        }

        let path = self.path_for(source);
        if !path.exists() {
            return None;
        }
        match OffsetSummary::load(&path) {
            Ok(summary) if summary.matches(stamp, chunk_size) => {
                debug!(
                    "loaded offset summary {} with {} entries",
                    path.display(),
                    summary.chunks.len()
                );
                self.remember(key, summary.clone());
                Some(summary)
            }
            Ok(_) => {
                debug!("discarding stale offset summary {}", path.display());
                let _ = fs::remove_file(&path);
                None
            }
            Err(e) => {
                warn!("ignoring unreadable offset summary {}: {e}", path.display());
                None
            }
        }
    }

    /// Offers a summary; returns true if it replaced what the cache held.
    pub fn store(&self, source: &Path, summary: OffsetSummary) -> bool {
        if summary.chunks.is_empty() {
            return false;
        }
        let key = Self::key(source);
        let replace = {
            let entries = self.entries.lock();
            entries
                .get(&key)
                .is_none_or(|existing| existing.summary.should_be_replaced_by(&summary))
        };
        if !replace {
            return false;
        }

        if self.persist {
            let path = self.path_for(source);
            if let Err(e) = summary.save(&path) {
                warn!("could not persist offset summary {}: {e}", path.display());
            }
        }
        self.remember(key, summary);
        true
    }

    fn remember(&self, key: PathBuf, summary: OffsetSummary) {
        let inserted = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut entries = self.entries.lock();
        entries.insert(key, CacheEntry { summary, inserted });
        while entries.len() > self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| (e.summary.created, e.inserted))
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
    }
}
