//! Defines the physical binary layout of index files.
//!
//! # Layout
//! Every index file holds one payload followed by a fixed-size tail header:
//!
//! File: `[Payload] [Tail Header]`
//!
//! The tail is written last, so a file whose tail is missing or does not carry the
//! magic bytes was never completed.
//!
//! ## Tail Anatomy (little endian, 32 bytes)
//! `[Magic 4] [Version 2] [Kind 1] [MetaByte 1] [Entries 8] [Payload Length 8] [Checksum 8]`

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use twox_hash::XxHash64;

use crate::error::{HprofError, Result};

/// Magic bytes identifying an index file: "HPX1".
pub const MAGIC_BYTES: [u8; 4] = *b"HPX1";

/// Current layout version.
pub const FORMAT_VERSION: u16 = 1;

/// The fixed size of the tail header.
/// Magic(4) + Version(2) + Kind(1) + Meta(1) + Entries(8) + Length(8) + Checksum(8) = 32
pub const TAIL_HEADER_SIZE: usize = 32;

/// The index files a build produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive, Serialize)]
#[repr(u8)]
pub enum IndexKind {
    /// Sorted object addresses.
    Identifiers = 1,
    /// Class id per object id.
    ObjectClass = 2,
    /// Record position per object id.
    ObjectPosition = 3,
    /// Heap size per array id.
    ArraySize = 4,
    /// Outbound reference lists.
    Outbound = 5,
    /// Class table.
    Classes = 6,
    /// Global GC roots.
    GcRoots = 7,
    /// Thread-local GC roots.
    ThreadLocals = 8,
    /// Dump metadata.
    DumpInfo = 9,
    /// Sampling totals.
    DiscardHistogram = 10,
}

impl IndexKind {
    /// Every kind, in writing order.
    pub const ALL: [IndexKind; 10] = [
        IndexKind::Identifiers,
        IndexKind::ObjectClass,
        IndexKind::ObjectPosition,
        IndexKind::ArraySize,
        IndexKind::Outbound,
        IndexKind::Classes,
        IndexKind::GcRoots,
        IndexKind::ThreadLocals,
        IndexKind::DumpInfo,
        IndexKind::DiscardHistogram,
    ];

    /// File name component: `<prefix>.<name>.index`.
    pub fn file_stem(self) -> &'static str {
        match self {
            Self::Identifiers => "identifiers",
            Self::ObjectClass => "o2class",
            Self::ObjectPosition => "o2position",
            Self::ArraySize => "a2size",
            Self::Outbound => "outbound",
            Self::Classes => "classes",
            Self::GcRoots => "roots",
            Self::ThreadLocals => "threads",
            Self::DumpInfo => "info",
            Self::DiscardHistogram => "discarded",
        }
    }

    /// Whether a complete build may legitimately lack this file.
    pub fn is_optional(self) -> bool {
        matches!(self, Self::DiscardHistogram)
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Configuration flags for a payload, stored in the tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaByte(u8);

impl MetaByte {
    const COMPRESSION_MASK: u8 = 0b0000_1110; // Bits 1-3

    /// Creates a meta byte for the given compression id.
    pub fn new(compression_id: u8) -> Self {
        Self((compression_id & 0x07) << 1)
    }

    /// Decodes the byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Returns the compression algorithm ID (0-7).
    pub fn compression_method(&self) -> u8 {
        (self.0 & Self::COMPRESSION_MASK) >> 1
    }

    /// Returns the raw byte representation.
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// The tail header located at the very end of each index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailHeader {
    /// Layout version.
    pub version: u16,
    /// Which index the file holds.
    pub kind: IndexKind,
    /// Compression flags.
    pub meta: MetaByte,
    /// Number of logical entries (objects, classes, roots).
    pub entries: u64,
    /// Stored payload length in bytes.
    pub payload_len: u64,
    /// XxHash64 of the stored payload.
    pub checksum: u64,
}

impl TailHeader {
    /// Creates a tail for a stored payload.
    pub fn new(kind: IndexKind, meta: MetaByte, entries: u64, payload: &[u8]) -> Self {
        Self {
            version: FORMAT_VERSION,
            kind,
            meta,
            entries,
            payload_len: payload.len() as u64,
            checksum: payload_checksum(payload),
        }
    }

    /// Serializes the tail to bytes.
    pub fn to_bytes(&self) -> [u8; TAIL_HEADER_SIZE] {
        let mut buf = [0u8; TAIL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC_BYTES);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6] = self.kind.into();
        buf[7] = self.meta.as_u8();
        buf[8..16].copy_from_slice(&self.entries.to_le_bytes());
        buf[16..24].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[24..32].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserializes a tail.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TAIL_HEADER_SIZE {
            return Err(HprofError::format("index file shorter than its tail header"));
        }
        if bytes[0..4] != MAGIC_BYTES {
            return Err(HprofError::format("index file has a bad magic number"));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(HprofError::format(format!(
                "index layout version {version} is not supported"
            )));
        }
        let kind = IndexKind::try_from(bytes[6])
            .map_err(|_| HprofError::format(format!("unknown index kind {}", bytes[6])))?;
        Ok(Self {
            version,
            kind,
            meta: MetaByte::from_byte(bytes[7]),
            entries: le_u64(&bytes[8..16]),
            payload_len: le_u64(&bytes[16..24]),
            checksum: le_u64(&bytes[24..32]),
        })
    }

    /// Reads the tail from the end of a whole file image.
    pub fn from_file_bytes(file: &[u8]) -> Result<Self> {
        let Some(start) = file.len().checked_sub(TAIL_HEADER_SIZE) else {
            return Err(HprofError::format("index file shorter than its tail header"));
        };
        let tail = Self::from_bytes(&file[start..])?;
        if tail.payload_len != start as u64 {
            return Err(HprofError::format(format!(
                "{} index declares {} payload bytes but holds {start}",
                tail.kind, tail.payload_len
            )));
        }
        Ok(tail)
    }
}

/// Checksum stored in the tail.
pub fn payload_checksum(payload: &[u8]) -> u64 {
    XxHash64::oneshot(0, payload)
}

pub(crate) fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

pub(crate) fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}
