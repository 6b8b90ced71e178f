//! HPROF record framing shared by both passes and the object reader.
//!
//! - [`pass1`]: the single-threaded scanner that finds classes, roots and object addresses.
//! - [`pass2`]: the batch producer that cuts object records out of the dump for parallel
//!   decoding.
//! - [`decode`]: the one object decoder used by Pass 2 and by random-access reads.

pub mod decode;
pub mod pass1;
pub mod pass2;

use log::trace;

use crate::error::{HprofError, Result};
use crate::hprof::{BasicType, MAX_VERSION_LENGTH, RecordTag, SubRecordTag, Version};
use crate::io::PositionInput;

/// Top-level fields that precede the first record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpHeader {
    /// Format version.
    pub version: Version,
    /// Identifier width, 4 or 8.
    pub id_size: u32,
    /// Creation time, milliseconds since the epoch.
    pub timestamp: u64,
    /// Position of the first record.
    pub body_start: u64,
}

/// Reads the version string, identifier width and timestamp.
///
/// The version string is read byte by byte up to its NUL terminator; a stream without a
/// terminator in the first [`MAX_VERSION_LENGTH`] bytes is not a heap dump.
pub fn read_header<I: PositionInput>(input: &mut I) -> Result<DumpHeader> {
    let mut label = Vec::with_capacity(MAX_VERSION_LENGTH);
    loop {
        let byte = input
            .try_read_u8()?
            .ok_or_else(|| HprofError::eof("dump ends inside the version string"))?;
        if byte == 0 {
            break;
        }
        label.push(byte);
        if label.len() >= MAX_VERSION_LENGTH {
            return Err(HprofError::format("no version string terminator; not a heap dump"));
        }
    }
    let version = Version::from_label(&String::from_utf8_lossy(&label))?;
    let id_size = input.read_u32()?;
    if id_size != 4 && id_size != 8 {
        return Err(HprofError::format(format!(
            "identifier width must be 4 or 8, got {id_size}"
        )));
    }
    let timestamp = input.read_u64()?;
    Ok(DumpHeader {
        version,
        id_size,
        timestamp,
        body_start: input.position(),
    })
}

/// Header of one top-level record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Raw tag byte.
    pub raw_tag: u8,
    /// Decoded tag; `None` for tags this crate ignores.
    pub tag: Option<RecordTag>,
    /// Microseconds since the header timestamp.
    pub time: u32,
    /// Body length, after any repair.
    pub length: u64,
    /// Position of the tag byte.
    pub position: u64,
    /// Position of the first body byte.
    pub body_start: u64,
}

impl RecordHeader {
    /// Position one past the body.
    pub fn end(&self) -> u64 {
        self.body_start + self.length
    }

    /// Whether this record carries heap dump sub-records.
    pub fn is_heap_dump(&self) -> bool {
        matches!(
            self.tag,
            Some(RecordTag::HeapDump | RecordTag::HeapDumpSegment)
        )
    }
}

/// Reads a record header; `None` at a clean end of data between records.
pub fn read_record_header<I: PositionInput>(input: &mut I) -> Result<Option<RecordHeader>> {
    let position = input.position();
    let Some(raw_tag) = input.try_read_u8()? else {
        return Ok(None);
    };
    let time = input.read_u32()?;
    let length = u64::from(input.read_u32()?);
    let tag = RecordTag::try_from(raw_tag).ok();
    if tag.is_none() {
        trace!("skipping record with unknown tag 0x{raw_tag:02x} at {position}");
    }
    Ok(Some(RecordHeader {
        raw_tag,
        tag,
        time,
        length,
        position,
        body_start: input.position(),
    }))
}

/// A heap dump body range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First sub-record position.
    pub start: u64,
    /// Position one past the body.
    pub end: u64,
}

impl Segment {
    /// Body length.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Bytes that follow the object id of a GC root sub-record.
pub fn root_payload_len(tag: SubRecordTag, id_size: u32) -> u64 {
    match tag {
        SubRecordTag::RootJniGlobal => u64::from(id_size),
        SubRecordTag::RootJniLocal
        | SubRecordTag::RootJavaFrame
        | SubRecordTag::RootThreadObject => 8,
        SubRecordTag::RootNativeStack | SubRecordTag::RootThreadBlock => 4,
        SubRecordTag::RootUnknown
        | SubRecordTag::RootStickyClass
        | SubRecordTag::RootMonitorUsed
        | SubRecordTag::ClassDump
        | SubRecordTag::InstanceDump
        | SubRecordTag::ObjectArrayDump
        | SubRecordTag::PrimitiveArrayDump => 0,
    }
}

/// Skips one typed value.
pub fn skip_value<I: PositionInput>(input: &mut I, ty: BasicType, id_size: u32) -> Result<()> {
    input.skip_fully(u64::from(ty.size(id_size)))
}

/// Skips a CLASS_DUMP body; the input is positioned after the tag.
pub fn skip_class_dump<I: PositionInput>(input: &mut I, id_size: u32) -> Result<()> {
    let id = u64::from(id_size);
    // address, stack serial, super, loader, signers, domain, 2 reserved, instance size
    input.skip_fully(id + 4 + 6 * id + 4)?;
    let constants = input.read_u16()?;
    for _ in 0..constants {
        input.skip_fully(2)?;
        let ty = BasicType::decode(input.read_u8()?)?;
        skip_value(input, ty, id_size)?;
    }
    let statics = input.read_u16()?;
    for _ in 0..statics {
        input.skip_fully(id)?;
        let ty = BasicType::decode(input.read_u8()?)?;
        skip_value(input, ty, id_size)?;
    }
    let fields = input.read_u16()?;
    input.skip_fully(u64::from(fields) * (id + 1))
}

/// Fails unless the cursor stayed within the heap dump body.
pub(crate) fn check_within(position: u64, segment: &Segment, what: &str) -> Result<()> {
    if position > segment.end {
        return Err(HprofError::format(format!(
            "{what} ends at {position}, past the end of its heap dump record at {}",
            segment.end
        )));
    }
    Ok(())
}
