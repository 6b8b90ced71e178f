//! Pass 2: cutting object records out of the dump in bounded batches.
//!
//! A single [`BatchProducer`] walks the heap dump bodies located by Pass 1 and copies the
//! bytes of every object record into a [`Batch`]. A batch closes when it holds
//! `batch_records` records or `batch_bytes` bytes, whichever comes first; one record larger
//! than the byte budget forms a batch of its own. Batches are decoded independently, so
//! records keep their order within a batch but not across batches.
//!
//! Primitive arrays whose content reaches the lazy threshold are copied without their
//! content; the decoder leaves such content in the dump.

use log::trace;

use super::{Segment, check_within, root_payload_len, skip_class_dump};
use crate::error::{HprofError, Result};
use crate::hprof::{BasicType, SubRecordTag};
use crate::io::{ByteArrayInput, PositionInput};
use crate::monitor::ProgressMonitor;

/// A run of object records copied out of the dump.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Batch {
    data: Vec<u8>,
    /// `(offset in data, dump position)` of each record.
    entries: Vec<(usize, u64)>,
    /// Dump bytes covered, for progress.
    covered: u64,
}

impl Batch {
    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch holds no record.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes held in memory.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Dump bytes the batch spans, skipped records included.
    pub fn covered(&self) -> u64 {
        self.covered
    }

    /// Cursors over each record, positioned at its tag byte.
    pub fn records(&self) -> impl Iterator<Item = ByteArrayInput<'_>> + '_ {
        self.entries.iter().enumerate().map(|(i, &(offset, position))| {
            let end = self
                .entries
                .get(i + 1)
                .map_or(self.data.len(), |&(next, _)| next);
            ByteArrayInput::new(&self.data[offset..end], position)
        })
    }
}

/// Limits of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Maximum records per batch.
    pub records: usize,
    /// Byte budget per batch.
    pub bytes: usize,
    /// Content byte count at and above which primitive array content is not copied.
    pub lazy_threshold: u64,
}

/// Splits the heap dump bodies into batches.
pub struct BatchProducer<'a, I> {
    input: I,
    segments: Vec<Segment>,
    current: usize,
    /// Segment the cursor was last positioned into.
    entered: Option<usize>,
    id_size: u32,
    limits: BatchLimits,
    monitor: &'a dyn ProgressMonitor,
    finished: bool,
}

impl<I> std::fmt::Debug for BatchProducer<'_, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProducer")
            .field("segments", &self.segments)
            .field("current", &self.current)
            .field("limits", &self.limits)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<'a, I: PositionInput> BatchProducer<'a, I> {
    /// Creates a producer over `segments`.
    pub fn new(
        input: I,
        segments: Vec<Segment>,
        id_size: u32,
        limits: BatchLimits,
        monitor: &'a dyn ProgressMonitor,
    ) -> Self {
        Self {
            input,
            segments,
            current: 0,
            entered: None,
            id_size,
            limits,
            monitor,
            finished: false,
        }
    }

    /// Cuts the next batch; `None` once every segment is consumed.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.finished {
            return Ok(None);
        }
        if self.monitor.is_cancelled() {
            self.finished = true;
            return Err(HprofError::Cancelled);
        }
        let mut batch = Batch::default();
        while let Some(&segment) = self.segments.get(self.current) {
            if self.entered != Some(self.current) {
                self.input.seek(segment.start)?;
                self.entered = Some(self.current);
            }
            if self.input.position() >= segment.end {
                self.current += 1;
                continue;
            }
            if batch.entries.len() >= self.limits.records || batch.data.len() >= self.limits.bytes
            {
                break;
            }
            self.copy_record(&segment, &mut batch)?;
        }
        if batch.is_empty() && self.current >= self.segments.len() {
            self.finished = true;
            return Ok(None);
        }
        trace!("batch of {} records, {} bytes", batch.len(), batch.byte_len());
        Ok(Some(batch))
    }

    /// Copies or skips the sub-record at the cursor.
    fn copy_record(&mut self, segment: &Segment, batch: &mut Batch) -> Result<()> {
        let id = u64::from(self.id_size);
        let position = self.input.position();
        let tag = SubRecordTag::decode(self.input.read_u8()?, position)?;
        let (copy_len, skip_len) = match tag {
            SubRecordTag::ClassDump => {
                skip_class_dump(&mut self.input, self.id_size)?;
                (0, 0)
            }
            SubRecordTag::InstanceDump => {
                self.input.skip_fully(id + 4 + id)?;
                let len = u64::from(self.input.read_u32()?);
                (1 + 2 * id + 8 + len, 0)
            }
            SubRecordTag::ObjectArrayDump => {
                self.input.skip_fully(id + 4)?;
                let length = u64::from(self.input.read_u32()?);
                (1 + 2 * id + 8 + length * id, 0)
            }
            SubRecordTag::PrimitiveArrayDump => {
                self.input.skip_fully(id + 4)?;
                let length = u64::from(self.input.read_u32()?);
                let ty = BasicType::decode(self.input.read_u8()?)?;
                let header = 1 + id + 4 + 4 + 1;
                let content = length * u64::from(ty.size(self.id_size));
                if content >= self.limits.lazy_threshold {
                    (header, content)
                } else {
                    (header + content, 0)
                }
            }
            root => {
                self.input.skip_fully(id + root_payload_len(root, self.id_size))?;
                (0, 0)
            }
        };

        if copy_len > 0 {
            self.input.seek(position)?;
            let offset = batch.data.len();
            let len = usize::try_from(copy_len).map_err(|_| {
                HprofError::format(format!("record at {position} is too large to decode"))
            })?;
            batch.data.resize(offset + len, 0);
            self.input.read_fully(&mut batch.data[offset..])?;
            batch.entries.push((offset, position));
            self.input.skip_fully(skip_len)?;
        }
        batch.covered += self.input.position() - position;
        check_within(self.input.position(), segment, "sub-record")
    }
}

impl<I: PositionInput> Iterator for BatchProducer<'_, I> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(batch) => batch.map(Ok),
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
