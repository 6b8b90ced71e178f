use std::borrow::Cow;

use super::PositionInput;
use crate::error::{HprofError, Result};

/// A cursor over bytes already in memory.
///
/// `base` is the dump position of the first byte, so positions reported by this cursor are
/// the same positions the bytes have in the source file. Pass 2 batches and single-record
/// reads use it to decode fragments copied out of the dump.
#[derive(Debug, Clone)]
pub struct ByteArrayInput<'a> {
    data: Cow<'a, [u8]>,
    base: u64,
    offset: usize,
}

impl<'a> ByteArrayInput<'a> {
    /// Wraps borrowed bytes that start at dump position `base`.
    pub fn new(data: &'a [u8], base: u64) -> Self {
        Self {
            data: Cow::Borrowed(data),
            base,
            offset: 0,
        }
    }

    /// Wraps owned bytes that start at dump position `base`.
    pub fn owned(data: Vec<u8>, base: u64) -> ByteArrayInput<'static> {
        ByteArrayInput {
            data: Cow::Owned(data),
            base,
            offset: 0,
        }
    }

    /// Bytes left before end of data.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Borrows the next `len` bytes without copying and advances past them.
    pub fn take(&mut self, len: usize) -> Result<&[u8]> {
        if len > self.remaining() {
            return Err(HprofError::eof(format!(
                "needed {len} bytes at offset {}, {} available",
                self.position(),
                self.remaining()
            )));
        }
        let start = self.offset;
        self.offset += len;
        Ok(&self.data[start..start + len])
    }
}

impl PositionInput for ByteArrayInput<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.remaining());
        buf[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.base + self.offset as u64
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        let end = self.base + self.data.len() as u64;
        if pos < self.base || pos > end {
            return Err(HprofError::InvalidArgument(format!(
                "seek to {pos} outside buffer [{}, {end}]",
                self.base
            )));
        }
        self.offset = (pos - self.base) as usize;
        Ok(())
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        let step = n.min(self.remaining() as u64);
        self.offset += step as usize;
        Ok(step)
    }
}
