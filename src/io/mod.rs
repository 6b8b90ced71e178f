//! Binary cursors over dump bytes.
//!
//! [`PositionInput`] is the one reading contract used by both passes and the object reader:
//! sequential reads with a known logical position, big-endian typed decodes and, for
//! backings that allow it, absolute seeks. Three backings implement it:
//!
//! - [`ByteArrayInput`]: an in-memory slice carrying the file position it was cut from.
//! - [`BufferedInput`]: a double-size buffer over any [`RandomSource`].
//! - [`DumpSource`]: a [`RandomSource`] that picks plain file, chunked gzip or seekable gzip
//!   access for a path.

mod buffered;
mod memory;
mod source;

pub use buffered::{BufferedInput, RandomSource};
pub use memory::ByteArrayInput;
pub use source::{DumpSource, SourceKind};

use crate::error::{HprofError, Result};
use crate::hprof::{BasicType, Value};

/// Scratch size used when skipping through a backing that cannot seek.
const SKIP_BUFFER_SIZE: usize = 8 * 1024;

/// A positioned byte reader with typed big-endian decodes.
pub trait PositionInput {
    /// Reads up to `buf.len()` bytes; returns 0 only at end of data.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Logical position of the next byte.
    fn position(&self) -> u64;

    /// Moves to an absolute logical position.
    fn seek(&mut self, _pos: u64) -> Result<()> {
        Err(HprofError::Unsupported("seek on a sequential cursor".into()))
    }

    /// Skips up to `n` bytes, returning how many were skipped.
    fn skip(&mut self, n: u64) -> Result<u64> {
        let mut scratch = [0u8; SKIP_BUFFER_SIZE];
        let mut left = n;
        while left > 0 {
            let step = left.min(SKIP_BUFFER_SIZE as u64) as usize;
            let got = self.read(&mut scratch[..step])?;
            if got == 0 {
                break;
            }
            left -= got as u64;
        }
        Ok(n - left)
    }

    /// Always fails; positions are explicit in this crate.
    fn mark(&mut self) -> Result<()> {
        Err(HprofError::Unsupported("mark".into()))
    }

    /// Always fails; positions are explicit in this crate.
    fn reset(&mut self) -> Result<()> {
        Err(HprofError::Unsupported("reset".into()))
    }

    /// Fills `buf` completely or fails with `UnexpectedEof`.
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let got = self.read(&mut buf[filled..])?;
            if got == 0 {
                return Err(HprofError::eof(format!(
                    "needed {} bytes at offset {}",
                    buf.len() - filled,
                    self.position()
                )));
            }
            filled += got;
        }
        Ok(())
    }

    /// Skips exactly `n` bytes or fails with `UnexpectedEof`.
    fn skip_fully(&mut self, n: u64) -> Result<()> {
        let skipped = self.skip(n)?;
        if skipped < n {
            return Err(HprofError::eof(format!(
                "could not skip {} bytes at offset {}",
                n - skipped,
                self.position()
            )));
        }
        Ok(())
    }

    /// Reads one unsigned byte.
    fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_fully(&mut b)?;
        Ok(b[0])
    }

    /// Reads one byte, returning `None` at a clean end of data.
    fn try_read_u8(&mut self) -> Result<Option<u8>> {
        let mut b = [0u8; 1];
        match self.read(&mut b)? {
            0 => Ok(None),
            _ => Ok(Some(b[0])),
        }
    }

    /// Reads a big-endian `u16`.
    fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_fully(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    /// Reads a big-endian `u32`.
    fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_fully(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    /// Reads a big-endian `u64`.
    fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_fully(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    /// Reads a big-endian `i16`.
    fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    /// Reads a big-endian `i32`.
    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    /// Reads a big-endian `i64`.
    fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Reads a big-endian IEEE 754 `f32`.
    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Reads a big-endian IEEE 754 `f64`.
    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Reads an identifier of the negotiated width, zero-extending 4-byte ids.
    fn read_id(&mut self, id_size: u32) -> Result<u64> {
        match id_size {
            4 => Ok(u64::from(self.read_u32()?)),
            8 => self.read_u64(),
            other => Err(HprofError::format(format!(
                "identifier width must be 4 or 8, got {other}"
            ))),
        }
    }

    /// Reads a value of the given type.
    fn read_value(&mut self, ty: BasicType, id_size: u32) -> Result<Value> {
        Ok(match ty {
            BasicType::Object => Value::Object(self.read_id(id_size)?),
            BasicType::Boolean => Value::Boolean(self.read_u8()? != 0),
            BasicType::Char => Value::Char(self.read_u16()?),
            BasicType::Float => Value::Float(self.read_f32()?),
            BasicType::Double => Value::Double(self.read_f64()?),
            BasicType::Byte => Value::Byte(self.read_u8()? as i8),
            BasicType::Short => Value::Short(self.read_i16()?),
            BasicType::Int => Value::Int(self.read_i32()?),
            BasicType::Long => Value::Long(self.read_i64()?),
        })
    }

    /// Reads a one-byte type tag followed by a value of that type.
    fn read_tagged_value(&mut self, id_size: u32) -> Result<Value> {
        let ty = BasicType::decode(self.read_u8()?)?;
        self.read_value(ty, id_size)
    }

    /// Reads `len` bytes into a fresh vector.
    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_fully(&mut out)?;
        Ok(out)
    }
}

impl<T: PositionInput + ?Sized> PositionInput for &mut T {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        (**self).seek(pos)
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        (**self).skip(n)
    }
}
