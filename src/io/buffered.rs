use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use super::PositionInput;
use crate::error::{HprofError, Result};

/// Default read granularity of [`BufferedInput`].
pub const DEFAULT_READ_LENGTH: usize = 64 * 1024;

/// A byte source addressed by absolute logical position.
pub trait RandomSource {
    /// Reads up to `buf.len()` bytes starting at `pos`; returns 0 at end of data.
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize>;

    /// Exact logical length, when it is known without decoding the whole source.
    fn exact_len(&self) -> Option<u64>;

    /// Best available length estimate, used for progress reporting.
    fn estimated_len(&self) -> u64 {
        self.exact_len().unwrap_or(0)
    }
}

impl RandomSource for File {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.seek(SeekFrom::Start(pos))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn exact_len(&self) -> Option<u64> {
        self.metadata().ok().map(|m| m.len())
    }
}

/// A buffered cursor over a [`RandomSource`].
///
/// The buffer is twice the read length. When a decode needs more bytes than remain, the
/// unread tail is moved to the front and the next read appended behind it, so a value that
/// straddles two source reads is decoded from one contiguous slice. Bytes before the cursor
/// stay valid until the next compaction, which makes short backward seeks free.
#[derive(Debug)]
pub struct BufferedInput<S> {
    source: S,
    buffer: Box<[u8]>,
    read_length: usize,
    /// Next unread byte in `buffer`.
    start: usize,
    /// End of valid data in `buffer`.
    end: usize,
    /// Source position of `buffer[end]`.
    source_pos: u64,
}

impl<S: RandomSource> BufferedInput<S> {
    /// Wraps `source` with the default read length, positioned at 0.
    pub fn new(source: S) -> Self {
        Self::with_read_length(source, DEFAULT_READ_LENGTH)
    }

    /// Wraps `source` with an explicit read length.
    pub fn with_read_length(source: S, read_length: usize) -> Self {
        let read_length = read_length.max(16);
        Self {
            source,
            buffer: vec![0u8; read_length * 2].into_boxed_slice(),
            read_length,
            start: 0,
            end: 0,
            source_pos: 0,
        }
    }

    /// The wrapped source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Mutable access to the wrapped source.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Unwraps the source.
    pub fn into_inner(self) -> S {
        self.source
    }

    fn available(&self) -> usize {
        self.end - self.start
    }

    /// Makes at least `n` bytes (at most the read length) contiguous at the cursor.
    ///
    /// Returns the number of bytes actually available, which is less than `n` only at end
    /// of data.
    fn ensure_available(&mut self, n: usize) -> Result<usize> {
        let n = n.min(self.read_length);
        if self.available() >= n {
            return Ok(self.available());
        }
        if self.start > 0 {
            self.buffer.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        while self.available() < n {
            let room = self.buffer.len() - self.end;
            let want = room.min(self.read_length);
            let got = self
                .source
                .read_at(self.source_pos, &mut self.buffer[self.end..self.end + want])?;
            if got == 0 {
                break;
            }
            self.end += got;
            self.source_pos += got as u64;
        }
        Ok(self.available())
    }

    fn contiguous<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.ensure_available(N)? < N {
            return Err(HprofError::eof(format!(
                "needed {N} bytes at offset {}",
                self.position()
            )));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buffer[self.start..self.start + N]);
        self.start += N;
        Ok(out)
    }
}

impl<S: RandomSource> PositionInput for BufferedInput<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.available() == 0 {
            if buf.len() >= self.read_length {
                // Large reads bypass the buffer.
                let got = self.source.read_at(self.source_pos, buf)?;
                self.source_pos += got as u64;
                self.start = 0;
                self.end = 0;
                return Ok(got);
            }
            if self.ensure_available(1)? == 0 {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.available());
        buf[..n].copy_from_slice(&self.buffer[self.start..self.start + n]);
        self.start += n;
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.source_pos - self.available() as u64
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        let buffer_base = self.source_pos - self.end as u64;
        if pos >= buffer_base && pos <= self.source_pos {
            self.start = (pos - buffer_base) as usize;
            return Ok(());
        }
        self.start = 0;
        self.end = 0;
        self.source_pos = pos;
        Ok(())
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        let avail = self.available() as u64;
        if n <= avail {
            self.start += n as usize;
            return Ok(n);
        }
        let target = self.position() + n;
        if n - avail > self.read_length as u64 {
            let target = match self.source.exact_len() {
                Some(len) => target.min(len.max(self.position())),
                None => target,
            };
            let from = self.position();
            self.seek(target)?;
            return Ok(target - from);
        }
        let mut left = n;
        while left > 0 {
            if self.available() == 0 && self.ensure_available(1)? == 0 {
                break;
            }
            let step = left.min(self.available() as u64);
            self.start += step as usize;
            left -= step;
        }
        Ok(n - left)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.contiguous::<1>()?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.contiguous::<2>()?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.contiguous::<4>()?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.contiguous::<8>()?))
    }
}
