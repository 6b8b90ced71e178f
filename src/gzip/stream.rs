//! A cloneable multi-member gzip decoder.
//!
//! Each [`GzipStream`] owns its full inflate state (decompressor tables, the 32 KiB history
//! window, buffered compressed input and running CRC) but not the file it reads from. The
//! file is lent to it on every call, which lets one open file serve many streams parked at
//! different logical offsets, and lets a stream be duplicated with a plain `clone()`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crc32fast::Hasher;
use miniz_oxide::inflate::TINFLStatus;
use miniz_oxide::inflate::core::inflate_flags::TINFL_FLAG_HAS_MORE_INPUT;
use miniz_oxide::inflate::core::{DecompressorOxide, decompress};

use super::header::{check_trailer, read_header};
use crate::error::{HprofError, Result};

/// History window; deflate back-references reach at most 32 KiB.
const WINDOW_SIZE: usize = 32 * 1024;
const WINDOW_MASK: usize = WINDOW_SIZE - 1;
const INPUT_SIZE: usize = 16 * 1024;

/// Approximate heap footprint of one stream, used for cache accounting.
pub const STREAM_FOOTPRINT: usize =
    WINDOW_SIZE + INPUT_SIZE + std::mem::size_of::<DecompressorOxide>();

/// A compressed file shared by all streams of one handle.
#[derive(Debug)]
pub struct SharedFile {
    file: File,
    pos: u64,
    len: u64,
}

impl SharedFile {
    /// Opens `path` for reading.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, pos: 0, len })
    }

    /// Compressed length of the file.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Estimated uncompressed length, from the trailing ISIZE field.
    pub fn estimated_length(&mut self) -> Result<u64> {
        if self.len < 18 {
            return Ok(self.len);
        }
        let mut isize = [0u8; 4];
        let mut filled = 0;
        while filled < isize.len() {
            let n = self.read_at(self.len - 4 + filled as u64, &mut isize[filled..])?;
            if n == 0 {
                return Err(HprofError::eof("gzip trailer"));
            }
            filled += n;
        }
        Ok(super::estimate_from_isize(self.len, u32::from_le_bytes(isize)))
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos != pos {
            self.file.seek(SeekFrom::Start(pos))?;
            self.pos = pos;
        }
        let n = self.file.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// A gzip member fully decoded by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberSpan {
    /// File offset of the member header.
    pub compressed_offset: u64,
    /// Header, body and trailer bytes.
    pub compressed_len: u64,
    /// Logical offset of the first decompressed byte.
    pub logical_offset: u64,
    /// Decompressed bytes.
    pub logical_len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Body,
    Eof,
}

/// A decoder positioned somewhere in a (possibly multi-member) gzip file.
#[derive(Clone)]
pub struct GzipStream {
    inflater: Box<DecompressorOxide>,
    window: Box<[u8]>,
    window_pos: usize,
    pending_start: usize,
    pending_len: usize,
    input: Box<[u8]>,
    input_start: usize,
    input_end: usize,
    /// File offset of `input[input_end]`.
    file_pos: u64,
    crc: Hasher,
    member_offset: u64,
    member_logical: u64,
    member_out: u64,
    state: State,
    position: u64,
    completed: Vec<MemberSpan>,
}

impl std::fmt::Debug for GzipStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipStream")
            .field("position", &self.position)
            .field("file_pos", &self.compressed_position())
            .field("state", &self.state)
            .finish()
    }
}

impl GzipStream {
    /// A stream at the start of the file.
    pub fn new() -> Self {
        Self::at_member(0, 0)
    }

    /// A stream at a known member boundary.
    pub fn at_member(compressed_offset: u64, logical_offset: u64) -> Self {
        Self {
            inflater: Box::default(),
            window: vec![0u8; WINDOW_SIZE].into_boxed_slice(),
            window_pos: 0,
            pending_start: 0,
            pending_len: 0,
            input: vec![0u8; INPUT_SIZE].into_boxed_slice(),
            input_start: 0,
            input_end: 0,
            file_pos: compressed_offset,
            crc: Hasher::new(),
            member_offset: compressed_offset,
            member_logical: logical_offset,
            member_out: 0,
            state: State::Header,
            position: logical_offset,
            completed: Vec::new(),
        }
    }

    /// Logical (decompressed) position of the next byte.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether the stream reached the end of the last member.
    pub fn is_eof(&self) -> bool {
        self.state == State::Eof && self.pending_len == 0
    }

    /// Compressed offset of the next unconsumed input byte.
    pub fn compressed_position(&self) -> u64 {
        self.file_pos - (self.input_end - self.input_start) as u64
    }

    /// Takes the spans of the members completed since the last call, in file order.
    pub fn take_completed(&mut self) -> Vec<MemberSpan> {
        std::mem::take(&mut self.completed)
    }

    /// Drops buffers that can be rebuilt, keeping the decoder usable.
    pub fn release(&mut self) {
        if self.is_eof() {
            self.input = Box::default();
            self.window = Box::default();
        }
    }

    /// Reads decompressed bytes; returns 0 at end of stream.
    pub fn read(&mut self, file: &mut SharedFile, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || !self.fill_pending(file)? {
            return Ok(0);
        }
        let n = buf.len().min(self.pending_len);
        buf[..n].copy_from_slice(&self.window[self.pending_start..self.pending_start + n]);
        self.consume(n);
        Ok(n)
    }

    /// Skips up to `n` decompressed bytes; returns how many were skipped.
    pub fn skip(&mut self, file: &mut SharedFile, n: u64) -> Result<u64> {
        let mut left = n;
        while left > 0 {
            if !self.fill_pending(file)? {
                break;
            }
            let step = left.min(self.pending_len as u64) as usize;
            self.consume(step);
            left -= step as u64;
        }
        Ok(n - left)
    }

    fn consume(&mut self, n: usize) {
        self.pending_start += n;
        self.pending_len -= n;
        self.position += n as u64;
    }

    /// Ensures decoded bytes are pending; false means end of stream.
    fn fill_pending(&mut self, file: &mut SharedFile) -> Result<bool> {
        while self.pending_len == 0 {
            match self.state {
                State::Eof => return Ok(false),
                State::Header => self.begin_member(file)?,
                State::Body => self.inflate_step(file)?,
            }
        }
        Ok(true)
    }

    fn begin_member(&mut self, file: &mut SharedFile) -> Result<()> {
        // A zero byte or the physical end where a header would start ends the stream.
        if self.input_start == self.input_end && self.refill(file)? == 0 {
            self.state = State::Eof;
            return Ok(());
        }
        if self.input[self.input_start] == 0 {
            self.state = State::Eof;
            return Ok(());
        }

        self.member_offset = self.compressed_position();
        self.member_logical = self.position;
        read_header(&mut MemberInput { stream: self, file })?;
        self.inflater.init();
        self.crc = Hasher::new();
        self.member_out = 0;
        self.state = State::Body;
        Ok(())
    }

    fn inflate_step(&mut self, file: &mut SharedFile) -> Result<()> {
        if self.input_start == self.input_end && self.refill(file)? == 0 {
            return Err(HprofError::eof(format!(
                "gzip member at offset {} is truncated",
                self.member_offset
            )));
        }

        let (status, consumed, written) = decompress(
            &mut self.inflater,
            &self.input[self.input_start..self.input_end],
            &mut self.window,
            self.window_pos,
            TINFL_FLAG_HAS_MORE_INPUT,
        );
        self.input_start += consumed;
        if written > 0 {
            let produced = &self.window[self.window_pos..self.window_pos + written];
            self.crc.update(produced);
            self.pending_start = self.window_pos;
            self.pending_len = written;
            self.window_pos = (self.window_pos + written) & WINDOW_MASK;
            self.member_out += written as u64;
        }

        match status {
            TINFLStatus::Done => self.finish_member(file),
            TINFLStatus::NeedsMoreInput | TINFLStatus::HasMoreOutput => Ok(()),
            TINFLStatus::FailedCannotMakeProgress => Err(HprofError::eof(format!(
                "gzip member at offset {} ended inside a deflate block",
                self.member_offset
            ))),
            other => Err(HprofError::format(format!(
                "corrupt deflate data in member at offset {}: {other:?}",
                self.member_offset
            ))),
        }
    }

    fn finish_member(&mut self, file: &mut SharedFile) -> Result<()> {
        let mut trailer = [0u8; 8];
        MemberInput { stream: self, file }
            .read_exact(&mut trailer)
            .map_err(|_| HprofError::eof("gzip trailer is truncated"))?;
        check_trailer(&trailer, self.crc.clone().finalize(), self.member_out)?;

        self.completed.push(MemberSpan {
            compressed_offset: self.member_offset,
            compressed_len: self.compressed_position() - self.member_offset,
            logical_offset: self.member_logical,
            logical_len: self.member_out,
        });
        self.state = State::Header;
        Ok(())
    }

    fn refill(&mut self, file: &mut SharedFile) -> io::Result<usize> {
        if self.input_start == self.input_end {
            self.input_start = 0;
            self.input_end = 0;
        } else if self.input_start > 0 {
            self.input.copy_within(self.input_start..self.input_end, 0);
            self.input_end -= self.input_start;
            self.input_start = 0;
        }
        let n = file.read_at(self.file_pos, &mut self.input[self.input_end..])?;
        self.input_end += n;
        self.file_pos += n as u64;
        Ok(n)
    }
}

impl Default for GzipStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw compressed bytes of the current member, for header and trailer parsing.
struct MemberInput<'s, 'f> {
    stream: &'s mut GzipStream,
    file: &'f mut SharedFile,
}

impl Read for MemberInput<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let s = &mut *self.stream;
        if s.input_start == s.input_end && s.refill(self.file)? == 0 {
            return Ok(0);
        }
        let n = buf.len().min(s.input_end - s.input_start);
        buf[..n].copy_from_slice(&s.input[s.input_start..s.input_start + n]);
        s.input_start += n;
        Ok(n)
    }
}
