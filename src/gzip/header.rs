use std::io::Read;

use crc32fast::Hasher;

use crate::error::{HprofError, Result};

/// First two bytes of every gzip member.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// The only compression method defined by RFC 1952.
pub const METHOD_DEFLATE: u8 = 8;

const FLAG_HCRC: u8 = 0x02;
const FLAG_EXTRA: u8 = 0x04;
const FLAG_NAME: u8 = 0x08;
const FLAG_COMMENT: u8 = 0x10;
const FLAG_RESERVED: u8 = 0xe0;

/// Upper bound for FNAME / FCOMMENT strings; longer fields are rejected.
const MAX_STRING_FIELD: usize = 64 * 1024;

/// A parsed gzip member header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GzipHeader {
    /// FLG byte.
    pub flags: u8,
    /// MTIME field.
    pub mtime: u32,
    /// Original file name, if present.
    pub name: Option<String>,
    /// Comment, if present.
    pub comment: Option<String>,
    /// Number of header bytes consumed.
    pub length: usize,
}

impl GzipHeader {
    /// The uncompressed block size advertised by a chunked dump, if any.
    pub fn block_size(&self) -> Option<u32> {
        let comment = self.comment.as_deref()?;
        let rest = comment.strip_prefix(super::BLOCKSIZE_PREFIX)?;
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<u32>().ok().filter(|size| *size > 0)
    }
}

struct HeaderBytes<'r, R> {
    inner: &'r mut R,
    crc: Hasher,
    consumed: usize,
}

impl<R: Read> HeaderBytes<'_, R> {
    fn byte(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.fill(&mut b)?;
        Ok(b[0])
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                HprofError::eof("truncated gzip header")
            } else {
                e.into()
            }
        })?;
        self.crc.update(buf);
        self.consumed += buf.len();
        Ok(())
    }

    fn le_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.fill(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn zero_terminated(&mut self) -> Result<String> {
        let mut raw = Vec::new();
        loop {
            let b = self.byte()?;
            if b == 0 {
                break;
            }
            if raw.len() == MAX_STRING_FIELD {
                return Err(HprofError::format("gzip header string field too long"));
            }
            raw.push(b);
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

/// Parses one member header from `reader`.
///
/// Validates the magic, the compression method, the reserved flag bits and, when FHCRC is
/// set, the header checksum.
pub fn read_header<R: Read>(reader: &mut R) -> Result<GzipHeader> {
    let mut bytes = HeaderBytes {
        inner: reader,
        crc: Hasher::new(),
        consumed: 0,
    };

    let mut fixed = [0u8; 10];
    bytes.fill(&mut fixed)?;
    if fixed[0..2] != GZIP_MAGIC {
        return Err(HprofError::format("not in gzip format"));
    }
    if fixed[2] != METHOD_DEFLATE {
        return Err(HprofError::format(format!(
            "unsupported gzip compression method {}",
            fixed[2]
        )));
    }
    let flags = fixed[3];
    if flags & FLAG_RESERVED != 0 {
        return Err(HprofError::format(format!(
            "reserved gzip flag bits set: 0x{flags:02x}"
        )));
    }
    let mtime = u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);

    if flags & FLAG_EXTRA != 0 {
        let len = bytes.le_u16()? as usize;
        let mut extra = vec![0u8; len];
        bytes.fill(&mut extra)?;
    }
    let name = if flags & FLAG_NAME != 0 {
        Some(bytes.zero_terminated()?)
    } else {
        None
    };
    let comment = if flags & FLAG_COMMENT != 0 {
        Some(bytes.zero_terminated()?)
    } else {
        None
    };
    if flags & FLAG_HCRC != 0 {
        let expected = (bytes.crc.clone().finalize() & 0xffff) as u16;
        let mut stored = [0u8; 2];
        bytes.inner.read_exact(&mut stored)?;
        bytes.consumed += 2;
        if u16::from_le_bytes(stored) != expected {
            return Err(HprofError::format("corrupt gzip header checksum"));
        }
    }

    Ok(GzipHeader {
        flags,
        mtime,
        name,
        comment,
        length: bytes.consumed,
    })
}

/// Decodes the 8-byte member trailer into `(crc32, isize)`.
pub fn parse_trailer(trailer: &[u8; 8]) -> (u32, u32) {
    let crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let isize = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
    (crc, isize)
}

/// Checks a member trailer against the observed CRC and output length.
pub fn check_trailer(trailer: &[u8; 8], crc: u32, output_len: u64) -> Result<()> {
    let (stored_crc, stored_len) = parse_trailer(trailer);
    if stored_crc != crc {
        return Err(HprofError::format(format!(
            "gzip CRC mismatch: stored 0x{stored_crc:08x}, computed 0x{crc:08x}"
        )));
    }
    if stored_len != (output_len & 0xffff_ffff) as u32 {
        return Err(HprofError::format(format!(
            "gzip length mismatch: stored {stored_len}, decompressed {output_len}"
        )));
    }
    Ok(())
}
