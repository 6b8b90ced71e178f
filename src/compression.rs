//! Pluggable compression of index payloads.
//!
//! Only the outbound-reference payload is large enough to be worth compressing. The
//! algorithm id is stored in the tail [`MetaByte`](crate::format::MetaByte) so readers pick
//! the matching decompressor regardless of how the crate that opens the index was built.

use std::borrow::Cow;

use crate::error::{HprofError, Result};

/// Interface for compression algorithms.
///
/// Each compressor is identified by a unique ID stored in bits 1-3 of the meta byte.
pub trait Compressor: Send + Sync + std::fmt::Debug {
    /// Returns the unique ID. 0 is reserved for no compression.
    fn id(&self) -> u8;

    /// Human readable name, used by the inspector.
    fn name(&self) -> &'static str;

    /// Compresses the data.
    ///
    /// May borrow the input when no compression is performed.
    fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>>;

    /// Decompresses the data.
    fn decompress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>>;
}

/// Pass-through compressor (ID 0).
#[derive(Debug, Clone, Copy)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn id(&self) -> u8 {
        0
    }

    fn name(&self) -> &'static str {
        "none"
    }

    fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(data))
    }

    fn decompress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        // Zero-copy: borrows from the mmap.
        Ok(Cow::Borrowed(data))
    }
}

/// LZ4 block compressor (ID 1), available with the `lz4_flex` feature.
///
/// The stored form is `[u32 LE uncompressed length][block]`.
#[cfg(feature = "lz4_flex")]
#[derive(Debug, Clone, Copy)]
pub struct Lz4Compressor;

#[cfg(feature = "lz4_flex")]
impl Compressor for Lz4Compressor {
    fn id(&self) -> u8 {
        1
    }

    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        if data.len() > u32::MAX as usize {
            return Err(HprofError::Compression(format!(
                "payload of {} bytes exceeds the LZ4 block limit",
                data.len()
            )));
        }
        Ok(Cow::Owned(lz4_flex::compress_prepend_size(data)))
    }

    fn decompress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        let vec = lz4_flex::decompress_size_prepended(data)
            .map_err(|e| HprofError::Compression(e.to_string()))?;
        Ok(Cow::Owned(vec))
    }
}

/// Centralized registry mapping stored algorithm IDs to compressors.
#[derive(Debug)]
pub struct CompressorRegistry {
    algorithms: Vec<Option<Box<dyn Compressor>>>,
}

impl CompressorRegistry {
    /// Creates a registry with the built-in algorithms.
    ///
    /// *   ID 0: `NoCompression`
    /// *   ID 1: `Lz4Compressor` (if the `lz4_flex` feature is enabled)
    pub fn new() -> Self {
        let mut reg = Self {
            algorithms: (0..8).map(|_| None).collect(),
        };
        reg.register(Box::new(NoCompression));
        #[cfg(feature = "lz4_flex")]
        reg.register(Box::new(Lz4Compressor));
        reg
    }

    /// Registers a compressor in the slot named by its ID, replacing any previous one.
    pub fn register(&mut self, algo: Box<dyn Compressor>) {
        let id = usize::from(algo.id());
        if id >= self.algorithms.len() {
            self.algorithms.resize_with(id + 1, || None);
        }
        if let Some(slot) = self.algorithms.get_mut(id) {
            *slot = Some(algo);
        }
    }

    /// Retrieves a compressor by its ID.
    ///
    /// # Errors
    /// Returns `HprofError::Compression` if the ID is not registered, which happens when
    /// an index written with LZ4 is opened by a build without the feature.
    pub fn get(&self, id: u8) -> Result<&dyn Compressor> {
        self.algorithms
            .get(usize::from(id))
            .and_then(|opt| opt.as_deref())
            .ok_or_else(|| {
                HprofError::Compression(format!(
                    "algorithm ID {id} is not registered or available"
                ))
            })
    }

    /// The compressor to use for the adjacency payload.
    ///
    /// Falls back to no compression when LZ4 is requested but not compiled in.
    pub fn for_adjacency(&self, compress: bool) -> &dyn Compressor {
        if compress && let Ok(lz4) = self.get(1) {
            return lz4;
        }
        &NoCompression
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
