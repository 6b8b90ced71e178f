//! Centralized error handling for the HPROF indexer.
//!
//! Every failure in the crate is represented by [`HprofError`] and propagated through
//! [`Result`]. The library never panics on malformed input: truncated files, bad tags and
//! inconsistent class data all surface as typed errors.
//!
//! ## Error Categories
//!
//! - **I/O Errors** ([`HprofError::Io`]): failures of the underlying file system calls.
//! - **Format Errors** ([`HprofError::UnsupportedVersion`], [`HprofError::InvalidFormat`],
//!   [`HprofError::UnexpectedEof`]): the input is not a well-formed dump or gzip stream.
//! - **Consistency Errors** ([`HprofError::CorruptDump`], [`HprofError::SizeMismatch`]): the
//!   dump parses but violates an invariant of the heap model.
//! - **Control** ([`HprofError::Cancelled`]): the build was cancelled by its monitor.
//! - **Internal Errors** ([`HprofError::Internal`]): logic errors, lock poisoning.
//!
//! ## Cloneability
//!
//! `HprofError` is `Clone` so that a failure raised on one Pass 2 worker can be captured
//! once and handed back to the orchestrator while the other workers unwind.
//!
//! ```rust
//! use hprof_index::HprofError;
//!
//! fn describe(err: &HprofError) -> &'static str {
//!     match err {
//!         HprofError::Cancelled => "cancelled",
//!         HprofError::CorruptDump(_) => "corrupt",
//!         _ => "other",
//!     }
//! }
//! assert_eq!(describe(&HprofError::Cancelled), "cancelled");
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;

/// A specialized `Result` type for indexer operations.
pub type Result<T> = std::result::Result<T, HprofError>;

/// The master error enum covering all failure domains of the indexer.
#[derive(Debug, Clone)]
pub enum HprofError {
    /// Low-level I/O failure.
    ///
    /// The underlying `io::Error` is wrapped in an `Arc` so the error stays `Clone`.
    Io(Arc<io::Error>),

    /// The version string of the dump is unknown or explicitly unsupported
    /// (for example the `JAVA PROFILE 1.0` beta format).
    UnsupportedVersion(String),

    /// The input violates the HPROF or gzip format: bad identifier width, unknown
    /// sub-record or value tag, malformed gzip header or trailer, CRC mismatch.
    InvalidFormat(String),

    /// The stream ended in the middle of a record.
    UnexpectedEof(String),

    /// A referenced class address resolves to a real object that was never defined
    /// as a class, or the class hierarchy is cyclic.
    CorruptDump(String),

    /// The bytes consumed while decoding an instance do not match its declared length.
    ///
    /// Only raised in strict mode; the other modes log the mismatch and continue.
    SizeMismatch {
        /// Address of the offending instance.
        address: u64,
        /// Length declared by the record header.
        declared: u64,
        /// Length implied by the resolved class hierarchy.
        decoded: u64,
    },

    /// The operation is not supported by this cursor or source (mark/reset, seeking a
    /// sequential-only backing).
    Unsupported(String),

    /// A caller supplied an invalid argument or configuration value.
    InvalidArgument(String),

    /// Bincode encoding or decoding of a structured index file failed.
    Serialization(String),

    /// Compression or decompression of an index payload failed.
    Compression(String),

    /// The build was cancelled through its progress monitor.
    Cancelled,

    /// Logic error inside the crate (lock poisoning, broken invariant).
    ///
    /// This should not occur in production; it indicates a bug.
    Internal(String),
}

impl HprofError {
    /// Returns true if this error is the cancellation signal rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub(crate) fn eof(what: impl Into<String>) -> Self {
        Self::UnexpectedEof(what.into())
    }

    pub(crate) fn format(what: impl Into<String>) -> Self {
        Self::InvalidFormat(what.into())
    }
}

impl fmt::Display for HprofError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O Error: {e}"),
            Self::UnsupportedVersion(v) => write!(f, "Unsupported Version: {v}"),
            Self::InvalidFormat(s) => write!(f, "Format Error: {s}"),
            Self::UnexpectedEof(s) => write!(f, "Unexpected End Of Data: {s}"),
            Self::CorruptDump(s) => write!(f, "Corrupt Dump: {s}"),
            Self::SizeMismatch {
                address,
                declared,
                decoded,
            } => write!(
                f,
                "Size Mismatch: object 0x{address:x} declares {declared} bytes but its class layout needs {decoded}"
            ),
            Self::Unsupported(s) => write!(f, "Unsupported Operation: {s}"),
            Self::InvalidArgument(s) => write!(f, "Invalid Argument: {s}"),
            Self::Serialization(s) => write!(f, "Serialization Error: {s}"),
            Self::Compression(s) => write!(f, "Compression Error: {s}"),
            Self::Cancelled => write!(f, "Operation Cancelled"),
            Self::Internal(s) => write!(f, "Internal Logic Error: {s}"),
        }
    }
}

impl std::error::Error for HprofError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HprofError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Self::UnexpectedEof(err.to_string());
        }
        Self::Io(Arc::new(err))
    }
}

impl From<bincode::error::EncodeError> for HprofError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for HprofError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Serialization(err.to_string())
    }
}
