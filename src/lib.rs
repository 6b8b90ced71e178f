//! # hprof-index
//!
//! A two-pass decoder for HPROF heap dumps that builds on-disk indices over every object
//! and then answers random-access reads against the dump, plain or gzip-compressed.
//!
//! ## Overview
//!
//! A heap dump is a flat sequence of records: strings, class loads, stack traces and one or
//! more heap dump bodies holding classes, GC roots, instances and arrays. Finding one object
//! in it means scanning the whole file. This crate scans it twice, once, and writes indices
//! that turn every later lookup into a seek plus the decoding of a single record.
//!
//! ### Key Features
//!
//! *   **Two passes:** Pass 1 is a sequential, single-threaded scan that collects classes,
//!     roots and object addresses. Pass 2 decodes the object records in parallel batches
//!     using Rayon.
//! *   **Compressed dumps:** Gzip dumps are read through a seekable emulation that keeps
//!     several inflater streams open and remembers restart points; chunked gzip files
//!     (`HPROF BLOCKSIZE=`) get true random access.
//! *   **Memory-mapped indices:** Array-shaped indices are raw little-endian words read
//!     straight from a memory map.
//! *   **Lazy arrays:** Large arrays are described, not loaded, and can be read in ranges.
//! *   **Tolerance:** Broken record lengths, size mismatches and missing names are repaired
//!     or reported according to a [`Strictness`] level.
//! *   **Sampling:** Objects of selected classes can be left out of the index, with totals
//!     kept in a histogram.
//!
//! ## Architecture
//!
//! ### The Pipeline
//!
//! ```text
//! dump ──► Pass 1 scan ──► Pass1Handler ──finish_pass1──► Pass2Handler
//!                                                              │
//! dump ──► BatchProducer ──► rayon workers (decode) ───────────┘
//!                                                              │
//!                                    SealedIndex ◄──finish─────┘
//!                                        │
//!                                        ▼
//!                     <prefix>.<kind>.index files (transactional)
//! ```
//!
//! ### Index Files
//!
//! Each index is its own file:
//! ```text
//! [Payload] [Tail Header]
//! ```
//!
//! The tail carries magic bytes, the index kind, compression flags, the entry count and a
//! payload checksum; see [`format`].
//!
//! ## Core Concepts
//!
//! ### Object Ids
//!
//! Every object of the selected dump, including classes and the synthesized system class
//! loader at address 0, gets a dense id: its rank among the sorted addresses. All
//! per-object indices are arrays keyed by that id.
//!
//! ### Handler
//!
//! The [`handler`] module accumulates what the passes find. Its types follow the build:
//! [`Pass1Handler`] takes exclusive updates during the scan, [`Pass2Handler`] takes shared
//! updates from the workers and [`SealedIndex`] is the finished result.
//!
//! ### Reader
//!
//! [`HprofReader`] opens an index set together with its dump and decodes objects on demand.
//!
//! ## Usage Patterns
//!
//! ### Building and Reading
//!
//! ```rust,ignore
//! use hprof_index::{BuildConfig, HprofIndex};
//!
//! let config = BuildConfig::default();
//! let output = HprofIndex::build("app.hprof.gz", "app", &config)?;
//! println!("{} objects", output.info.object_count);
//!
//! let reader = HprofIndex::open("app.hprof.gz", "app", &config)?;
//! let object = reader.read_by_address(0x7f00_1000)?;
//! ```
//!
//! ### Observing a Build
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hprof_index::{IndexBuilder, SimpleMonitor};
//!
//! let monitor = SimpleMonitor::new();
//! let builder = IndexBuilder::new(config)?.with_hook(Arc::new(MyHook));
//! builder.build(dump, prefix, &monitor)?;
//! ```
//!
//! ### Safety and Error Handling
//!
//! * **Encapsulated Unsafe:** `unsafe` is used only to memory-map index files.
//! * **No Panics:** No `unwrap()` or `panic!()` calls in the library (enforced by clippy lints).
//! * **Comprehensive Errors:** All failures correspond to a [`HprofError`] variant.
//! * **No Partial Builds:** A failed or cancelled build leaves no index file behind.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![warn(missing_docs)]

// --- PUBLIC API MODULES ---
pub mod api;
pub mod builder;
pub mod compression;
pub mod config;
pub mod error;
pub mod format;
pub mod gzip;
pub mod handler;
pub mod hprof;
pub mod index;
pub mod inspector;
pub mod io;
pub mod monitor;
pub mod parser;
pub mod reader;

// --- INTERNAL IMPLEMENTATION MODULES (Hidden from Docs) ---
#[doc(hidden)]
pub mod executor;

// --- RE-EXPORTS ---

#[cfg(feature = "lz4_flex")]
pub use compression::Lz4Compressor;
pub use compression::{Compressor, NoCompression};

pub use api::HprofIndex;
pub use builder::{BuildOutput, BuildStats, IndexBuilder};
pub use config::{BuildConfig, DecompressionConfig, DiscardConfig, ParallelConfig, Strictness};
pub use error::{HprofError, Result};
pub use handler::{ClassTable, Pass1Handler, Pass2Handler, SealedIndex};
pub use hprof::model::{ArrayContent, ArrayDescriptor, ClassRecord, HeapObject, ObjectBody};
pub use hprof::{BasicType, GcRootType, Value, Version};
pub use index::{DumpInfo, IndexSet};
pub use inspector::IndexInspector;
pub use monitor::{BuildHook, ClassNameProvider, NullMonitor, ProgressMonitor, SimpleMonitor};
pub use reader::{HeapRecord, HprofReader};
