//! The Read-Side Engine.
//!
//! [`HprofReader`] answers single-object reads against a finished index set: it looks up the
//! record position of an object id, seeks the dump cursor there and decodes exactly that one
//! record. Large array content comes back as an [`ArrayDescriptor`] and can be read in
//! ranges later.

use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::config::{BuildConfig, Strictness};
use crate::error::{HprofError, Result};
use crate::gzip::OffsetMappingCache;
use crate::handler::{ClassTable, HeapLayout};
use crate::hprof::SubRecordTag;
use crate::hprof::model::{ArrayDescriptor, ClassRecord, HeapObject, NO_POSITION, ObjectBody};
use crate::index::IndexSet;
use crate::io::{BufferedInput, ByteArrayInput, DumpSource, PositionInput};
use crate::parser::decode::{DecodeContext, decode_object};

/// Result of a random-access read.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapRecord {
    /// The object is a class.
    Class(ClassRecord),
    /// An instance or array.
    Object(HeapObject),
}

impl HeapRecord {
    /// Address of the object.
    pub fn address(&self) -> u64 {
        match self {
            Self::Class(c) => c.address,
            Self::Object(o) => o.address,
        }
    }

    /// The object, if this is not a class.
    pub fn as_object(&self) -> Option<&HeapObject> {
        match self {
            Self::Object(o) => Some(o),
            Self::Class(_) => None,
        }
    }
}

/// Random access to the objects of an indexed dump.
///
/// The dump cursor sits behind a mutex, so a reader can be shared across threads; reads
/// are serialized.
#[derive(Debug)]
pub struct HprofReader {
    input: Mutex<BufferedInput<DumpSource>>,
    index: IndexSet,
    classes: ClassTable,
    layout: HeapLayout,
    lazy_threshold: u64,
    strictness: Strictness,
}

impl HprofReader {
    /// Opens the dump and the index set written for `prefix`.
    pub fn open(dump: &Path, prefix: &Path, config: &BuildConfig) -> Result<Self> {
        Self::open_with_cache(dump, prefix, config, None)
    }

    /// Like [`open`](Self::open), sharing an offset-mapping cache with other handles.
    pub fn open_with_cache(
        dump: &Path,
        prefix: &Path,
        config: &BuildConfig,
        mapping_cache: Option<Arc<OffsetMappingCache>>,
    ) -> Result<Self> {
        let index = IndexSet::open(prefix)?;
        let classes = index.class_table()?;
        let info = index.info();
        let layout = HeapLayout {
            pointer_size: info.id_size,
            reference_size: info.reference_size,
            alignment: info.alignment,
        };
        let source = DumpSource::open(dump, &config.decompression, mapping_cache)?;
        debug!(
            "reader over {} ({:?}), {} objects",
            dump.display(),
            source.kind(),
            info.object_count
        );
        Ok(Self {
            input: Mutex::new(BufferedInput::new(source)),
            index,
            classes,
            layout,
            lazy_threshold: config.lazy_array_threshold as u64,
            strictness: config.strictness,
        })
    }

    /// The opened index set.
    pub fn index(&self) -> &IndexSet {
        &self.index
    }

    /// The class table.
    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    /// Heap layout the index was built with.
    pub fn layout(&self) -> HeapLayout {
        self.layout
    }

    /// Reads the object with the given address.
    pub fn read_by_address(&self, address: u64) -> Result<HeapRecord> {
        let id = self.index.id_of(address).ok_or_else(|| {
            HprofError::InvalidArgument(format!("no object at address 0x{address:x}"))
        })?;
        self.read(id)
    }

    /// Reads object `id`.
    pub fn read(&self, id: u32) -> Result<HeapRecord> {
        let address = self.index.address_of(id)?;
        if let Some(class) = self.classes.get(address) {
            return Ok(HeapRecord::Class(class.clone()));
        }
        let position = self.index.position_of(id)?;
        if position == NO_POSITION {
            return Ok(HeapRecord::Object(self.system_class_loader(address)));
        }

        let ctx = DecodeContext {
            classes: &self.classes,
            layout: self.layout,
            lazy_threshold: self.lazy_threshold,
            strictness: self.strictness,
            collect_references: false,
        };
        let mut input = self.input.lock();
        input.seek(position)?;
        let tag = SubRecordTag::decode(input.read_u8()?, position)?;
        let object = decode_object(&mut *input, tag, position, &ctx, &|_| {})?;
        if object.address != address {
            return Err(HprofError::CorruptDump(format!(
                "record at {position} holds object 0x{:x}, index says 0x{address:x}",
                object.address
            )));
        }
        Ok(HeapRecord::Object(object))
    }

    fn system_class_loader(&self, address: u64) -> HeapObject {
        let class_address = self.classes.class_loader_class();
        HeapObject {
            address,
            position: NO_POSITION,
            class_address,
            used_heap_size: 0,
            references: vec![class_address],
            body: ObjectBody::Instance { fields: Vec::new() },
        }
    }

    /// Heap size of object `id`.
    pub fn heap_size(&self, id: u32) -> Result<u64> {
        let address = self.index.address_of(id)?;
        if let Some(class) = self.classes.get(address) {
            return Ok(class.used_heap_size);
        }
        let array_size = self.index.array_size_of(id)?;
        if array_size > 0 {
            return Ok(array_size);
        }
        let class_id = self.index.class_id_of(id)?;
        let class_address = self.index.address_of(class_id)?;
        Ok(self
            .classes
            .get(class_address)
            .map_or(0, |c| c.instance_size))
    }

    /// Outbound references of object `id`.
    pub fn outbound(&self, id: u32) -> Result<Vec<u32>> {
        self.index.outbound_of(id)
    }

    fn read_range(
        &self,
        descriptor: &ArrayDescriptor,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>> {
        let end = u64::from(offset) + u64::from(length);
        if end > u64::from(descriptor.length) {
            return Err(HprofError::InvalidArgument(format!(
                "range {offset}+{length} exceeds array length {}",
                descriptor.length
            )));
        }
        let element = u64::from(descriptor.element_size);
        let start = descriptor.position + u64::from(offset) * element;
        let len = usize::try_from(u64::from(length) * element).map_err(|_| {
            HprofError::InvalidArgument(format!("range of {length} elements is too large"))
        })?;
        let mut bytes = vec![0u8; len];
        let mut input = self.input.lock();
        input.seek(start)?;
        input.read_fully(&mut bytes)?;
        Ok(bytes)
    }

    /// Reads `length` elements of a deferred primitive array starting at element `offset`.
    ///
    /// The bytes are returned as stored in the dump (big-endian).
    pub fn read_primitive_range(
        &self,
        descriptor: &ArrayDescriptor,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>> {
        self.read_range(descriptor, offset, length)
    }

    /// Reads `length` element addresses of a deferred reference array.
    pub fn read_object_range(
        &self,
        descriptor: &ArrayDescriptor,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u64>> {
        let bytes = self.read_range(descriptor, offset, length)?;
        let position =
            descriptor.position + u64::from(offset) * u64::from(descriptor.element_size);
        let mut input = ByteArrayInput::owned(bytes, position);
        (0..length)
            .map(|_| input.read_id(descriptor.element_size))
            .collect()
    }
}
