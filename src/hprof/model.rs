//! Heap model records exchanged between the passes, the handler and the readers.

use serde::{Deserialize, Serialize};

use super::{BasicType, GcRootType, Value};

/// Sentinel file position for objects that have no record in the dump
/// (synthesized classes and the system class loader).
pub const NO_POSITION: u64 = u64::MAX;

/// An instance field declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field name, `""` when the name id was 0.
    pub name: String,
    /// Declared type.
    pub basic_type: BasicType,
}

/// A static field and its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticField {
    /// Field name.
    pub name: String,
    /// Value captured in the dump.
    pub value: Value,
}

/// How a class record came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassOrigin {
    /// Decoded from a CLASS_DUMP record.
    Dumped,
    /// Placeholder for a referenced but undefined class.
    Synthesized,
}

/// A class definition, decoded or synthesized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRecord {
    /// Address of the class object.
    pub address: u64,
    /// Normalized Java name.
    pub name: String,
    /// Address of the superclass, 0 for roots of the hierarchy.
    pub super_address: u64,
    /// Address of the defining loader, 0 for the bootstrap loader.
    pub loader_address: u64,
    /// Static fields with their values.
    pub statics: Vec<StaticField>,
    /// Declared instance fields of this class only (not inherited).
    pub fields: Vec<FieldDescriptor>,
    /// Instance size declared by the CLASS_DUMP record.
    pub declared_instance_size: u32,
    /// Computed per-instance heap size including inherited fields, aligned.
    pub instance_size: u64,
    /// Computed heap size of the class object itself (its statics, aligned).
    pub used_heap_size: u64,
    /// Dense id of the class object; set during finalization.
    pub object_id: u32,
    /// Addresses of direct subclasses, sorted.
    pub subclasses: Vec<u64>,
    /// Position of the CLASS_DUMP record, [`NO_POSITION`] for synthesized classes.
    pub position: u64,
    /// Whether the class was dumped or synthesized.
    pub origin: ClassOrigin,
}

impl ClassRecord {
    /// Creates a record with computed attributes left empty.
    pub fn new(address: u64, name: impl Into<String>, super_address: u64) -> Self {
        Self {
            address,
            name: name.into(),
            super_address,
            loader_address: 0,
            statics: Vec::new(),
            fields: Vec::new(),
            declared_instance_size: 0,
            instance_size: 0,
            used_heap_size: 0,
            object_id: 0,
            subclasses: Vec::new(),
            position: NO_POSITION,
            origin: ClassOrigin::Dumped,
        }
    }

    /// Whether this class describes an array type.
    pub fn is_array(&self) -> bool {
        self.name.ends_with("[]")
    }

    /// Bytes occupied by this class's own instance fields in a dump record.
    pub fn field_bytes(&self, id_size: u32) -> u64 {
        self.fields
            .iter()
            .map(|f| u64::from(f.basic_type.size(id_size)))
            .sum()
    }
}

/// A GC root entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GcRootRecord {
    /// Address of the rooted object.
    pub address: u64,
    /// Root kind.
    pub root_type: GcRootType,
    /// Owning thread address for thread-local roots.
    pub referrer: Option<u64>,
    /// Owning stack frame for Java frame roots.
    pub context: Option<u64>,
}

impl GcRootRecord {
    /// A root without thread or frame association.
    pub fn global(address: u64, root_type: GcRootType) -> Self {
        Self {
            address,
            root_type,
            referrer: None,
            context: None,
        }
    }
}

/// A sealed GC root entry keyed by object ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GcRootInfo {
    /// Id of the rooted object.
    pub object_id: u32,
    /// Address of the rooted object.
    pub address: u64,
    /// Root kind.
    pub root_type: GcRootType,
    /// Id of the owning thread, if any.
    pub referrer_id: Option<u32>,
    /// Id of the context object, if it resolved.
    pub context_id: Option<u32>,
}

/// Location of array content that was not materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayDescriptor {
    /// File position of the first element.
    pub position: u64,
    /// Size of one element in bytes.
    pub element_size: u32,
    /// Number of elements.
    pub length: u32,
}

impl ArrayDescriptor {
    /// Total content size in bytes.
    pub fn byte_len(&self) -> u64 {
        u64::from(self.element_size) * u64::from(self.length)
    }
}

/// Array content, either decoded or deferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayContent<T> {
    /// Content decoded eagerly.
    Inline(T),
    /// Content left in the dump; read a range with the object reader.
    Deferred(ArrayDescriptor),
}

impl<T> ArrayContent<T> {
    /// The inline content, if materialized.
    pub fn inline(&self) -> Option<&T> {
        match self {
            Self::Inline(v) => Some(v),
            Self::Deferred(_) => None,
        }
    }

    /// The descriptor, if deferred.
    pub fn descriptor(&self) -> Option<&ArrayDescriptor> {
        match self {
            Self::Inline(_) => None,
            Self::Deferred(d) => Some(d),
        }
    }
}

/// Decoded body of a heap object record.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectBody {
    /// Instance fields, most-derived class first.
    Instance {
        /// One value per field of the resolved hierarchy.
        fields: Vec<Value>,
    },
    /// Reference array.
    ObjectArray {
        /// Element count.
        length: u32,
        /// Element addresses.
        elements: ArrayContent<Vec<u64>>,
    },
    /// Primitive array.
    PrimitiveArray {
        /// Element type.
        element_type: BasicType,
        /// Element count.
        length: u32,
        /// Raw big-endian element bytes.
        content: ArrayContent<Vec<u8>>,
    },
}

/// Transient per-record descriptor produced by Pass 2.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapObject {
    /// Object address.
    pub address: u64,
    /// Position of the sub-record tag in the dump.
    pub position: u64,
    /// Address of the class (array class for arrays).
    pub class_address: u64,
    /// Computed heap size.
    pub used_heap_size: u64,
    /// Outbound reference addresses, class first.
    pub references: Vec<u64>,
    /// Decoded content.
    pub body: ObjectBody,
}

impl HeapObject {
    /// Whether the object is an array.
    pub fn is_array(&self) -> bool {
        !matches!(self.body, ObjectBody::Instance { .. })
    }
}
