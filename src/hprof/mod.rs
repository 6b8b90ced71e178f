//! HPROF wire vocabulary: versions, record tags, sub-record tags and basic types.
//!
//! Every tag byte read from a dump is converted into one of the closed enums in this module
//! before it is acted on, so adding support for a new record kind means adding a variant and
//! handling it everywhere the compiler asks for it.

pub mod model;

use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::{HprofError, Result};

/// Upper bound on the version string length, terminator included.
pub const MAX_VERSION_LENGTH: usize = 20;

/// Recognised dump format versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Version {
    /// `JAVA PROFILE 1.0.1`
    JdkProfile101,
    /// `JAVA PROFILE 1.0.2` (heap dump segments allowed)
    JdkProfile102,
}

impl Version {
    /// Maps the NUL-terminated header string to a version.
    pub fn from_label(label: &str) -> Result<Self> {
        match label {
            "JAVA PROFILE 1.0.1" => Ok(Self::JdkProfile101),
            "JAVA PROFILE 1.0.2" => Ok(Self::JdkProfile102),
            other => Err(HprofError::UnsupportedVersion(other.to_string())),
        }
    }

    /// The header string for this version, without terminator.
    pub fn label(&self) -> &'static str {
        match self {
            Self::JdkProfile101 => "JAVA PROFILE 1.0.1",
            Self::JdkProfile102 => "JAVA PROFILE 1.0.2",
        }
    }
}

/// Top-level record tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum RecordTag {
    /// `u8[]` string constant keyed by id.
    StringInUtf8 = 0x01,
    /// Class serial, class address, stack serial, name id.
    LoadClass = 0x02,
    /// Class serial.
    UnloadClass = 0x03,
    /// Stack frame description.
    StackFrame = 0x04,
    /// Stack trace: serial, thread serial, frame ids.
    StackTrace = 0x05,
    /// Allocation sites.
    AllocSites = 0x06,
    /// Heap summary counters.
    HeapSummary = 0x07,
    /// Thread start.
    StartThread = 0x0a,
    /// Thread end.
    EndThread = 0x0b,
    /// A complete heap dump.
    HeapDump = 0x0c,
    /// CPU samples.
    CpuSamples = 0x0d,
    /// Control settings.
    ControlSettings = 0x0e,
    /// One segment of a segmented heap dump.
    HeapDumpSegment = 0x1c,
    /// Terminates a run of heap dump segments.
    HeapDumpEnd = 0x2c,
}

/// Sub-record tags inside a heap dump body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum SubRecordTag {
    /// Root of unknown origin.
    RootUnknown = 0xff,
    /// JNI global reference.
    RootJniGlobal = 0x01,
    /// JNI local reference.
    RootJniLocal = 0x02,
    /// Java stack frame local.
    RootJavaFrame = 0x03,
    /// Native stack reference.
    RootNativeStack = 0x04,
    /// System class.
    RootStickyClass = 0x05,
    /// Reference from a thread block.
    RootThreadBlock = 0x06,
    /// Busy monitor.
    RootMonitorUsed = 0x07,
    /// Thread object.
    RootThreadObject = 0x08,
    /// Class definition.
    ClassDump = 0x20,
    /// Instance with raw field bytes.
    InstanceDump = 0x21,
    /// Array of references.
    ObjectArrayDump = 0x22,
    /// Array of primitive values.
    PrimitiveArrayDump = 0x23,
}

impl SubRecordTag {
    /// Decodes a sub-record tag, failing with `InvalidFormat` on unknown bytes.
    pub fn decode(byte: u8, position: u64) -> Result<Self> {
        Self::try_from(byte).map_err(|_| {
            HprofError::format(format!(
                "unknown heap dump sub-record tag 0x{byte:02x} at offset {position}"
            ))
        })
    }

    /// The GC root kind for root sub-records, `None` for object and class records.
    pub fn root_type(&self) -> Option<GcRootType> {
        match self {
            Self::RootUnknown => Some(GcRootType::Unknown),
            Self::RootJniGlobal => Some(GcRootType::JniGlobal),
            Self::RootJniLocal => Some(GcRootType::JniLocal),
            Self::RootJavaFrame => Some(GcRootType::JavaLocal),
            Self::RootNativeStack => Some(GcRootType::NativeStack),
            Self::RootStickyClass => Some(GcRootType::SystemClass),
            Self::RootThreadBlock => Some(GcRootType::ThreadBlock),
            Self::RootMonitorUsed => Some(GcRootType::BusyMonitor),
            Self::RootThreadObject => Some(GcRootType::Thread),
            Self::ClassDump
            | Self::InstanceDump
            | Self::ObjectArrayDump
            | Self::PrimitiveArrayDump => None,
        }
    }
}

/// Basic value types of fields and array elements.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum BasicType {
    /// Reference (identifier width).
    Object = 2,
    /// `boolean`
    Boolean = 4,
    /// `char`
    Char = 5,
    /// `float`
    Float = 6,
    /// `double`
    Double = 7,
    /// `byte`
    Byte = 8,
    /// `short`
    Short = 9,
    /// `int`
    Int = 10,
    /// `long`
    Long = 11,
}

impl BasicType {
    /// All primitive types, in tag order.
    pub const PRIMITIVES: [BasicType; 8] = [
        Self::Boolean,
        Self::Char,
        Self::Float,
        Self::Double,
        Self::Byte,
        Self::Short,
        Self::Int,
        Self::Long,
    ];

    /// Decodes a type tag, failing with `InvalidFormat` on unknown bytes.
    pub fn decode(byte: u8) -> Result<Self> {
        Self::try_from(byte)
            .map_err(|_| HprofError::format(format!("illegal basic type tag {byte}")))
    }

    /// Encoded size of one value of this type.
    pub fn size(&self, id_size: u32) -> u32 {
        match self {
            Self::Object => id_size,
            Self::Boolean | Self::Byte => 1,
            Self::Char | Self::Short => 2,
            Self::Float | Self::Int => 4,
            Self::Double | Self::Long => 8,
        }
    }

    /// Java name of the type (`"int"`, `"java.lang.Object"` for references).
    pub fn java_name(&self) -> &'static str {
        match self {
            Self::Object => "java.lang.Object",
            Self::Boolean => "boolean",
            Self::Char => "char",
            Self::Float => "float",
            Self::Double => "double",
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
        }
    }

    /// Name of the one-dimensional primitive array class, e.g. `"int[]"`.
    pub fn array_class_name(&self) -> String {
        format!("{}[]", self.java_name())
    }

    /// Maps a JVM descriptor letter (`I`, `J`, `Z`...) to its type.
    pub fn from_descriptor(letter: char) -> Option<Self> {
        match letter {
            'Z' => Some(Self::Boolean),
            'C' => Some(Self::Char),
            'F' => Some(Self::Float),
            'D' => Some(Self::Double),
            'B' => Some(Self::Byte),
            'S' => Some(Self::Short),
            'I' => Some(Self::Int),
            'J' => Some(Self::Long),
            _ => None,
        }
    }
}

/// GC root kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GcRootType {
    /// Root of unknown origin.
    Unknown,
    /// Class loaded by the bootstrap loader.
    SystemClass,
    /// JNI local reference.
    JniLocal,
    /// JNI global reference.
    JniGlobal,
    /// Reference from a thread block.
    ThreadBlock,
    /// Busy monitor.
    BusyMonitor,
    /// Java stack local.
    JavaLocal,
    /// Native stack reference.
    NativeStack,
    /// Thread object.
    Thread,
}

impl GcRootType {
    /// Human readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::SystemClass => "System Class",
            Self::JniLocal => "JNI Local",
            Self::JniGlobal => "JNI Global",
            Self::ThreadBlock => "Thread Block",
            Self::BusyMonitor => "Busy Monitor",
            Self::JavaLocal => "Java Local",
            Self::NativeStack => "Native Stack",
            Self::Thread => "Thread",
        }
    }
}

/// A decoded field, static or array value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Reference; `0` is null.
    Object(u64),
    /// `boolean`
    Boolean(bool),
    /// `char` (UTF-16 code unit)
    Char(u16),
    /// `float`
    Float(f32),
    /// `double`
    Double(f64),
    /// `byte`
    Byte(i8),
    /// `short`
    Short(i16),
    /// `int`
    Int(i32),
    /// `long`
    Long(i64),
}

impl Value {
    /// Returns the referenced address for non-null references.
    pub fn reference(&self) -> Option<u64> {
        match self {
            Self::Object(address) if *address != 0 => Some(*address),
            _ => None,
        }
    }

    /// The basic type of this value.
    pub fn basic_type(&self) -> BasicType {
        match self {
            Self::Object(_) => BasicType::Object,
            Self::Boolean(_) => BasicType::Boolean,
            Self::Char(_) => BasicType::Char,
            Self::Float(_) => BasicType::Float,
            Self::Double(_) => BasicType::Double,
            Self::Byte(_) => BasicType::Byte,
            Self::Short(_) => BasicType::Short,
            Self::Int(_) => BasicType::Int,
            Self::Long(_) => BasicType::Long,
        }
    }
}

/// Converts a JVM class name as found in LOAD_CLASS records into its Java form.
///
/// `java/lang/String` becomes `java.lang.String`, `[Ljava/lang/Object;` becomes
/// `java.lang.Object[]`, `[[I` becomes `int[][]`. Names that are not well-formed
/// descriptors are returned with only the separator replaced.
pub fn normalize_class_name(raw: &str) -> String {
    let dotted = raw.replace('/', ".");
    let dims = dotted.chars().take_while(|c| *c == '[').count();
    if dims == 0 {
        return dotted;
    }

    let element = &dotted[dims..];
    let base = if let Some(stripped) = element.strip_prefix('L')
        && let Some(name) = stripped.strip_suffix(';')
    {
        name.to_string()
    } else {
        let mut letters = element.chars();
        match (letters.next().and_then(BasicType::from_descriptor), letters.next()) {
            (Some(ty), None) => ty.java_name().to_string(),
            _ => return dotted,
        }
    };

    let mut name = base;
    for _ in 0..dims {
        name.push_str("[]");
    }
    name
}

