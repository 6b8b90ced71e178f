//! Decoding of single object records.

use log::{debug, warn};

use crate::config::Strictness;
use crate::error::{HprofError, Result};
use crate::handler::{ClassTable, HeapLayout};
use crate::hprof::model::{ArrayContent, ArrayDescriptor, HeapObject, ObjectBody};
use crate::hprof::{BasicType, SubRecordTag, Value};
use crate::io::{ByteArrayInput, PositionInput};

/// Everything the decoder needs besides the bytes.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    /// Sealed classes.
    pub classes: &'a ClassTable,
    /// Heap size parameters.
    pub layout: HeapLayout,
    /// Content byte count at and above which arrays are deferred.
    pub lazy_threshold: u64,
    /// Size mismatch policy.
    pub strictness: Strictness,
    /// Whether references of large object arrays must be collected.
    ///
    /// Pass 2 needs them for the outbound index; the object reader does not and leaves large
    /// arrays unread.
    pub collect_references: bool,
}

impl DecodeContext<'_> {
    fn id_size(&self) -> u32 {
        self.layout.pointer_size
    }
}

/// Decodes the object record whose tag byte was read at `position`.
///
/// The input is positioned after the tag. Deferred primitive array content is never
/// consumed, so the cursor is left at the start of the content for such arrays.
/// `on_warning` receives size mismatch reports in [`Strictness::Warning`] mode.
pub fn decode_object<I: PositionInput>(
    input: &mut I,
    tag: SubRecordTag,
    position: u64,
    ctx: &DecodeContext<'_>,
    on_warning: &dyn Fn(String),
) -> Result<HeapObject> {
    match tag {
        SubRecordTag::InstanceDump => decode_instance(input, position, ctx, on_warning),
        SubRecordTag::ObjectArrayDump => decode_object_array(input, position, ctx),
        SubRecordTag::PrimitiveArrayDump => decode_primitive_array(input, position, ctx),
        other => Err(HprofError::format(format!(
            "record at {position} is {other:?}, not an object"
        ))),
    }
}

fn decode_instance<I: PositionInput>(
    input: &mut I,
    position: u64,
    ctx: &DecodeContext<'_>,
    on_warning: &dyn Fn(String),
) -> Result<HeapObject> {
    let id_size = ctx.id_size();
    let address = input.read_id(id_size)?;
    let _stack_serial = input.read_u32()?;
    let class_address = input.read_id(id_size)?;
    let declared = input.read_u32()?;
    let body_pos = input.position();
    let body = input.read_vec(declared as usize)?;

    let class = ctx.classes.get(class_address).ok_or_else(|| {
        HprofError::CorruptDump(format!(
            "instance 0x{address:x} at {position} has undefined class 0x{class_address:x}"
        ))
    })?;
    let layout = ctx.classes.instance_layout(class_address)?;
    if layout.record_len != u64::from(declared) {
        let mismatch = HprofError::SizeMismatch {
            address,
            declared: u64::from(declared),
            decoded: layout.record_len,
        };
        match ctx.strictness {
            Strictness::Strict => return Err(mismatch),
            Strictness::Warning => {
                let message = format!("{mismatch} ({})", class.name);
                warn!("{message}");
                on_warning(message);
            }
            Strictness::Permissive => debug!("{mismatch}"),
        }
    }

    // The declared length is authoritative: fields that do not fit are absent.
    let mut fields_input = ByteArrayInput::new(&body, body_pos);
    let mut fields = Vec::with_capacity(layout.types.len());
    for &ty in &layout.types {
        if (fields_input.remaining() as u64) < u64::from(ty.size(id_size)) {
            break;
        }
        fields.push(fields_input.read_value(ty, id_size)?);
    }

    let mut references = vec![class_address];
    references.extend(fields.iter().filter_map(Value::reference));
    Ok(HeapObject {
        address,
        position,
        class_address,
        used_heap_size: class.instance_size,
        references,
        body: ObjectBody::Instance { fields },
    })
}

fn decode_object_array<I: PositionInput>(
    input: &mut I,
    position: u64,
    ctx: &DecodeContext<'_>,
) -> Result<HeapObject> {
    let id_size = ctx.id_size();
    let address = input.read_id(id_size)?;
    let _stack_serial = input.read_u32()?;
    let length = input.read_u32()?;
    let class_address = input.read_id(id_size)?;
    let descriptor = ArrayDescriptor {
        position: input.position(),
        element_size: id_size,
        length,
    };
    let deferred = descriptor.byte_len() >= ctx.lazy_threshold;

    let mut references = vec![class_address];
    let elements = if deferred && !ctx.collect_references {
        input.skip_fully(descriptor.byte_len())?;
        ArrayContent::Deferred(descriptor)
    } else {
        let mut ids = Vec::with_capacity(length as usize);
        for _ in 0..length {
            ids.push(input.read_id(id_size)?);
        }
        references.extend(ids.iter().copied().filter(|&a| a != 0));
        if deferred {
            ArrayContent::Deferred(descriptor)
        } else {
            ArrayContent::Inline(ids)
        }
    };

    Ok(HeapObject {
        address,
        position,
        class_address,
        used_heap_size: ctx.layout.object_array_size(length),
        references,
        body: ObjectBody::ObjectArray { length, elements },
    })
}

fn decode_primitive_array<I: PositionInput>(
    input: &mut I,
    position: u64,
    ctx: &DecodeContext<'_>,
) -> Result<HeapObject> {
    let id_size = ctx.id_size();
    let address = input.read_id(id_size)?;
    let _stack_serial = input.read_u32()?;
    let length = input.read_u32()?;
    let element_type = BasicType::decode(input.read_u8()?)?;
    if element_type == BasicType::Object {
        return Err(HprofError::format(format!(
            "primitive array 0x{address:x} at {position} has reference elements"
        )));
    }
    let class_address = ctx
        .classes
        .primitive_array_class(element_type)
        .map(|c| c.address)
        .ok_or_else(|| {
            HprofError::Internal(format!(
                "no class for {} arrays",
                element_type.java_name()
            ))
        })?;
    let descriptor = ArrayDescriptor {
        position: input.position(),
        element_size: element_type.size(id_size),
        length,
    };
    let content = if descriptor.byte_len() >= ctx.lazy_threshold {
        ArrayContent::Deferred(descriptor)
    } else {
        ArrayContent::Inline(input.read_vec(descriptor.byte_len() as usize)?)
    };

    Ok(HeapObject {
        address,
        position,
        class_address,
        used_heap_size: ctx.layout.primitive_array_size(element_type, length),
        references: vec![class_address],
        body: ObjectBody::PrimitiveArray {
            element_type,
            length,
            content,
        },
    })
}
