#![allow(dead_code)]

//! A small HPROF writer for synthetic dumps.

use std::io::Write;
use std::path::Path;

use hprof_index::{BasicType, Value};

const TAG_STRING: u8 = 0x01;
const TAG_LOAD_CLASS: u8 = 0x02;
const TAG_STACK_TRACE: u8 = 0x05;
const TAG_HEAP_DUMP: u8 = 0x0c;
const TAG_HEAP_DUMP_SEGMENT: u8 = 0x1c;
const TAG_HEAP_DUMP_END: u8 = 0x2c;

/// Routes crate logs to the test output; `RUST_LOG` picks the level.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Top-level record stream.
pub struct HprofWriter {
    id_size: u32,
    out: Vec<u8>,
    next_string: u64,
    next_serial: u32,
}

impl HprofWriter {
    pub fn new(id_size: u32) -> Self {
        Self::with_version(id_size, "JAVA PROFILE 1.0.2")
    }

    pub fn with_version(id_size: u32, version: &str) -> Self {
        let mut out = Vec::new();
        out.extend_from_slice(version.as_bytes());
        out.push(0);
        out.extend_from_slice(&id_size.to_be_bytes());
        out.extend_from_slice(&1_700_000_000_000u64.to_be_bytes());
        Self {
            id_size,
            out,
            next_string: 0x10_0000,
            next_serial: 1,
        }
    }

    pub fn id_size(&self) -> u32 {
        self.id_size
    }

    /// A body writer with the same identifier width.
    pub fn body(&self) -> HeapBody {
        HeapBody::new(self.id_size)
    }

    fn push_id(buf: &mut Vec<u8>, id_size: u32, id: u64) {
        match id_size {
            4 => buf.extend_from_slice(&(id as u32).to_be_bytes()),
            _ => buf.extend_from_slice(&id.to_be_bytes()),
        }
    }

    pub fn record(&mut self, tag: u8, body: &[u8]) -> &mut Self {
        self.record_with_length(tag, body, body.len() as u32)
    }

    /// A record whose header declares `length` instead of the real body size.
    pub fn record_with_length(&mut self, tag: u8, body: &[u8], length: u32) -> &mut Self {
        self.out.push(tag);
        self.out.extend_from_slice(&0u32.to_be_bytes());
        self.out.extend_from_slice(&length.to_be_bytes());
        self.out.extend_from_slice(body);
        self
    }

    pub fn string(&mut self, id: u64, text: &str) -> &mut Self {
        let mut body = Vec::new();
        Self::push_id(&mut body, self.id_size, id);
        body.extend_from_slice(text.as_bytes());
        self.record(TAG_STRING, &body)
    }

    /// Interns `text` under a fresh string id.
    pub fn intern(&mut self, text: &str) -> u64 {
        let id = self.next_string;
        self.next_string += 1;
        self.string(id, text);
        id
    }

    pub fn load_class(&mut self, address: u64, name_id: u64) -> &mut Self {
        let serial = self.next_serial;
        self.next_serial += 1;
        let mut body = Vec::new();
        body.extend_from_slice(&serial.to_be_bytes());
        Self::push_id(&mut body, self.id_size, address);
        body.extend_from_slice(&0u32.to_be_bytes());
        Self::push_id(&mut body, self.id_size, name_id);
        self.record(TAG_LOAD_CLASS, &body)
    }

    /// STRING plus LOAD_CLASS for a class name in JVM form (`java/lang/Object`).
    pub fn class_name(&mut self, address: u64, jvm_name: &str) -> &mut Self {
        let id = self.intern(jvm_name);
        self.load_class(address, id)
    }

    pub fn stack_trace(&mut self, serial: u32, thread_serial: u32, frames: &[u64]) -> &mut Self {
        let mut body = Vec::new();
        body.extend_from_slice(&serial.to_be_bytes());
        body.extend_from_slice(&thread_serial.to_be_bytes());
        body.extend_from_slice(&(frames.len() as u32).to_be_bytes());
        for &frame in frames {
            Self::push_id(&mut body, self.id_size, frame);
        }
        self.record(TAG_STACK_TRACE, &body)
    }

    pub fn heap_dump(&mut self, body: &HeapBody) -> &mut Self {
        self.record(TAG_HEAP_DUMP, &body.bytes)
    }

    pub fn heap_dump_segment(&mut self, body: &HeapBody) -> &mut Self {
        self.record(TAG_HEAP_DUMP_SEGMENT, &body.bytes)
    }

    pub fn heap_dump_end(&mut self) -> &mut Self {
        self.record(TAG_HEAP_DUMP_END, &[])
    }

    /// A heap dump record with a wrong declared length.
    pub fn heap_dump_with_length(&mut self, body: &HeapBody, length: u32) -> &mut Self {
        self.record_with_length(TAG_HEAP_DUMP, &body.bytes, length)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.out
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, &self.out)
    }
}

/// Sub-records of one heap dump body.
pub struct HeapBody {
    id_size: u32,
    bytes: Vec<u8>,
}

impl HeapBody {
    pub fn new(id_size: u32) -> Self {
        Self {
            id_size,
            bytes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    fn id(&mut self, id: u64) {
        HprofWriter::push_id(&mut self.bytes, self.id_size, id);
    }

    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_be_bytes());
    }

    fn u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_be_bytes());
    }

    /// Encodes a value without its type tag.
    pub fn encode(id_size: u32, value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        match *value {
            Value::Object(a) => HprofWriter::push_id(&mut out, id_size, a),
            Value::Boolean(b) => out.push(u8::from(b)),
            Value::Char(c) => out.extend_from_slice(&c.to_be_bytes()),
            Value::Float(f) => out.extend_from_slice(&f.to_bits().to_be_bytes()),
            Value::Double(d) => out.extend_from_slice(&d.to_bits().to_be_bytes()),
            Value::Byte(b) => out.push(b as u8),
            Value::Short(s) => out.extend_from_slice(&s.to_be_bytes()),
            Value::Int(i) => out.extend_from_slice(&i.to_be_bytes()),
            Value::Long(l) => out.extend_from_slice(&l.to_be_bytes()),
        }
        out
    }

    /// CLASS_DUMP with statics `(name id, value)` and fields `(name id, type)`.
    pub fn class_dump(
        &mut self,
        address: u64,
        super_address: u64,
        loader: u64,
        statics: &[(u64, Value)],
        fields: &[(u64, BasicType)],
    ) -> &mut Self {
        let instance_size: u32 = fields.iter().map(|(_, t)| t.size(self.id_size)).sum();
        self.bytes.push(0x20);
        self.id(address);
        self.u32(0);
        self.id(super_address);
        self.id(loader);
        for _ in 0..4 {
            self.id(0);
        }
        self.u32(instance_size);
        self.u16(0);
        self.u16(statics.len() as u16);
        for (name, value) in statics {
            self.id(*name);
            self.bytes.push(value.basic_type() as u8);
            let encoded = Self::encode(self.id_size, value);
            self.bytes.extend_from_slice(&encoded);
        }
        self.u16(fields.len() as u16);
        for (name, ty) in fields {
            self.id(*name);
            self.bytes.push(*ty as u8);
        }
        self
    }

    /// INSTANCE_DUMP with field values, most-derived class first.
    pub fn instance(&mut self, address: u64, class_address: u64, values: &[Value]) -> &mut Self {
        let mut data = Vec::new();
        for value in values {
            data.extend_from_slice(&Self::encode(self.id_size, value));
        }
        self.instance_raw(address, class_address, &data)
    }

    pub fn instance_raw(&mut self, address: u64, class_address: u64, data: &[u8]) -> &mut Self {
        self.bytes.push(0x21);
        self.id(address);
        self.u32(0);
        self.id(class_address);
        self.u32(data.len() as u32);
        self.bytes.extend_from_slice(data);
        self
    }

    pub fn object_array(
        &mut self,
        address: u64,
        class_address: u64,
        elements: &[u64],
    ) -> &mut Self {
        self.bytes.push(0x22);
        self.id(address);
        self.u32(0);
        self.u32(elements.len() as u32);
        self.id(class_address);
        for &e in elements {
            self.id(e);
        }
        self
    }

    /// PRIMITIVE_ARRAY_DUMP from raw big-endian content.
    pub fn primitive_array(&mut self, address: u64, ty: BasicType, content: &[u8]) -> &mut Self {
        let length = content.len() as u32 / ty.size(self.id_size);
        self.bytes.push(0x23);
        self.id(address);
        self.u32(0);
        self.u32(length);
        self.bytes.push(ty as u8);
        self.bytes.extend_from_slice(content);
        self
    }

    pub fn root_unknown(&mut self, address: u64) -> &mut Self {
        self.bytes.push(0xff);
        self.id(address);
        self
    }

    pub fn root_jni_global(&mut self, address: u64, reference: u64) -> &mut Self {
        self.bytes.push(0x01);
        self.id(address);
        self.id(reference);
        self
    }

    pub fn root_java_frame(&mut self, address: u64, thread_serial: u32, depth: u32) -> &mut Self {
        self.bytes.push(0x03);
        self.id(address);
        self.u32(thread_serial);
        self.u32(depth);
        self
    }

    pub fn root_native_stack(&mut self, address: u64, thread_serial: u32) -> &mut Self {
        self.bytes.push(0x04);
        self.id(address);
        self.u32(thread_serial);
        self
    }

    pub fn root_sticky_class(&mut self, address: u64) -> &mut Self {
        self.bytes.push(0x05);
        self.id(address);
        self
    }

    pub fn root_thread_object(
        &mut self,
        address: u64,
        thread_serial: u32,
        trace_serial: u32,
    ) -> &mut Self {
        self.bytes.push(0x08);
        self.id(address);
        self.u32(thread_serial);
        self.u32(trace_serial);
        self
    }
}

/// Deterministic filler bytes.
pub fn pattern(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|i| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            // Runs of repeated bytes keep the data compressible.
            if i % 7 < 3 { (state >> 56) as u8 } else { (i / 64) as u8 }
        })
        .collect()
}

/// Writes `data` as a gzip file made of `members` independent members.
pub fn write_multi_member_gzip(path: &Path, data: &[u8], members: usize) -> std::io::Result<()> {
    let mut out = Vec::new();
    let per = data.len().div_ceil(members.max(1)).max(1);
    for chunk in data.chunks(per) {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(chunk)?;
        out.extend_from_slice(&encoder.finish()?);
    }
    std::fs::write(path, out)
}

/// A dump with `java.lang.Object`, one class with an int and a reference field, and a few
/// instances, arrays and roots. Addresses are multiples of 16.
pub struct SampleDump {
    pub bytes: Vec<u8>,
    pub object_class: u64,
    pub node_class: u64,
    pub object_array_class: u64,
    pub instances: Vec<u64>,
    pub int_array: u64,
    pub char_arrays: Vec<u64>,
    pub object_array: u64,
    pub thread: u64,
}

pub fn sample_dump(id_size: u32, char_array_count: usize) -> SampleDump {
    let object_class = 0x1000;
    let node_class = 0x1010;
    let object_array_class = 0x1020;
    let thread_class = 0x1030;
    let mut w = HprofWriter::new(id_size);
    w.class_name(object_class, "java/lang/Object");
    w.class_name(node_class, "com/example/Node");
    w.class_name(object_array_class, "[Lcom/example/Node;");
    w.class_name(thread_class, "java/lang/Thread");
    let value_name = w.intern("value");
    let next_name = w.intern("next");
    let count_name = w.intern("count");

    let instances: Vec<u64> = (0..8).map(|i| 0x10_0000 + i * 0x20).collect();
    let thread = 0x20_0000;
    let frame = 0x30_0000;
    w.stack_trace(7, 1, &[frame]);

    let mut body = w.body();
    body.class_dump(object_class, 0, 0, &[], &[])
        .class_dump(
            node_class,
            object_class,
            0,
            &[(count_name, Value::Int(8))],
            &[(value_name, BasicType::Int), (next_name, BasicType::Object)],
        )
        .class_dump(object_array_class, object_class, 0, &[], &[])
        .class_dump(thread_class, object_class, 0, &[], &[]);
    for (i, &address) in instances.iter().enumerate() {
        let next = instances.get(i + 1).copied().unwrap_or(0);
        body.instance(address, node_class, &[Value::Int(i as i32 * 10), Value::Object(next)]);
    }
    body.instance(thread, thread_class, &[]);
    let object_array = 0x18_0000;
    body.object_array(object_array, object_array_class, &instances[..4]);
    let int_array = 0x18_1000;
    let ints: Vec<u8> = (0..16i32).flat_map(|i| i.to_be_bytes()).collect();
    body.primitive_array(int_array, BasicType::Int, &ints);
    let char_arrays: Vec<u64> = (0..char_array_count as u64)
        .map(|i| 0x40_0000 + i * 0x30)
        .collect();
    for (i, &address) in char_arrays.iter().enumerate() {
        let chars: Vec<u8> = format!("s{i:05}")
            .encode_utf16()
            .flat_map(|c| c.to_be_bytes())
            .collect();
        body.primitive_array(address, BasicType::Char, &chars);
    }
    body.root_sticky_class(object_class)
        .root_thread_object(thread, 1, 7)
        .root_java_frame(instances[0], 1, 0)
        .root_jni_global(instances[1], 0x99);
    w.heap_dump(&body);

    SampleDump {
        bytes: w.finish(),
        object_class,
        node_class,
        object_array_class,
        instances,
        int_array,
        char_arrays,
        object_array,
        thread,
    }
}
