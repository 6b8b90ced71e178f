//! Pass 1: one forward scan that finds classes, GC roots and object addresses.
//!
//! Object records are not decoded here. Only their address, class and declared size are
//! reported, and their bodies are skipped by length.

use std::collections::HashMap;

use log::{debug, info, trace};

use super::{DumpHeader, RecordHeader, Segment, check_within, read_header, read_record_header};
use crate::config::{BuildConfig, Strictness};
use crate::error::{HprofError, Result};
use crate::handler::Pass1Handler;
use crate::hprof::model::{ClassOrigin, ClassRecord, FieldDescriptor, GcRootRecord, StaticField};
use crate::hprof::{BasicType, GcRootType, RecordTag, SubRecordTag, normalize_class_name};
use crate::io::PositionInput;
use crate::monitor::{ClassNameProvider, ProgressMonitor};

/// Sub-records between two cancellation polls inside a heap dump body.
const POLL_INTERVAL: u64 = 4096;

/// What Pass 1 learned about the file layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pass1Summary {
    /// File header.
    pub header: DumpHeader,
    /// Bodies of the selected heap dump, in file order.
    pub segments: Vec<Segment>,
    /// Heap dumps in the file.
    pub dump_count: usize,
    /// Object records (instances and arrays) in the selected dump.
    pub object_records: u64,
    /// Bytes scanned.
    pub bytes: u64,
}

/// A root whose thread is identified by serial number.
#[derive(Debug, Clone, Copy)]
struct ThreadRoot {
    address: u64,
    root_type: GcRootType,
    thread_serial: u32,
    depth: Option<u32>,
}

/// Scanner state for one file.
pub struct Pass1Scanner<'a> {
    config: &'a BuildConfig,
    monitor: &'a dyn ProgressMonitor,
    names: Option<&'a dyn ClassNameProvider>,
    id_size: u32,
    strings: HashMap<u64, String>,
    class_names: HashMap<u64, String>,
    stack_traces: HashMap<u32, Vec<u64>>,
    threads: HashMap<u32, (u64, u32)>,
    thread_roots: Vec<ThreadRoot>,
    object_records: u64,
}

impl std::fmt::Debug for Pass1Scanner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pass1Scanner")
            .field("id_size", &self.id_size)
            .field("strings", &self.strings.len())
            .field("classes", &self.class_names.len())
            .field("object_records", &self.object_records)
            .finish_non_exhaustive()
    }
}

impl<'a> Pass1Scanner<'a> {
    /// Creates a scanner.
    pub fn new(
        config: &'a BuildConfig,
        monitor: &'a dyn ProgressMonitor,
        names: Option<&'a dyn ClassNameProvider>,
    ) -> Self {
        Self {
            config,
            monitor,
            names,
            id_size: 8,
            strings: HashMap::new(),
            class_names: HashMap::new(),
            stack_traces: HashMap::new(),
            threads: HashMap::new(),
            thread_roots: Vec::new(),
            object_records: 0,
        }
    }

    /// Scans the whole dump from position 0.
    ///
    /// `source_len` is the exact uncompressed length when known; length repairs are only
    /// attempted with it. `estimated_len` drives progress reporting.
    pub fn scan<I: PositionInput>(
        mut self,
        input: &mut I,
        source_len: Option<u64>,
        estimated_len: u64,
        handler: &mut Pass1Handler,
    ) -> Result<Pass1Summary> {
        self.monitor.begin("Scanning heap dump", estimated_len);
        let header = read_header(input)?;
        self.id_size = header.id_size;
        handler.set_header(header.version, header.id_size, header.timestamp);
        info!(
            "{} dump, {}-byte identifiers",
            header.version.label(),
            header.id_size
        );

        let wanted = self.config.dump_number;
        let mut segments = Vec::new();
        let mut dump_count = 0usize;
        // Dump number of the open run of segments, if any.
        let mut segment_run: Option<usize> = None;
        let mut last_progress = input.position();

        while let Some(mut record) = read_record_header(input)? {
            if self.monitor.is_cancelled() {
                return Err(HprofError::Cancelled);
            }
            if record.is_heap_dump() {
                self.repair_length(&mut record, source_len, handler);
            }
            trace!(
                "record 0x{:02x} at {} ({} bytes)",
                record.raw_tag, record.position, record.length
            );

            match record.tag {
                Some(RecordTag::StringInUtf8) => self.read_string(input, &record)?,
                Some(RecordTag::LoadClass) => self.read_load_class(input, handler)?,
                Some(RecordTag::StackTrace) => self.read_stack_trace(input)?,
                Some(RecordTag::HeapDump) => {
                    segment_run = None;
                    let number = dump_count;
                    dump_count += 1;
                    if number == wanted {
                        segments.push(self.scan_heap_dump(input, &record, handler)?);
                    }
                }
                Some(RecordTag::HeapDumpSegment) => {
                    let number = *segment_run.get_or_insert_with(|| {
                        dump_count += 1;
                        dump_count - 1
                    });
                    if number == wanted {
                        segments.push(self.scan_heap_dump(input, &record, handler)?);
                    }
                }
                Some(RecordTag::HeapDumpEnd) => segment_run = None,
                _ => {}
            }
            let pos = input.position();
            if pos > record.end() {
                return Err(HprofError::format(format!(
                    "record at {} overruns its declared length",
                    record.position
                )));
            }
            input.skip_fully(record.end() - pos)?;

            let pos = input.position();
            self.monitor.advance(pos - last_progress);
            last_progress = pos;
        }

        if wanted >= dump_count {
            return Err(HprofError::InvalidArgument(format!(
                "dump number {wanted} requested, but the file holds {dump_count} heap dumps"
            )));
        }
        handler.set_dump_count(dump_count);
        self.resolve_thread_roots(handler);
        self.monitor.done();

        let bytes = input.position();
        info!(
            "pass 1: {} classes, {} object records in {} segments, {bytes} bytes",
            self.class_names.len(),
            self.object_records,
            segments.len()
        );
        Ok(Pass1Summary {
            header,
            segments,
            dump_count,
            object_records: self.object_records,
            bytes,
        })
    }

    fn repair_length(
        &self,
        record: &mut RecordHeader,
        source_len: Option<u64>,
        handler: &mut Pass1Handler,
    ) {
        if !self.config.strictness.allows_repairs() {
            return;
        }
        let Some(len) = source_len else {
            return;
        };
        let left = len.saturating_sub(record.body_start);
        if record.length == 0 && left > 0 {
            handler.warn(format!(
                "heap dump record at {} declares length 0; reading to end of file",
                record.position
            ));
            record.length = left;
        } else if left > record.length && (left - record.length) % (1u64 << 32) == 0 {
            handler.warn(format!(
                "heap dump record at {} has an overflowed length; reading to end of file",
                record.position
            ));
            record.length = left;
        }
    }

    fn read_string<I: PositionInput>(
        &mut self,
        input: &mut I,
        record: &RecordHeader,
    ) -> Result<()> {
        let id = input.read_id(self.id_size)?;
        let len = record
            .length
            .checked_sub(u64::from(self.id_size))
            .ok_or_else(|| {
                HprofError::format(format!("string record at {} is too short", record.position))
            })?;
        let bytes = input.read_vec(len as usize)?;
        self.strings
            .insert(id, String::from_utf8_lossy(&bytes).into_owned());
        Ok(())
    }

    fn placeholder_name(&self, address: u64) -> Option<String> {
        self.names.and_then(|p| p.class_name(address))
    }

    fn read_load_class<I: PositionInput>(
        &mut self,
        input: &mut I,
        handler: &mut Pass1Handler,
    ) -> Result<()> {
        let _serial = input.read_u32()?;
        let address = input.read_id(self.id_size)?;
        let _stack_serial = input.read_u32()?;
        let name_id = input.read_id(self.id_size)?;
        let name = match self.strings.get(&name_id) {
            Some(raw) => normalize_class_name(raw),
            None => match self.placeholder_name(address) {
                Some(name) => name,
                None => {
                    let name = format!("unknown-name@0x{address:x}");
                    handler.warn(format!(
                        "class 0x{address:x} names missing string 0x{name_id:x}; using {name}"
                    ));
                    name
                }
            },
        };
        handler.add_class_name(address, name.clone());
        self.class_names.insert(address, name);
        Ok(())
    }

    fn read_stack_trace<I: PositionInput>(&mut self, input: &mut I) -> Result<()> {
        let serial = input.read_u32()?;
        let _thread_serial = input.read_u32()?;
        let count = input.read_u32()?;
        let mut frames = Vec::with_capacity(count.min(1 << 16) as usize);
        for _ in 0..count {
            frames.push(input.read_id(self.id_size)?);
        }
        self.stack_traces.insert(serial, frames);
        Ok(())
    }

    fn scan_heap_dump<I: PositionInput>(
        &mut self,
        input: &mut I,
        record: &RecordHeader,
        handler: &mut Pass1Handler,
    ) -> Result<Segment> {
        let segment = Segment {
            start: record.body_start,
            end: record.end(),
        };
        let id = u64::from(self.id_size);
        let mut count = 0u64;
        while input.position() < segment.end {
            count += 1;
            if count % POLL_INTERVAL == 0 && self.monitor.is_cancelled() {
                return Err(HprofError::Cancelled);
            }
            let position = input.position();
            let tag = SubRecordTag::decode(input.read_u8()?, position)?;
            match tag {
                SubRecordTag::ClassDump => {
                    let class = self.read_class_dump(input, position, handler)?;
                    handler.add_class(class);
                }
                SubRecordTag::InstanceDump => {
                    let address = input.read_id(self.id_size)?;
                    let _stack_serial = input.read_u32()?;
                    let class_address = input.read_id(self.id_size)?;
                    let len = input.read_u32()?;
                    input.skip_fully(u64::from(len))?;
                    handler.report_instance(address, class_address, len);
                    self.object_records += 1;
                }
                SubRecordTag::ObjectArrayDump => {
                    let address = input.read_id(self.id_size)?;
                    let _stack_serial = input.read_u32()?;
                    let length = input.read_u32()?;
                    let class_address = input.read_id(self.id_size)?;
                    input.skip_fully(u64::from(length) * id)?;
                    handler.report_object_array(address, class_address, length);
                    self.object_records += 1;
                }
                SubRecordTag::PrimitiveArrayDump => {
                    let address = input.read_id(self.id_size)?;
                    let _stack_serial = input.read_u32()?;
                    let length = input.read_u32()?;
                    let ty = BasicType::decode(input.read_u8()?)?;
                    input.skip_fully(u64::from(length) * u64::from(ty.size(self.id_size)))?;
                    handler.report_primitive_array(address, ty, length);
                    self.object_records += 1;
                }
                root => self.read_root(input, root, handler)?,
            }
            check_within(input.position(), &segment, "sub-record")?;
        }
        debug!(
            "heap dump body [{}, {}): {count} sub-records",
            segment.start, segment.end
        );
        Ok(segment)
    }

    fn read_root<I: PositionInput>(
        &mut self,
        input: &mut I,
        tag: SubRecordTag,
        handler: &mut Pass1Handler,
    ) -> Result<()> {
        let address = input.read_id(self.id_size)?;
        let Some(root_type) = tag.root_type() else {
            return Err(HprofError::Internal(format!("{tag:?} is not a root")));
        };
        match tag {
            SubRecordTag::RootJniGlobal => {
                let _ref_id = input.read_id(self.id_size)?;
                handler.add_gc_root(GcRootRecord::global(address, root_type));
            }
            SubRecordTag::RootJniLocal | SubRecordTag::RootJavaFrame => {
                let thread_serial = input.read_u32()?;
                let depth = input.read_u32()?;
                self.thread_roots.push(ThreadRoot {
                    address,
                    root_type,
                    thread_serial,
                    depth: (depth != u32::MAX).then_some(depth),
                });
            }
            SubRecordTag::RootNativeStack | SubRecordTag::RootThreadBlock => {
                let thread_serial = input.read_u32()?;
                self.thread_roots.push(ThreadRoot {
                    address,
                    root_type,
                    thread_serial,
                    depth: None,
                });
            }
            SubRecordTag::RootThreadObject => {
                let thread_serial = input.read_u32()?;
                let trace_serial = input.read_u32()?;
                self.threads.insert(thread_serial, (address, trace_serial));
                handler.add_gc_root(GcRootRecord::global(address, root_type));
            }
            _ => handler.add_gc_root(GcRootRecord::global(address, root_type)),
        }
        Ok(())
    }

    /// Attaches buffered thread roots to their threads and frames.
    fn resolve_thread_roots(&mut self, handler: &mut Pass1Handler) {
        let mut unresolved = 0usize;
        for root in std::mem::take(&mut self.thread_roots) {
            let thread = self.threads.get(&root.thread_serial).copied();
            if thread.is_none() {
                unresolved += 1;
            }
            let context = match (root.root_type, thread, root.depth) {
                (GcRootType::JavaLocal, Some((_, trace)), Some(depth)) => self
                    .stack_traces
                    .get(&trace)
                    .and_then(|frames| frames.get(depth as usize).copied()),
                _ => None,
            };
            handler.add_gc_root(GcRootRecord {
                address: root.address,
                root_type: root.root_type,
                referrer: thread.map(|(address, _)| address),
                context,
            });
        }
        if unresolved > 0 {
            debug!("{unresolved} thread roots name unknown thread serials; kept as global roots");
        }
    }

    fn field_name(&self, name_id: u64) -> String {
        if name_id == 0 {
            return String::new();
        }
        self.strings
            .get(&name_id)
            .cloned()
            .unwrap_or_else(|| format!("unknown-name@0x{name_id:x}"))
    }

    fn read_class_dump<I: PositionInput>(
        &mut self,
        input: &mut I,
        position: u64,
        handler: &mut Pass1Handler,
    ) -> Result<ClassRecord> {
        let id_size = self.id_size;
        let address = input.read_id(id_size)?;
        let _stack_serial = input.read_u32()?;
        let super_address = input.read_id(id_size)?;
        let loader_address = input.read_id(id_size)?;
        let _signers = input.read_id(id_size)?;
        let _protection_domain = input.read_id(id_size)?;
        let _reserved1 = input.read_id(id_size)?;
        let _reserved2 = input.read_id(id_size)?;
        let declared_instance_size = input.read_u32()?;

        let constants = input.read_u16()?;
        for _ in 0..constants {
            let _index = input.read_u16()?;
            let _value = input.read_tagged_value(id_size)?;
        }

        let static_count = input.read_u16()?;
        let mut statics = Vec::with_capacity(static_count as usize);
        for _ in 0..static_count {
            let name_id = input.read_id(id_size)?;
            let value = input.read_tagged_value(id_size)?;
            statics.push(StaticField {
                name: self.field_name(name_id),
                value,
            });
        }

        let field_count = input.read_u16()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let name_id = input.read_id(id_size)?;
            let basic_type = BasicType::decode(input.read_u8()?)?;
            fields.push(FieldDescriptor {
                name: self.field_name(name_id),
                basic_type,
            });
        }

        let name = match self.class_names.get(&address) {
            Some(name) => name.clone(),
            None => {
                let name = self
                    .placeholder_name(address)
                    .unwrap_or_else(|| format!("unknown-name@0x{address:x}"));
                let message =
                    format!("class 0x{address:x} has no LOAD_CLASS record; using {name}");
                if self.config.strictness == Strictness::Permissive {
                    debug!("{message}");
                } else {
                    handler.warn(message);
                }
                handler.add_class_name(address, name.clone());
                self.class_names.insert(address, name.clone());
                name
            }
        };

        let mut record = ClassRecord::new(address, name, super_address);
        record.loader_address = loader_address;
        record.statics = statics;
        record.fields = fields;
        record.declared_instance_size = declared_instance_size;
        record.position = position;
        record.origin = ClassOrigin::Dumped;
        Ok(record)
    }
}
