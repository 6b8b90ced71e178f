//! The stateful accumulator between the two passes.
//!
//! The handler is a small typestate machine:
//!
//! - [`Pass1Handler`] is fed single-threaded by the Pass 1 scanner with class definitions,
//!   GC roots and the address of every object record.
//! - [`Pass1Handler::finish_pass1`] sorts the addresses into the [`IdentifierIndex`], infers the
//!   object alignment, synthesizes missing classes, computes class sizes and returns a
//!   [`Pass2Handler`].
//! - [`Pass2Handler::add_object`] takes `&self` and may be called from any number of
//!   Pass 2 workers in any order.
//! - [`Pass2Handler::finish`] checks that every object was seen, reconciles GC roots and
//!   seals everything into a [`SealedIndex`].

mod classes;
mod concurrent;
mod discard;
mod identifiers;
mod layout;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::{debug, info, trace, warn};
use parking_lot::Mutex;

pub use classes::{
    ClassTable, InstanceLayout, JAVA_LANG_CLASS, JAVA_LANG_CLASSLOADER, JAVA_LANG_OBJECT,
};
pub use concurrent::ConcurrentMap;
pub use discard::{DiscardEntry, DiscardHistogram, DiscardSampler};
pub use identifiers::IdentifierIndex;
pub use layout::{HeapLayout, MAX_ALIGNMENT, MIN_ALIGNMENT, align_up, infer_alignment};

use classes::{ClassRegistry, RequiredClasses};
use discard::DiscardTally;

use crate::config::{BuildConfig, Strictness};
use crate::error::{HprofError, Result};
use crate::hprof::model::{
    ClassOrigin, ClassRecord, GcRootInfo, GcRootRecord, HeapObject, NO_POSITION,
};
use crate::hprof::{BasicType, GcRootType, Version};
use crate::index::DumpInfo;

const OUTBOUND_SHARDS: usize = 64;
/// Position slot value before Pass 2 stores a record position.
const UNSET: u64 = u64::MAX - 1;

/// GC roots of one thread, keyed by the rooted object address.
type LocalRoots = HashMap<u64, Vec<GcRootRecord>>;

/// Pass 1 accumulator.
#[derive(Debug)]
pub struct Pass1Handler {
    strictness: Strictness,
    reference_size: Option<u32>,
    dump_number: usize,
    version: Version,
    id_size: u32,
    timestamp: u64,
    dump_count: usize,
    addresses: Vec<u64>,
    class_names: HashMap<u64, String>,
    classes: ClassRegistry,
    required: RequiredClasses,
    gc_roots: HashMap<u64, Vec<GcRootRecord>>,
    thread_locals: HashMap<u64, LocalRoots>,
    sampler: Option<DiscardSampler>,
    discarded: u64,
    largest_array_bytes: u64,
    warnings: Vec<String>,
}

impl Pass1Handler {
    /// Creates a handler for a build with `config`.
    pub fn new(config: &BuildConfig) -> Result<Self> {
        let sampler = config
            .discard
            .as_ref()
            .map(DiscardSampler::new)
            .transpose()?;
        Ok(Self {
            strictness: config.strictness,
            reference_size: config.reference_size,
            dump_number: config.dump_number,
            version: Version::JdkProfile102,
            id_size: 8,
            timestamp: 0,
            dump_count: 0,
            addresses: Vec::new(),
            class_names: HashMap::new(),
            classes: ClassRegistry::default(),
            required: RequiredClasses::default(),
            gc_roots: HashMap::new(),
            thread_locals: HashMap::new(),
            sampler,
            discarded: 0,
            largest_array_bytes: 0,
            warnings: Vec::new(),
        })
    }

    /// Records the dump header.
    pub fn set_header(&mut self, version: Version, id_size: u32, timestamp: u64) {
        self.version = version;
        self.id_size = id_size;
        self.timestamp = timestamp;
    }

    /// Records how many heap dumps the file contains.
    pub fn set_dump_count(&mut self, count: usize) {
        self.dump_count = count;
    }

    /// Records a class name from a LOAD_CLASS record.
    pub fn add_class_name(&mut self, address: u64, name: String) {
        self.class_names.insert(address, name);
    }

    /// Name announced for a class address by LOAD_CLASS.
    pub fn class_name(&self, address: u64) -> Option<&str> {
        self.class_names.get(&address).map(String::as_str)
    }

    /// Records a tolerated irregularity.
    pub fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }

    /// Irregularities recorded so far.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Records a decoded CLASS_DUMP.
    pub fn add_class(&mut self, record: ClassRecord) {
        trace!("class 0x{:x} {}", record.address, record.name);
        let address = record.address;
        if self.classes.add(record) {
            self.addresses.push(address);
        }
    }

    /// Records a GC root; roots owned by a thread are buffered until the thread is known.
    pub fn add_gc_root(&mut self, root: GcRootRecord) {
        match root.referrer {
            Some(thread) if thread != 0 => self
                .thread_locals
                .entry(thread)
                .or_default()
                .entry(root.address)
                .or_default()
                .push(root),
            _ => self.gc_roots.entry(root.address).or_default().push(root),
        }
    }

    fn sampled_out(
        &mut self,
        class_address: u64,
        array_type: Option<BasicType>,
        address: u64,
    ) -> bool {
        let Some(sampler) = &self.sampler else {
            return false;
        };
        let dropped = match array_type {
            Some(ty) => sampler.discards(&ty.array_class_name(), address),
            None => self
                .class_names
                .get(&class_address)
                .is_some_and(|name| sampler.discards(name, address)),
        };
        if dropped {
            self.discarded += 1;
        }
        dropped
    }

    fn add_object_address(&mut self, address: u64) {
        // An INSTANCE_DUMP for a class object does not add a second identity.
        if !self.classes.contains(address) {
            self.addresses.push(address);
        }
    }

    /// Records an INSTANCE_DUMP by address.
    pub fn report_instance(&mut self, address: u64, class_address: u64, declared_len: u32) {
        self.required.instance(class_address, declared_len);
        if !self.sampled_out(class_address, None, address) {
            self.add_object_address(address);
        }
    }

    /// Records an OBJECT_ARRAY_DUMP by address.
    pub fn report_object_array(&mut self, address: u64, class_address: u64, length: u32) {
        if !self.classes.contains(class_address) {
            self.required.object_arrays.insert(class_address);
        }
        self.largest_array_bytes = self
            .largest_array_bytes
            .max(u64::from(length) * u64::from(self.id_size));
        if !self.sampled_out(class_address, None, address) {
            self.add_object_address(address);
        }
    }

    /// Records a PRIMITIVE_ARRAY_DUMP by address.
    pub fn report_primitive_array(&mut self, address: u64, element_type: BasicType, length: u32) {
        self.required.primitive_arrays.insert(element_type);
        self.largest_array_bytes = self
            .largest_array_bytes
            .max(u64::from(length) * u64::from(element_type.size(self.id_size)));
        if !self.sampled_out(0, Some(element_type), address) {
            self.add_object_address(address);
        }
    }

    /// Largest array content seen, in bytes.
    pub fn largest_array_bytes(&self) -> u64 {
        self.largest_array_bytes
    }

    /// Object records reported so far, classes included.
    pub fn object_count(&self) -> usize {
        self.addresses.len()
    }

    /// Identifier width announced by the header.
    pub fn id_size(&self) -> u32 {
        self.id_size
    }

    /// Completes Pass 1: assigns ids, infers the layout and seals the class table.
    pub fn finish_pass1(mut self) -> Result<Pass2Handler> {
        // Address 0 stands for the system class loader.
        self.addresses.push(0);
        let preliminary = IdentifierIndex::from_unsorted(std::mem::take(&mut self.addresses));

        let alignment = infer_alignment(preliminary.as_slice());
        let layout = HeapLayout {
            pointer_size: self.id_size,
            reference_size: self.reference_size.unwrap_or(self.id_size),
            alignment,
        };
        info!(
            "{} objects in dump {}, object alignment {alignment}",
            preliminary.len(),
            self.dump_number
        );

        let created = self.classes.complete(
            &self.required,
            &preliminary,
            self.strictness,
            &mut self.warnings,
        )?;
        let identifiers = if created.is_empty() {
            preliminary
        } else {
            let mut all = preliminary.into_vec();
            all.extend(created);
            IdentifierIndex::from_unsorted(all)
        };
        let class_count = self.classes.len();
        let classes = Arc::new(self.classes.seal(layout, &identifiers)?);
        debug!("sealed {class_count} classes");

        let n = identifiers.len();
        let handler = Pass2Handler {
            object_class: (0..n).map(|_| AtomicU32::new(0)).collect(),
            positions: (0..n).map(|_| AtomicU64::new(UNSET)).collect(),
            array_sizes: (0..n).map(|_| AtomicU64::new(0)).collect(),
            outbound: (0..OUTBOUND_SHARDS).map(|_| Mutex::new(Vec::new())).collect(),
            identifiers: Arc::new(identifiers),
            classes,
            layout,
            gc_roots: self.gc_roots,
            thread_locals: self.thread_locals,
            tally: DiscardTally::default(),
            discard_enabled: self.sampler.is_some(),
            warnings: Mutex::new(self.warnings),
            objects: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            dangling: AtomicU64::new(0),
            info: DumpInfo {
                version: self.version,
                id_size: self.id_size,
                timestamp: self.timestamp,
                alignment,
                reference_size: layout.reference_size,
                object_count: n as u64,
                class_count: class_count as u64,
                dump_count: self.dump_count,
                dump_number: self.dump_number,
            },
            discarded_pass1: self.discarded,
        };
        handler.register_classes()?;
        Ok(handler)
    }
}

/// Counters reported by [`Pass2Handler::finish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerStats {
    /// Objects stored.
    pub objects: u64,
    /// Objects left out by sampling.
    pub discarded: u64,
    /// Second records for an already stored object.
    pub duplicates: u64,
    /// References to addresses with no object.
    pub dangling_references: u64,
}

/// Pass 2 accumulator; safe for concurrent, unordered delivery.
#[derive(Debug)]
pub struct Pass2Handler {
    classes: Arc<ClassTable>,
    identifiers: Arc<IdentifierIndex>,
    layout: HeapLayout,
    object_class: Vec<AtomicU32>,
    positions: Vec<AtomicU64>,
    array_sizes: Vec<AtomicU64>,
    outbound: Box<[Mutex<Vec<(u32, Box<[u32]>)>>]>,
    gc_roots: HashMap<u64, Vec<GcRootRecord>>,
    thread_locals: HashMap<u64, LocalRoots>,
    tally: DiscardTally,
    discard_enabled: bool,
    warnings: Mutex<Vec<String>>,
    objects: AtomicU64,
    duplicates: AtomicU64,
    dangling: AtomicU64,
    info: DumpInfo,
    discarded_pass1: u64,
}

impl Pass2Handler {
    /// The sealed class table.
    pub fn classes(&self) -> &Arc<ClassTable> {
        &self.classes
    }

    /// The identifier index.
    pub fn identifiers(&self) -> &Arc<IdentifierIndex> {
        &self.identifiers
    }

    /// Heap layout parameters.
    pub fn layout(&self) -> HeapLayout {
        self.layout
    }

    /// Dump metadata known so far.
    pub fn info(&self) -> &DumpInfo {
        &self.info
    }

    /// Records a tolerated irregularity.
    pub fn warn(&self, message: String) {
        warn!("{message}");
        self.warnings.lock().push(message);
    }

    fn map_references(&self, refs: impl Iterator<Item = u64>) -> Box<[u32]> {
        let mut dangling = 0u64;
        let ids: Box<[u32]> = refs
            .filter_map(|a| {
                let id = self.identifiers.reverse(a);
                if id.is_none() {
                    dangling += 1;
                }
                id
            })
            .collect();
        if dangling > 0 {
            self.dangling.fetch_add(dangling, Ordering::Relaxed);
        }
        ids
    }

    fn log_outbound(&self, id: u32, refs: Box<[u32]>) {
        self.outbound[id as usize % OUTBOUND_SHARDS]
            .lock()
            .push((id, refs));
    }

    /// Stores class objects and the system class loader, which have no Pass 2 record.
    fn register_classes(&self) -> Result<()> {
        let jlc = self
            .classes
            .get(self.classes.java_lang_class())
            .map(|c| c.object_id)
            .ok_or_else(|| HprofError::Internal("java.lang.Class is missing".into()))?;
        for class in self.classes.records() {
            let id = class.object_id as usize;
            self.object_class[id].store(jlc, Ordering::Relaxed);
            self.positions[id].store(class.position, Ordering::Relaxed);
            let refs = self.map_references(self.classes.class_references(class).into_iter());
            self.log_outbound(class.object_id, refs);
        }

        let loader_class = self
            .classes
            .get(self.classes.class_loader_class())
            .ok_or_else(|| HprofError::Internal("java.lang.ClassLoader is missing".into()))?;
        let loader_id = self
            .identifiers
            .reverse(0)
            .ok_or_else(|| HprofError::Internal("system class loader has no id".into()))?;
        self.object_class[loader_id as usize].store(loader_class.object_id, Ordering::Relaxed);
        self.positions[loader_id as usize].store(NO_POSITION, Ordering::Relaxed);
        self.log_outbound(loader_id, Box::new([loader_class.object_id]));
        Ok(())
    }

    /// Stores one decoded object. Objects without an id were sampled out in Pass 1 and are
    /// only counted.
    pub fn add_object(&self, object: &HeapObject) -> Result<()> {
        let Some(id) = self.identifiers.reverse(object.address) else {
            self.tally
                .record(object.class_address, object.used_heap_size);
            return Ok(());
        };
        let class_id = self
            .classes
            .get(object.class_address)
            .map(|c| c.object_id)
            .ok_or_else(|| {
                HprofError::Internal(format!(
                    "object 0x{:x} has unresolved class 0x{:x}",
                    object.address, object.class_address
                ))
            })?;

        let slot = &self.positions[id as usize];
        if slot
            .compare_exchange(UNSET, object.position, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            self.warn(format!(
                "second record for object 0x{:x} at offset {} ignored",
                object.address, object.position
            ));
            return Ok(());
        }
        self.object_class[id as usize].store(class_id, Ordering::Relaxed);
        if object.is_array() {
            self.array_sizes[id as usize].store(object.used_heap_size, Ordering::Relaxed);
        }

        let locals = self
            .thread_locals
            .get(&object.address)
            .into_iter()
            .flat_map(|l| l.keys().copied());
        let refs = self.map_references(object.references.iter().copied().chain(locals));
        self.log_outbound(id, refs);
        self.objects.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn root_infos(&self, address: u64, roots: &[GcRootRecord]) -> Option<(u32, Vec<GcRootInfo>)> {
        let object_id = self.identifiers.reverse(address)?;
        let infos = roots
            .iter()
            .map(|r| GcRootInfo {
                object_id,
                address,
                root_type: r.root_type,
                referrer_id: r.referrer.and_then(|a| self.identifiers.reverse(a)),
                context_id: r.context.and_then(|a| self.identifiers.reverse(a)),
            })
            .collect();
        Some((object_id, infos))
    }

    /// Verifies completeness and seals all indices.
    pub fn finish(mut self) -> Result<SealedIndex> {
        let n = self.identifiers.len();
        let positions: Vec<u64> = std::mem::take(&mut self.positions)
            .into_iter()
            .map(AtomicU64::into_inner)
            .collect();
        if let Some(missing) = positions.iter().position(|&p| p == UNSET) {
            return Err(HprofError::Internal(format!(
                "object id {missing} (0x{:x}) never received a record",
                self.identifiers.get(missing as u32).unwrap_or(0)
            )));
        }

        // Synthesized classes have no dump record to be rooted by.
        for class in self.classes.records() {
            if class.loader_address == 0
                && class.origin == ClassOrigin::Dumped
                && !class.is_array()
                && !self.gc_roots.contains_key(&class.address)
            {
                self.gc_roots.insert(
                    class.address,
                    vec![GcRootRecord::global(class.address, GcRootType::SystemClass)],
                );
            }
        }

        let mut dropped_roots = 0usize;
        let mut gc_roots: Vec<(u32, Vec<GcRootInfo>)> = Vec::with_capacity(self.gc_roots.len());
        for (&address, roots) in &self.gc_roots {
            match self.root_infos(address, roots) {
                Some(entry) => gc_roots.push(entry),
                None => dropped_roots += roots.len(),
            }
        }
        gc_roots.sort_unstable_by_key(|(id, _)| *id);

        let mut thread_locals = Vec::new();
        for (&thread, locals) in &self.thread_locals {
            let Some(thread_id) = self.identifiers.reverse(thread) else {
                dropped_roots += locals.values().map(Vec::len).sum::<usize>();
                continue;
            };
            let mut entries: Vec<(u32, Vec<GcRootInfo>)> = Vec::new();
            for (&address, roots) in locals {
                match self.root_infos(address, roots) {
                    Some(mut entry) => {
                        for info in &mut entry.1 {
                            info.referrer_id = Some(thread_id);
                        }
                        entries.push(entry);
                    }
                    None => dropped_roots += roots.len(),
                }
            }
            if !entries.is_empty() {
                entries.sort_unstable_by_key(|(id, _)| *id);
                thread_locals.push((thread_id, entries));
            }
        }
        thread_locals.sort_unstable_by_key(|(id, _)| *id);
        if dropped_roots > 0 {
            self.warn(format!(
                "{dropped_roots} GC roots reference unknown objects and were dropped"
            ));
        }

        let mut lists: Vec<Option<Box<[u32]>>> = vec![None; n];
        for shard in std::mem::take(&mut self.outbound).into_vec() {
            for (id, refs) in shard.into_inner() {
                let slot = &mut lists[id as usize];
                if slot.is_none() {
                    *slot = Some(refs);
                }
            }
        }
        let mut outbound_offsets = Vec::with_capacity(n + 1);
        let mut outbound = Vec::new();
        outbound_offsets.push(0u64);
        for list in lists {
            if let Some(refs) = list {
                outbound.extend_from_slice(&refs);
            }
            outbound_offsets.push(outbound.len() as u64);
        }

        let classes = Arc::clone(&self.classes);
        let histogram = if self.discard_enabled {
            let tally = std::mem::take(&mut self.tally);
            Some(tally.into_histogram(|address| {
                classes
                    .get(address)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| format!("unknown-name@0x{address:x}"))
            }))
        } else {
            None
        };

        let stats = HandlerStats {
            objects: self.objects.load(Ordering::Relaxed),
            discarded: histogram.as_ref().map_or(0, |h| h.total_count()),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dangling_references: self.dangling.load(Ordering::Relaxed),
        };
        if self.discarded_pass1 != stats.discarded {
            debug!(
                "pass 1 sampled out {} objects, pass 2 tallied {}",
                self.discarded_pass1, stats.discarded
            );
        }
        info!(
            "sealed {n} objects, {} GC roots, {} outbound references",
            gc_roots.len(),
            outbound.len()
        );

        Ok(SealedIndex {
            identifiers: Arc::clone(&self.identifiers),
            object_class: std::mem::take(&mut self.object_class)
                .into_iter()
                .map(AtomicU32::into_inner)
                .collect(),
            positions,
            array_sizes: std::mem::take(&mut self.array_sizes)
                .into_iter()
                .map(AtomicU64::into_inner)
                .collect(),
            outbound_offsets,
            outbound,
            classes,
            gc_roots,
            thread_locals,
            info: self.info.clone(),
            histogram,
            warnings: std::mem::take(&mut *self.warnings.lock()),
            stats,
        })
    }
}

/// Everything a build produced, in memory, ready to be written.
#[derive(Debug)]
pub struct SealedIndex {
    /// Sorted object addresses.
    pub identifiers: Arc<IdentifierIndex>,
    /// Class id per object id.
    pub object_class: Vec<u32>,
    /// Record position per object id.
    pub positions: Vec<u64>,
    /// Heap size per array id, 0 for other objects.
    pub array_sizes: Vec<u64>,
    /// `outbound[outbound_offsets[id]..outbound_offsets[id + 1]]` are the references of `id`.
    pub outbound_offsets: Vec<u64>,
    /// Concatenated outbound references.
    pub outbound: Vec<u32>,
    /// Sealed class table.
    pub classes: Arc<ClassTable>,
    /// Global GC roots by object id.
    pub gc_roots: Vec<(u32, Vec<GcRootInfo>)>,
    /// Thread-local roots by thread id, then object id.
    pub thread_locals: Vec<(u32, Vec<(u32, Vec<GcRootInfo>)>)>,
    /// Dump metadata.
    pub info: DumpInfo,
    /// Sampling totals, when sampling was enabled.
    pub histogram: Option<DiscardHistogram>,
    /// Tolerated irregularities.
    pub warnings: Vec<String>,
    /// Counters.
    pub stats: HandlerStats,
}

impl SealedIndex {
    /// Outbound references of object `id`.
    pub fn outbound_of(&self, id: u32) -> &[u32] {
        let i = id as usize;
        match (self.outbound_offsets.get(i), self.outbound_offsets.get(i + 1)) {
            (Some(&start), Some(&end)) => &self.outbound[start as usize..end as usize],
            _ => &[],
        }
    }
}
