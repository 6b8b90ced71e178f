//! Class registry built during Pass 1 and the sealed class table shared by Pass 2.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};

use super::concurrent::ConcurrentMap;
use super::identifiers::IdentifierIndex;
use super::layout::{HeapLayout, align_up};
use crate::config::Strictness;
use crate::error::{HprofError, Result};
use crate::hprof::model::{ClassOrigin, ClassRecord, FieldDescriptor};
use crate::hprof::{BasicType, Value};

/// Name of the class of class objects.
pub const JAVA_LANG_CLASS: &str = "java.lang.Class";
/// Name of the class of class loaders.
pub const JAVA_LANG_CLASSLOADER: &str = "java.lang.ClassLoader";
/// Name of the root of the hierarchy.
pub const JAVA_LANG_OBJECT: &str = "java.lang.Object";

/// Class addresses that Pass 1 saw referenced by object records.
#[derive(Debug, Default)]
pub(crate) struct RequiredClasses {
    /// Instance class address to the smallest declared field byte count seen.
    pub instances: HashMap<u64, u32>,
    /// Array class addresses of reference arrays.
    pub object_arrays: HashSet<u64>,
    /// Element types of primitive arrays.
    pub primitive_arrays: BTreeSet<BasicType>,
}

impl RequiredClasses {
    pub fn instance(&mut self, class_address: u64, declared_len: u32) {
        self.instances
            .entry(class_address)
            .and_modify(|size| *size = (*size).min(declared_len))
            .or_insert(declared_len);
    }
}

/// Mutable class collection of Pass 1.
#[derive(Debug, Default)]
pub(crate) struct ClassRegistry {
    classes: HashMap<u64, ClassRecord>,
    by_name: HashMap<String, Vec<u64>>,
    next_unknown: usize,
}

impl ClassRegistry {
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.classes.contains_key(&address)
    }

    pub fn lookup_name(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).and_then(|v| v.first().copied())
    }

    /// Adds a class; a second definition of the same address is ignored.
    pub fn add(&mut self, record: ClassRecord) -> bool {
        if self.classes.contains_key(&record.address) {
            warn!(
                "duplicate class definition for 0x{:x} ({}) ignored",
                record.address, record.name
            );
            return false;
        }
        self.by_name
            .entry(record.name.clone())
            .or_default()
            .push(record.address);
        self.classes.insert(record.address, record);
        true
    }

    fn synthesize(
        &mut self,
        address: u64,
        name: String,
        super_address: u64,
        fields: Vec<FieldDescriptor>,
        warnings: &mut Vec<String>,
    ) {
        let message = format!("synthesized class {name} at 0x{address:x}");
        warn!("{message}");
        warnings.push(message);
        let mut record = ClassRecord::new(address, name, super_address);
        record.fields = fields;
        record.origin = ClassOrigin::Synthesized;
        self.add(record);
    }

    fn unknown_name(&mut self) -> String {
        let name = format!("unknown-class-{}", self.next_unknown);
        self.next_unknown += 1;
        name
    }

    /// Synthesizes every class that is referenced but undefined.
    ///
    /// Returns the addresses of the synthesized classes, which the caller must add to the
    /// identifier index.
    pub fn complete(
        &mut self,
        required: &RequiredClasses,
        objects: &IdentifierIndex,
        strictness: Strictness,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<u64>> {
        let before: HashSet<u64> = self.classes.keys().copied().collect();
        let jlo = self.lookup_name(JAVA_LANG_OBJECT).unwrap_or(0);
        let mut last_fake = 0u64;

        for name in [JAVA_LANG_CLASS, JAVA_LANG_CLASSLOADER] {
            if self.lookup_name(name).is_none() {
                last_fake = objects.next_unused(last_fake, |a| self.classes.contains_key(&a));
                self.synthesize(last_fake, name.to_string(), jlo, Vec::new(), warnings);
            }
        }

        let mut array_classes: Vec<u64> = required.object_arrays.iter().copied().collect();
        array_classes.sort_unstable();
        for address in array_classes {
            if self.contains(address) {
                continue;
            }
            expect_not_object(address, objects)?;
            let name = format!("{}[]", self.unknown_name());
            self.synthesize(address, name, jlo, Vec::new(), warnings);
        }

        for &ty in &required.primitive_arrays {
            let name = ty.array_class_name();
            if self.lookup_name(&name).is_none() {
                last_fake = objects.next_unused(last_fake, |a| self.classes.contains_key(&a));
                self.synthesize(last_fake, name, jlo, Vec::new(), warnings);
            }
        }

        let mut instance_classes: Vec<(u64, u32)> = required
            .instances
            .iter()
            .map(|(&a, &s)| (a, s))
            .collect();
        instance_classes.sort_unstable();
        for (address, size) in instance_classes {
            if self.contains(address) {
                continue;
            }
            expect_not_object(address, objects)?;
            if strictness == Strictness::Strict {
                return Err(HprofError::CorruptDump(format!(
                    "instances reference class 0x{address:x}, which is never defined"
                )));
            }
            let name = self.unknown_name();
            let super_address = if jlo == address { 0 } else { jlo };
            self.synthesize(address, name, super_address, inferred_fields(size), warnings);
        }

        // Synthesized superclasses have `java.lang.Object` (or nothing) as their own super,
        // so one sweep resolves every chain.
        let mut missing: Vec<u64> = self
            .classes
            .values()
            .map(|c| c.super_address)
            .filter(|&s| s != 0 && !self.classes.contains_key(&s))
            .collect::<BTreeSet<u64>>()
            .into_iter()
            .collect();
        missing.sort_unstable();
        for address in missing {
            expect_not_object(address, objects)?;
            let name = self.unknown_name();
            let super_address = if jlo == address { 0 } else { jlo };
            self.synthesize(address, name, super_address, Vec::new(), warnings);
        }

        let mut created: Vec<u64> = self
            .classes
            .keys()
            .copied()
            .filter(|a| !before.contains(a))
            .collect();
        created.sort_unstable();
        Ok(created)
    }

    /// Computes sizes, ids and subclass lists, and seals the table.
    pub fn seal(mut self, layout: HeapLayout, ids: &IdentifierIndex) -> Result<ClassTable> {
        let addresses: Vec<u64> = {
            let mut v: Vec<u64> = self.classes.keys().copied().collect();
            v.sort_unstable();
            v
        };

        let mut instance_sizes = HashMap::with_capacity(addresses.len());
        for &address in &addresses {
            let size = self.instance_size(address, &layout)?;
            instance_sizes.insert(address, size);
        }

        let mut subclasses: HashMap<u64, Vec<u64>> = HashMap::new();
        for &address in &addresses {
            let Some(record) = self.classes.get_mut(&address) else {
                continue;
            };
            record.object_id = ids.reverse(address).ok_or_else(|| {
                HprofError::Internal(format!("class 0x{address:x} has no object id"))
            })?;
            record.instance_size = instance_sizes.get(&address).copied().unwrap_or(0);
            let statics: u64 = record
                .statics
                .iter()
                .map(|s| layout.field_size(s.value.basic_type()))
                .sum();
            record.used_heap_size = align_up(statics, layout.alignment);
            if record.loader_address != 0 && !ids.contains(record.loader_address) {
                debug!(
                    "class {} has unknown loader 0x{:x}; using the system loader",
                    record.name, record.loader_address
                );
                record.loader_address = 0;
            }
            if record.super_address != 0 {
                subclasses
                    .entry(record.super_address)
                    .or_default()
                    .push(address);
            }
        }
        for (parent, mut children) in subclasses {
            children.sort_unstable();
            if let Some(record) = self.classes.get_mut(&parent) {
                record.subclasses = children;
            }
        }

        ClassTable::new(self.classes.into_values().collect(), layout.pointer_size)
    }

    fn instance_size(&self, address: u64, layout: &HeapLayout) -> Result<u64> {
        let Some(class) = self.classes.get(&address) else {
            return Ok(0);
        };
        if class.is_array() {
            return Ok(u64::from(layout.reference_size));
        }
        let chain = walk_chain(&self.classes, address)?;
        let mut size = layout.instance_header();
        for class in chain.iter().rev() {
            let own: u64 = class
                .fields
                .iter()
                .map(|f| layout.field_size(f.basic_type))
                .sum();
            size = align_up(own + size, layout.reference_size);
        }
        Ok(align_up(size, layout.alignment))
    }
}

fn expect_not_object(address: u64, objects: &IdentifierIndex) -> Result<()> {
    if objects.contains(address) {
        return Err(HprofError::CorruptDump(format!(
            "address 0x{address:x} is used as a class but its record is not a CLASS_DUMP"
        )));
    }
    Ok(())
}

/// Field layout guessed from a declared instance byte count.
fn inferred_fields(size: u32) -> Vec<FieldDescriptor> {
    let mut fields = Vec::new();
    let mut push = |basic_type| {
        let name = format!("unknown-field-{}", fields.len());
        fields.push(FieldDescriptor { name, basic_type });
    };
    for _ in 0..size / 4 {
        push(BasicType::Int);
    }
    if size & 2 != 0 {
        push(BasicType::Short);
    }
    if size & 1 != 0 {
        push(BasicType::Byte);
    }
    fields
}

/// Walks from `address` to the root; fails on cycles.
fn walk_chain(classes: &HashMap<u64, ClassRecord>, address: u64) -> Result<Vec<&ClassRecord>> {
    let mut chain = Vec::new();
    let mut current = address;
    while current != 0 {
        let Some(class) = classes.get(&current) else {
            break;
        };
        if chain.len() > classes.len() {
            return Err(HprofError::CorruptDump(format!(
                "class hierarchy of 0x{address:x} contains a cycle"
            )));
        }
        chain.push(class);
        current = class.super_address;
    }
    Ok(chain)
}

/// Field types of a class and all its superclasses, most-derived first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    /// One entry per field in record order.
    pub types: Vec<BasicType>,
    /// Bytes the fields occupy in an INSTANCE_DUMP record.
    pub record_len: u64,
}

/// Immutable class table shared by Pass 2, the index writer and the object reader.
#[derive(Debug)]
pub struct ClassTable {
    classes: HashMap<u64, ClassRecord>,
    by_name: HashMap<String, Vec<u64>>,
    id_size: u32,
    java_lang_class: u64,
    class_loader_class: u64,
    layouts: ConcurrentMap<u64, Arc<InstanceLayout>>,
}

impl ClassTable {
    /// Builds a table from sealed records.
    pub fn new(records: Vec<ClassRecord>, id_size: u32) -> Result<Self> {
        let mut classes = HashMap::with_capacity(records.len());
        let mut by_name: HashMap<String, Vec<u64>> = HashMap::new();
        for record in records {
            by_name
                .entry(record.name.clone())
                .or_default()
                .push(record.address);
            classes.insert(record.address, record);
        }
        for addresses in by_name.values_mut() {
            addresses.sort_unstable();
        }
        let first = |name: &str| {
            by_name
                .get(name)
                .and_then(|v| v.first().copied())
                .ok_or_else(|| HprofError::Internal(format!("class table lacks {name}")))
        };
        let java_lang_class = first(JAVA_LANG_CLASS)?;
        let class_loader_class = first(JAVA_LANG_CLASSLOADER)?;
        Ok(Self {
            classes,
            by_name,
            id_size,
            java_lang_class,
            class_loader_class,
            layouts: ConcurrentMap::new(),
        })
    }

    /// Number of classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Identifier width of the dump the table was built from.
    pub fn id_size(&self) -> u32 {
        self.id_size
    }

    /// Class at `address`.
    pub fn get(&self, address: u64) -> Option<&ClassRecord> {
        self.classes.get(&address)
    }

    /// Whether `address` is a class.
    pub fn contains(&self, address: u64) -> bool {
        self.classes.contains_key(&address)
    }

    /// All classes with the given name (several loaders may define one name).
    pub fn by_name(&self, name: &str) -> impl Iterator<Item = &ClassRecord> + '_ {
        self.by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|a| self.classes.get(a))
    }

    /// `java.lang.Class`.
    pub fn java_lang_class(&self) -> u64 {
        self.java_lang_class
    }

    /// `java.lang.ClassLoader`.
    pub fn class_loader_class(&self) -> u64 {
        self.class_loader_class
    }

    /// Pseudo-class of primitive arrays of `ty`.
    pub fn primitive_array_class(&self, ty: BasicType) -> Option<&ClassRecord> {
        self.by_name(&ty.array_class_name()).next()
    }

    /// Classes in object id order.
    pub fn records(&self) -> Vec<&ClassRecord> {
        let mut records: Vec<&ClassRecord> = self.classes.values().collect();
        records.sort_unstable_by_key(|c| c.object_id);
        records
    }

    /// The class and its superclasses, most-derived first.
    pub fn hierarchy(&self, address: u64) -> Result<Vec<&ClassRecord>> {
        if !self.classes.contains_key(&address) {
            return Err(HprofError::CorruptDump(format!(
                "class 0x{address:x} is not defined"
            )));
        }
        walk_chain(&self.classes, address)
    }

    /// Field layout of instances of `address`, cached per class.
    pub fn instance_layout(&self, address: u64) -> Result<Arc<InstanceLayout>> {
        self.layouts.get_or_insert_with(address, || {
            let chain = self.hierarchy(address)?;
            let types: Vec<BasicType> = chain
                .iter()
                .flat_map(|c| c.fields.iter().map(|f| f.basic_type))
                .collect();
            let record_len = types
                .iter()
                .map(|t| u64::from(t.size(self.id_size)))
                .sum();
            Ok::<_, HprofError>(Arc::new(InstanceLayout { types, record_len }))
        })
    }

    /// Outbound references of a class object: its class, superclass, loader and statics.
    pub fn class_references(&self, class: &ClassRecord) -> Vec<u64> {
        let mut refs = vec![self.java_lang_class];
        if class.super_address != 0 {
            refs.push(class.super_address);
        }
        refs.push(class.loader_address);
        refs.extend(class.statics.iter().filter_map(|s| match s.value {
            Value::Object(a) if a != 0 => Some(a),
            _ => None,
        }));
        refs
    }
}
