#![allow(missing_docs)]

mod common;

use std::path::Path;

use common::{HprofWriter, sample_dump};
use hprof_index::handler::align_up;
use hprof_index::format::IndexKind;
use hprof_index::hprof::model::NO_POSITION;
use hprof_index::index::index_path;
use hprof_index::{
    ArrayContent, BasicType, BuildConfig, DiscardConfig, HeapRecord, HprofError, HprofIndex,
    IndexSet, ObjectBody, Strictness, Value,
};

fn no_index_files(prefix: &Path) -> bool {
    IndexKind::ALL.iter().all(|&kind| {
        let path = index_path(prefix, kind);
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        !path.exists() && !Path::new(&tmp).exists()
    })
}

/// Addresses of every indexed object that has a record in the dump.
fn dumped_addresses(set: &IndexSet) -> hprof_index::Result<Vec<u64>> {
    let mut out = Vec::new();
    for id in 0..set.len() as u32 {
        if set.position_of(id)? != NO_POSITION {
            out.push(set.address_of(id)?);
        }
    }
    Ok(out)
}

fn minimal_dump(instance_class: u64) -> HprofWriter {
    let mut w = HprofWriter::new(4);
    w.class_name(0x1000, "java/lang/Object");
    let mut body = w.body();
    body.class_dump(0x1000, 0, 0, &[], &[])
        .instance(0x2000, instance_class, &[])
        .root_sticky_class(0x1000);
    w.heap_dump(&body);
    w
}

// --- TESTS ---

/// One class, one instance, one sticky root.
#[test]
fn minimal_dump_indexes_class_and_instance() -> hprof_index::Result<()> {
    common::init_logging();
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("a.hprof");
    minimal_dump(0x1000).write_to(&dump)?;
    let prefix = dir.path().join("a");

    let output = HprofIndex::build(&dump, &prefix, &BuildConfig::default())?;
    // Only the well-known classes the dump lacks are reported.
    assert!(
        output
            .warnings
            .iter()
            .all(|w| w.starts_with("synthesized class java.lang.Class")),
        "{:?}",
        output.warnings
    );

    let set = IndexSet::open(&prefix)?;
    assert_eq!(dumped_addresses(&set)?, vec![0x1000, 0x2000]);
    assert_eq!(set.gc_roots().len(), 1);
    let object_class = set.id_of(0x1000).expect("class id");
    assert_eq!(set.gc_roots()[0].0, object_class);

    let instance = set.id_of(0x2000).expect("instance id");
    assert_eq!(set.class_id_of(instance)?, object_class);
    assert_eq!(set.outbound_of(instance)?, vec![object_class]);
    assert_eq!(set.info().id_size, 4);
    assert_eq!(set.info().dump_count, 1);
    Ok(())
}

/// An instance of a class that is never defined is fatal in strict mode.
#[test]
fn undefined_instance_class_is_corrupt_in_strict_mode() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("b.hprof");
    minimal_dump(0x3000).write_to(&dump)?;
    let prefix = dir.path().join("b");

    let err = HprofIndex::build(&dump, &prefix, &BuildConfig::default()).unwrap_err();
    assert!(matches!(err, HprofError::CorruptDump(_)), "{err}");
    assert!(no_index_files(&prefix));
    Ok(())
}

/// Outside strict mode the class is synthesized from the declared instance size.
#[test]
fn undefined_instance_class_is_synthesized_when_permissive() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("b2.hprof");
    let mut w = HprofWriter::new(4);
    w.class_name(0x1000, "java/lang/Object");
    let mut body = w.body();
    body.class_dump(0x1000, 0, 0, &[], &[])
        .instance_raw(0x2000, 0x3000, &[0, 0, 0, 7, 0, 1, 9]);
    w.heap_dump(&body);
    w.write_to(&dump)?;
    let prefix = dir.path().join("b2");
    let config = BuildConfig {
        strictness: Strictness::Permissive,
        ..BuildConfig::default()
    };

    HprofIndex::build(&dump, &prefix, &config)?;
    let reader = HprofIndex::open(&dump, &prefix, &config)?;
    let class = reader.classes().get(0x3000).expect("synthesized class");
    assert!(class.name.starts_with("unknown-class-"));
    let types: Vec<BasicType> = class.fields.iter().map(|f| f.basic_type).collect();
    assert_eq!(types, vec![BasicType::Int, BasicType::Short, BasicType::Byte]);

    let HeapRecord::Object(object) = reader.read_by_address(0x2000)? else {
        panic!("expected an instance");
    };
    assert_eq!(
        object.body,
        ObjectBody::Instance {
            fields: vec![Value::Int(7), Value::Short(1), Value::Byte(9)]
        }
    );
    Ok(())
}

/// Without `java.lang.Object` in the dump, root classes still count their own fields.
#[test]
fn instance_size_counts_fields_of_root_classes() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("noroot.hprof");
    let mut w = HprofWriter::new(8);
    w.class_name(0x1000, "com/example/Root");
    let field = w.intern("count");
    let mut body = w.body();
    body.class_dump(0x1000, 0, 0, &[], &[(field, BasicType::Long)])
        .instance(0x2000, 0x1000, &[Value::Long(3)])
        .instance_raw(0x2010, 0x3000, &[0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]);
    w.heap_dump(&body);
    w.write_to(&dump)?;
    let prefix = dir.path().join("noroot");
    let config = BuildConfig {
        strictness: Strictness::Permissive,
        ..BuildConfig::default()
    };

    HprofIndex::build(&dump, &prefix, &config)?;
    let reader = HprofIndex::open(&dump, &prefix, &config)?;
    let layout = reader.layout();
    let expected = |fields: u64| {
        let size = align_up(layout.instance_header() + fields, layout.reference_size);
        align_up(size, layout.alignment)
    };

    let synthesized = reader.classes().get(0x3000).expect("synthesized class");
    assert_eq!(synthesized.super_address, 0);
    assert_eq!(synthesized.fields.len(), 3);
    assert_eq!(synthesized.instance_size, expected(12));
    assert_eq!(reader.classes().get(0x1000).expect("root").instance_size, expected(8));

    let id = reader.index().id_of(0x2010).expect("instance id");
    assert_eq!(reader.heap_size(id)?, expected(12));
    assert!(reader.heap_size(id)? > layout.instance_header());
    Ok(())
}

/// A large primitive array is returned as a descriptor and read in ranges.
#[test]
fn large_int_array_is_deferred_until_read() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("c.hprof");
    let content: Vec<u8> = (0..100_000i32)
        .flat_map(|i| (i * 3 - 7).to_be_bytes())
        .collect();
    let mut w = HprofWriter::new(8);
    w.class_name(0x1000, "java/lang/Object");
    let mut body = w.body();
    body.class_dump(0x1000, 0, 0, &[], &[])
        .primitive_array(0x10_0000, BasicType::Int, &content)
        .root_unknown(0x10_0000);
    w.heap_dump(&body);
    w.write_to(&dump)?;
    let prefix = dir.path().join("c");
    let config = BuildConfig::default();

    HprofIndex::build(&dump, &prefix, &config)?;
    let reader = HprofIndex::open(&dump, &prefix, &config)?;
    let record = reader.read_by_address(0x10_0000)?;
    let object = record.as_object().expect("array object");
    let ObjectBody::PrimitiveArray {
        element_type,
        length,
        content: ArrayContent::Deferred(descriptor),
    } = &object.body
    else {
        panic!("expected deferred content, got {:?}", object.body);
    };
    assert_eq!(*element_type, BasicType::Int);
    assert_eq!(*length, 100_000);
    assert_eq!(descriptor.byte_len(), 400_000);

    let all = reader.read_primitive_range(descriptor, 0, 100_000)?;
    assert_eq!(all.len(), 400_000);
    assert_eq!(all, content);
    let slice = reader.read_primitive_range(descriptor, 50_000, 10)?;
    assert_eq!(slice, content[200_000..200_040]);
    assert!(reader.read_primitive_range(descriptor, 99_999, 2).is_err());

    let id = reader.index().id_of(0x10_0000).expect("array id");
    let layout = reader.layout();
    assert_eq!(
        reader.heap_size(id)?,
        layout.primitive_array_size(BasicType::Int, 100_000)
    );
    Ok(())
}

/// Sampling is reproducible for a seed and changes with it.
#[test]
fn discard_sampling_is_seeded() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("e.hprof");
    let sample = sample_dump(8, 1000);
    std::fs::write(&dump, &sample.bytes)?;

    let config_for = |seed| BuildConfig {
        discard: Some(DiscardConfig {
            ratio: 0.5,
            pattern: String::from(r"^char\[\]$"),
            seed,
            offset: 0.0,
        }),
        ..BuildConfig::default()
    };

    let first = HprofIndex::build(&dump, dir.path().join("e1"), &config_for(42))?;
    let second = HprofIndex::build(&dump, dir.path().join("e2"), &config_for(42))?;
    let other = HprofIndex::build(&dump, dir.path().join("e3"), &config_for(4242))?;

    let h1 = first.histogram.expect("histogram");
    let h2 = second.histogram.expect("histogram");
    let h3 = other.histogram.expect("histogram");
    assert_eq!(h1, h2);
    assert_eq!(h1.entries.len(), 1);
    assert_eq!(h1.entries[0].class_name, "char[]");
    for histogram in [&h1, &h3] {
        let dropped = histogram.total_count();
        assert!((400..=600).contains(&dropped), "{dropped} of 1000 dropped");
    }

    let kept = |prefix: &str| -> hprof_index::Result<Vec<u64>> {
        let set = IndexSet::open(&dir.path().join(prefix))?;
        Ok(sample
            .char_arrays
            .iter()
            .copied()
            .filter(|&a| set.id_of(a).is_some())
            .collect())
    };
    assert_eq!(kept("e1")?, kept("e2")?);
    assert_ne!(kept("e1")?, kept("e3")?);
    assert_eq!(kept("e1")?.len() as u64, 1000 - h1.total_count());

    // Non-matching classes are never sampled.
    let set = IndexSet::open(&dir.path().join("e1"))?;
    assert!(sample.instances.iter().all(|&a| set.id_of(a).is_some()));
    let stored = IndexSet::open(&dir.path().join("e3"))?;
    assert_eq!(stored.histogram(), Some(&h3));
    Ok(())
}

/// Without sampling no histogram file is written.
#[test]
fn histogram_file_only_with_sampling() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("h.hprof");
    std::fs::write(&dump, sample_dump(8, 3).bytes)?;
    let prefix = dir.path().join("h");

    let output = HprofIndex::build(&dump, &prefix, &BuildConfig::default())?;
    assert!(output.histogram.is_none());
    assert!(!index_path(&prefix, IndexKind::DiscardHistogram).exists());
    assert_eq!(output.files.len(), IndexKind::ALL.len() - 1);
    Ok(())
}

/// Segmented dumps and multiple dumps per file.
#[test]
fn selects_dump_by_number() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("multi.hprof");
    let mut w = HprofWriter::new(4);
    w.class_name(0x1000, "java/lang/Object");

    // Dump 0: two segments.
    let mut first = w.body();
    first.class_dump(0x1000, 0, 0, &[], &[]).instance(0x2000, 0x1000, &[]);
    let mut second = w.body();
    second.instance(0x2010, 0x1000, &[]);
    w.heap_dump_segment(&first).heap_dump_segment(&second).heap_dump_end();

    // Dump 1: a plain heap dump.
    let mut third = w.body();
    third
        .class_dump(0x1000, 0, 0, &[], &[])
        .instance(0x5000, 0x1000, &[]);
    w.heap_dump(&third);
    w.write_to(&dump)?;

    let out0 = HprofIndex::build(&dump, dir.path().join("d0"), &BuildConfig::default())?;
    assert_eq!(out0.info.dump_count, 2);
    let set0 = IndexSet::open(&dir.path().join("d0"))?;
    assert_eq!(dumped_addresses(&set0)?, vec![0x1000, 0x2000, 0x2010]);

    let config = BuildConfig {
        dump_number: 1,
        ..BuildConfig::default()
    };
    HprofIndex::build(&dump, dir.path().join("d1"), &config)?;
    let set1 = IndexSet::open(&dir.path().join("d1"))?;
    assert_eq!(dumped_addresses(&set1)?, vec![0x1000, 0x5000]);
    assert_eq!(set1.info().dump_number, 1);

    let config = BuildConfig {
        dump_number: 2,
        ..BuildConfig::default()
    };
    let err = HprofIndex::build(&dump, dir.path().join("d2"), &config).unwrap_err();
    assert!(matches!(err, HprofError::InvalidArgument(_)), "{err}");
    assert!(no_index_files(&dir.path().join("d2")));
    Ok(())
}
