#![allow(missing_docs)]

mod common;

use std::io::Write;
use std::sync::Arc;

use common::HprofWriter;
use hprof_index::handler::{HeapLayout, align_up, infer_alignment};
use hprof_index::hprof::normalize_class_name;
use hprof_index::io::{BufferedInput, ByteArrayInput, PositionInput};
use hprof_index::parser::read_header;
use hprof_index::{
    BasicType, BuildConfig, ClassNameProvider, DiscardConfig, HprofError, HprofIndex,
    IndexBuilder, IndexSet, NullMonitor, ObjectBody, Strictness, Value, Version,
};

fn header_bytes(label: &[u8], id_size: u32) -> Vec<u8> {
    let mut bytes = label.to_vec();
    bytes.push(0);
    bytes.extend_from_slice(&id_size.to_be_bytes());
    bytes.extend_from_slice(&1_700_000_000_000u64.to_be_bytes());
    bytes
}

fn object_class_only(w: &mut HprofWriter) -> common::HeapBody {
    w.class_name(0x1000, "java/lang/Object");
    let mut body = w.body();
    body.class_dump(0x1000, 0, 0, &[], &[]);
    body
}

// --- TESTS ---

/// The version string, identifier width and timestamp are read in order.
#[test]
fn header_is_probed() -> hprof_index::Result<()> {
    let bytes = header_bytes(b"JAVA PROFILE 1.0.2", 8);
    let header = read_header(&mut ByteArrayInput::new(&bytes, 0))?;
    assert_eq!(header.version, Version::JdkProfile102);
    assert_eq!(header.id_size, 8);
    assert_eq!(header.timestamp, 1_700_000_000_000);
    assert_eq!(header.body_start, bytes.len() as u64);

    let old = header_bytes(b"JAVA PROFILE 1.0.1", 4);
    assert_eq!(
        read_header(&mut ByteArrayInput::new(&old, 0))?.version,
        Version::JdkProfile101
    );

    let unknown = header_bytes(b"JAVA PROFILE 1.0", 4);
    let err = read_header(&mut ByteArrayInput::new(&unknown, 0)).unwrap_err();
    assert!(matches!(err, HprofError::UnsupportedVersion(_)), "{err}");

    let garbage = vec![b'x'; 64];
    let err = read_header(&mut ByteArrayInput::new(&garbage, 0)).unwrap_err();
    assert!(matches!(err, HprofError::InvalidFormat(_)), "{err}");

    let odd = header_bytes(b"JAVA PROFILE 1.0.2", 3);
    assert!(read_header(&mut ByteArrayInput::new(&odd, 0)).is_err());

    let cut = &bytes[..bytes.len() - 3];
    let err = read_header(&mut ByteArrayInput::new(cut, 0)).unwrap_err();
    assert!(matches!(err, HprofError::UnexpectedEof(_)), "{err}");
    Ok(())
}

/// JVM names become Java names.
#[test]
fn class_names_are_normalized() {
    let cases = [
        ("java/lang/String", "java.lang.String"),
        ("[Ljava/lang/Object;", "java.lang.Object[]"),
        ("[[I", "int[][]"),
        ("[C", "char[]"),
        ("[[[Lcom/example/Node;", "com.example.Node[][][]"),
        ("[Q", "[Q"),
        ("Plain", "Plain"),
    ];
    for (raw, expected) in cases {
        assert_eq!(normalize_class_name(raw), expected, "{raw}");
    }
}

/// Typed big-endian reads and explicit positions.
#[test]
fn cursors_read_and_seek() -> hprof_index::Result<()> {
    let mut data = Vec::new();
    data.extend_from_slice(&0x0102_0304u32.to_be_bytes());
    data.extend_from_slice(&(-2i16).to_be_bytes());
    data.extend_from_slice(&0x1122_3344_5566_7788u64.to_be_bytes());
    data.push(BasicType::Int as u8);
    data.extend_from_slice(&(-7i32).to_be_bytes());
    data.extend_from_slice(&1.5f64.to_be_bytes());

    let mut memory = ByteArrayInput::new(&data, 100);
    assert_eq!(memory.position(), 100);
    assert_eq!(memory.read_u32()?, 0x0102_0304);
    assert_eq!(memory.read_i16()?, -2);
    assert_eq!(memory.read_id(8)?, 0x1122_3344_5566_7788);
    assert_eq!(memory.read_tagged_value(8)?, Value::Int(-7));
    assert_eq!(memory.read_f64()?, 1.5);
    assert_eq!(memory.remaining(), 0);
    assert_eq!(memory.try_read_u8()?, None);
    assert!(matches!(memory.read_u8(), Err(HprofError::UnexpectedEof(_))));
    memory.seek(104)?;
    assert_eq!(memory.read_i16()?, -2);
    assert!(memory.seek(99).is_err());
    memory.seek(106)?;
    assert_eq!(memory.read_id(4)?, 0x1122_3344);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("bytes.bin");
    let big: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_be_bytes()).collect();
    std::fs::File::create(&path)?.write_all(&big)?;
    let mut buffered = BufferedInput::with_read_length(std::fs::File::open(&path)?, 64);
    assert_eq!(buffered.read_u32()?, 0);
    assert_eq!(buffered.read_u32()?, 1);
    buffered.seek(4 * 9_000)?;
    assert_eq!(buffered.read_u32()?, 9_000);
    buffered.seek(4 * 9_001)?;
    assert_eq!(buffered.read_u32()?, 9_001);
    buffered.skip_fully(4 * 500)?;
    assert_eq!(buffered.position(), 4 * 9_502);
    assert_eq!(buffered.read_u32()?, 9_502);
    buffered.seek(8)?;
    let mut chunk = vec![0u8; 400];
    buffered.read_fully(&mut chunk)?;
    assert_eq!(chunk, big[8..408]);
    buffered.seek(big.len() as u64 - 2)?;
    assert!(buffered.read_u32().is_err());
    Ok(())
}

/// Configuration errors surface before any work is done.
#[test]
fn config_is_validated() {
    let bad = [
        BuildConfig {
            lazy_array_threshold: 0,
            ..BuildConfig::default()
        },
        BuildConfig {
            reference_size: Some(6),
            ..BuildConfig::default()
        },
        BuildConfig {
            parallel: hprof_index::ParallelConfig {
                batch_records: 0,
                ..Default::default()
            },
            ..BuildConfig::default()
        },
        BuildConfig {
            discard: Some(DiscardConfig {
                ratio: 1.5,
                ..DiscardConfig::default()
            }),
            ..BuildConfig::default()
        },
        BuildConfig {
            discard: Some(DiscardConfig {
                offset: 1.0,
                ..DiscardConfig::default()
            }),
            ..BuildConfig::default()
        },
        BuildConfig {
            discard: Some(DiscardConfig {
                pattern: String::from("(unclosed"),
                ..DiscardConfig::default()
            }),
            ..BuildConfig::default()
        },
    ];
    for config in bad {
        let err = IndexBuilder::new(config.clone()).unwrap_err();
        assert!(matches!(err, HprofError::InvalidArgument(_)), "{config:?}");
    }
    assert!(BuildConfig::default().validate().is_ok());
}

/// Alignment is the common divisor of address gaps, within bounds.
#[test]
fn alignment_and_sizes() {
    assert_eq!(infer_alignment(&[0, 0x1000, 0x1010, 0x1030]), 16);
    assert_eq!(infer_alignment(&[0x1000, 0x1008]), 8);
    assert_eq!(infer_alignment(&[0x1000, 0x1004]), 8);
    assert_eq!(infer_alignment(&[0x1000, 0x2000, 0x3000]), 256);
    assert_eq!(infer_alignment(&[0x1000]), 8);
    assert_eq!(align_up(13, 8), 16);
    assert_eq!(align_up(16, 8), 16);
    assert_eq!(align_up(0, 8), 0);

    let layout = HeapLayout {
        pointer_size: 8,
        reference_size: 4,
        alignment: 8,
    };
    assert_eq!(layout.instance_header(), 12);
    assert_eq!(layout.object_array_size(3), 32);
    assert_eq!(layout.primitive_array_size(BasicType::Long, 1), 24);
    assert_eq!(layout.primitive_array_size(BasicType::Byte, 0), 16);
    assert_eq!(layout.field_size(BasicType::Object), 4);
}

/// A heap dump declaring length 0 is read to the end of the file outside strict mode.
#[test]
fn zero_length_heap_dump_is_repaired() -> hprof_index::Result<()> {
    common::init_logging();
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("zero.hprof");
    let mut w = HprofWriter::new(4);
    let mut body = object_class_only(&mut w);
    body.instance(0x2000, 0x1000, &[]);
    w.heap_dump_with_length(&body, 0);
    w.write_to(&dump)?;

    let config = BuildConfig {
        strictness: Strictness::Warning,
        ..BuildConfig::default()
    };
    let output = HprofIndex::build(&dump, dir.path().join("w"), &config)?;
    assert!(
        output.warnings.iter().any(|w| w.contains("declares length 0")),
        "{:?}",
        output.warnings
    );
    let set = IndexSet::open(&dir.path().join("w"))?;
    assert!(set.id_of(0x2000).is_some());

    assert!(HprofIndex::build(&dump, dir.path().join("s"), &BuildConfig::default()).is_err());
    Ok(())
}

/// Undefined superclasses are synthesized below `java.lang.Object`.
#[test]
fn missing_superclass_is_synthesized() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("super.hprof");
    let mut w = HprofWriter::new(8);
    w.class_name(0x1010, "com/example/Child");
    let mut body = object_class_only(&mut w);
    body.class_dump(0x1010, 0x1008, 0, &[], &[])
        .instance(0x2000, 0x1010, &[]);
    w.heap_dump(&body);
    w.write_to(&dump)?;

    let prefix = dir.path().join("p");
    let output = HprofIndex::build(&dump, &prefix, &BuildConfig::default())?;
    assert!(
        output
            .warnings
            .iter()
            .any(|w| w.starts_with("synthesized class unknown-class-") && w.ends_with("0x1008"))
    );
    let reader = HprofIndex::open(&dump, &prefix, &BuildConfig::default())?;
    let parent = reader.classes().get(0x1008).expect("synthesized superclass");
    assert_eq!(parent.super_address, 0x1000);
    assert_eq!(reader.classes().get(0x1010).expect("child").name, "com.example.Child");
    Ok(())
}

/// A class without LOAD_CLASS gets a placeholder name, or one from a provider.
#[test]
fn missing_class_names() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("names.hprof");
    let mut w = HprofWriter::new(8);
    let mut body = object_class_only(&mut w);
    body.class_dump(0x1010, 0x1000, 0, &[], &[])
        .instance(0x2000, 0x1010, &[]);
    w.heap_dump(&body);
    w.write_to(&dump)?;

    let prefix = dir.path().join("n");
    let output = HprofIndex::build(&dump, &prefix, &BuildConfig::default())?;
    assert!(
        output
            .warnings
            .iter()
            .any(|w| w.contains("has no LOAD_CLASS record")),
        "{:?}",
        output.warnings
    );
    let set = IndexSet::open(&prefix)?;
    let classes = set.class_table()?;
    assert_eq!(classes.get(0x1010).expect("class").name, "unknown-name@0x1010");

    let provider = |address: u64| (address == 0x1010).then(|| String::from("com.example.Named"));
    let prefix = dir.path().join("m");
    IndexBuilder::new(BuildConfig::default())?
        .with_name_provider(Arc::new(provider) as Arc<dyn ClassNameProvider>)
        .build(&dump, &prefix, &NullMonitor)?;
    let set = IndexSet::open(&prefix)?;
    assert_eq!(
        set.class_table()?.get(0x1010).expect("class").name,
        "com.example.Named"
    );
    assert_eq!(set.class_table()?.by_name("com.example.Named").count(), 1);
    Ok(())
}

/// Instances longer or shorter than their class layout: fatal in strict mode, otherwise the
/// declared length wins and the following record still decodes.
#[test]
fn instance_size_mismatch_follows_strictness() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("mismatch.hprof");
    let mut w = HprofWriter::new(8);
    w.class_name(0x1010, "com/example/Box");
    let field = w.intern("value");
    let mut body = object_class_only(&mut w);
    body.class_dump(0x1010, 0x1000, 0, &[], &[(field, BasicType::Int)])
        .instance_raw(0x2000, 0x1010, &[0, 0, 0, 9, 1, 2, 3])
        .instance_raw(0x2010, 0x1010, &[0, 1])
        .instance(0x2020, 0x1010, &[Value::Int(5)]);
    w.heap_dump(&body);
    w.write_to(&dump)?;

    let err = HprofIndex::build(&dump, dir.path().join("strict"), &BuildConfig::default())
        .unwrap_err();
    assert!(
        matches!(
            err,
            HprofError::SizeMismatch {
                address: 0x2000,
                declared: 7,
                decoded: 4
            }
        ),
        "{err}"
    );

    for (strictness, prefix, reported) in [
        (Strictness::Warning, "warn", 2),
        (Strictness::Permissive, "quiet", 0),
    ] {
        let config = BuildConfig {
            strictness,
            ..BuildConfig::default()
        };
        let output = HprofIndex::build(&dump, dir.path().join(prefix), &config)?;
        let mismatches = output
            .warnings
            .iter()
            .filter(|w| w.starts_with("Size Mismatch"))
            .count();
        assert_eq!(mismatches, reported, "{strictness:?}: {:?}", output.warnings);

        let reader = HprofIndex::open(&dump, dir.path().join(prefix), &config)?;
        let fields = |address| -> hprof_index::Result<Vec<Value>> {
            let record = reader.read_by_address(address)?;
            match &record.as_object().expect("instance").body {
                ObjectBody::Instance { fields } => Ok(fields.clone()),
                other => panic!("0x{address:x} decoded as {other:?}"),
            }
        };
        assert_eq!(fields(0x2000)?, vec![Value::Int(9)]);
        assert_eq!(fields(0x2010)?, Vec::<Value>::new());
        assert_eq!(fields(0x2020)?, vec![Value::Int(5)]);
    }
    Ok(())
}
