#![allow(missing_docs)]

mod common;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use common::{SampleDump, sample_dump};
use hprof_index::format::{IndexKind, MAGIC_BYTES, MetaByte, TAIL_HEADER_SIZE, TailHeader};
use hprof_index::hprof::model::NO_POSITION;
use hprof_index::index::index_path;
use hprof_index::{
    BuildConfig, BuildHook, ClassTable, GcRootType, HeapObject, HeapRecord, HprofError,
    HprofIndex, IndexBuilder, IndexInspector, IndexSet, ObjectBody, ParallelConfig,
    SimpleMonitor, Value,
};
use parking_lot::Mutex;

fn write_sample(dir: &Path, chars: usize) -> hprof_index::Result<(SampleDump, std::path::PathBuf)> {
    let dump = dir.join("sample.hprof");
    let sample = sample_dump(8, chars);
    std::fs::write(&dump, &sample.bytes)?;
    Ok((sample, dump))
}

/// Collects every object Pass 2 decodes.
#[derive(Default)]
struct Collector {
    objects: Mutex<HashMap<u64, ObjectBody>>,
    classes_seen: Mutex<usize>,
}

impl BuildHook for Collector {
    fn after_pass1(&self, classes: &ClassTable) {
        *self.classes_seen.lock() = classes.len();
    }

    fn on_object(&self, object: &HeapObject) {
        self.objects.lock().insert(object.address, object.body.clone());
    }
}

/// Cancels its monitor once Pass 1 is over.
struct CancelAfterScan(Arc<SimpleMonitor>);

impl BuildHook for CancelAfterScan {
    fn after_pass1(&self, _classes: &ClassTable) {
        self.0.cancel();
    }
}

// --- TESTS ---

/// Every id has a class and a position; outbound lists only hold valid ids.
#[test]
fn index_has_no_orphans() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let (sample, dump) = write_sample(dir.path(), 50)?;
    let prefix = dir.path().join("s");
    HprofIndex::build(&dump, &prefix, &BuildConfig::default())?;

    let set = IndexSet::open(&prefix)?;
    let n = set.len();
    assert!(n > sample.char_arrays.len() as u64);
    let mut previous = None;
    for id in 0..n as u32 {
        let address = set.address_of(id)?;
        assert!(previous.is_none_or(|p| p < address), "addresses ascend");
        previous = Some(address);
        assert_eq!(set.id_of(address), Some(id));

        let class_id = set.class_id_of(id)?;
        assert!(u64::from(class_id) < n);
        let class_address = set.address_of(class_id)?;
        assert!(set.classes().iter().any(|c| c.address == class_address));

        for target in set.outbound_of(id)? {
            assert!(u64::from(target) < n);
        }
        if address != 0 && set.classes().iter().all(|c| c.address != address) {
            assert_ne!(set.position_of(id)?, NO_POSITION, "object 0x{address:x}");
        }
    }
    assert_eq!(set.address_of(0)?, 0, "system class loader");
    assert!(set.address_of(n as u32).is_err());
    assert_eq!(set.id_of(0xdead_beef), None);
    Ok(())
}

/// What the reader decodes equals what Pass 2 decoded.
#[test]
fn reader_matches_pass2_decode() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let (sample, dump) = write_sample(dir.path(), 20)?;
    let prefix = dir.path().join("r");
    let collector = Arc::new(Collector::default());
    let config = BuildConfig::default();
    IndexBuilder::new(config.clone())?
        .with_hook(Arc::clone(&collector) as Arc<dyn BuildHook>)
        .build(&dump, &prefix, &SimpleMonitor::new())?;
    assert!(*collector.classes_seen.lock() >= 4);

    let reader = HprofIndex::open(&dump, &prefix, &config)?;
    let objects = collector.objects.lock();
    assert_eq!(objects.len(), 8 + 1 + 20 + 1 + 1);
    for (&address, body) in objects.iter() {
        let HeapRecord::Object(object) = reader.read_by_address(address)? else {
            panic!("0x{address:x} read back as a class");
        };
        assert_eq!(&object.body, body, "0x{address:x}");
    }

    // The linked list: each node points at the next.
    let first = reader.read_by_address(sample.instances[0])?;
    let object = first.as_object().expect("instance");
    assert_eq!(
        object.body,
        ObjectBody::Instance {
            fields: vec![Value::Int(0), Value::Object(sample.instances[1])]
        }
    );
    let node = reader.index().id_of(sample.instances[0]).expect("id");
    let next = reader.index().id_of(sample.instances[1]).expect("id");
    let class = reader.index().id_of(sample.node_class).expect("id");
    assert_eq!(reader.outbound(node)?, vec![class, next]);
    assert!(matches!(reader.read_by_address(sample.node_class)?, HeapRecord::Class(_)));
    Ok(())
}

/// A healthy build inspects clean; a flipped payload byte is caught.
#[test]
fn inspector_reports_damage() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_, dump) = write_sample(dir.path(), 5)?;
    let prefix = dir.path().join("i");
    HprofIndex::build(&dump, &prefix, &BuildConfig::default())?;

    let report = IndexInspector::inspect(&prefix)?;
    assert!(report.is_healthy(), "{report}");
    assert_eq!(report.files.len(), IndexKind::ALL.len() - 1);
    assert!(report.info.is_some());
    assert!(report.to_string().contains("=== HPROF INDEX REPORT ==="));

    let roots = index_path(&prefix, IndexKind::GcRoots);
    let mut bytes = std::fs::read(&roots)?;
    bytes[0] ^= 0xff;
    std::fs::write(&roots, &bytes)?;
    let report = IndexInspector::inspect(&prefix)?;
    assert!(!report.is_healthy());
    let damaged = report
        .files
        .iter()
        .find(|f| f.kind == IndexKind::GcRoots)
        .expect("roots entry");
    assert!(!damaged.checksum_ok);
    assert!(report.to_string().contains("CHECKSUM MISMATCH"));
    assert!(matches!(IndexSet::open(&prefix), Err(HprofError::InvalidFormat(_))));

    std::fs::remove_file(index_path(&prefix, IndexKind::Classes))?;
    let report = IndexInspector::inspect(&prefix)?;
    assert_eq!(report.missing, vec![IndexKind::Classes]);
    Ok(())
}

/// Tail layout and its validation.
#[test]
fn tail_header_layout() -> hprof_index::Result<()> {
    let payload = b"some payload".to_vec();
    let tail = TailHeader::new(IndexKind::Outbound, MetaByte::new(1), 7, &payload);
    let bytes = tail.to_bytes();
    assert_eq!(bytes.len(), TAIL_HEADER_SIZE);
    assert_eq!(bytes[0..4], MAGIC_BYTES);
    assert_eq!(TailHeader::from_bytes(&bytes)?, tail);
    assert_eq!(tail.meta.compression_method(), 1);

    let mut file = payload.clone();
    file.extend_from_slice(&bytes);
    assert_eq!(TailHeader::from_file_bytes(&file)?.entries, 7);
    assert!(TailHeader::from_file_bytes(&file[1..]).is_err());

    let mut bad = bytes;
    bad[0] = b'X';
    assert!(matches!(TailHeader::from_bytes(&bad), Err(HprofError::InvalidFormat(_))));
    let mut bad = bytes;
    bad[6] = 200;
    assert!(TailHeader::from_bytes(&bad).is_err());
    assert!(TailHeader::from_bytes(&bytes[..10]).is_err());

    assert_eq!(
        index_path(Path::new("/tmp/heap"), IndexKind::Identifiers),
        Path::new("/tmp/heap.identifiers.index")
    );
    Ok(())
}

/// A cancelled build fails and writes nothing.
#[test]
fn cancelled_build_leaves_no_files() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_, dump) = write_sample(dir.path(), 10)?;
    let prefix = dir.path().join("x");

    let monitor = Arc::new(SimpleMonitor::new());
    let err = IndexBuilder::new(BuildConfig::default())?
        .with_hook(Arc::new(CancelAfterScan(Arc::clone(&monitor))))
        .build(&dump, &prefix, monitor.as_ref())
        .unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    for kind in IndexKind::ALL {
        assert!(!index_path(&prefix, kind).exists(), "{kind}");
    }

    let monitor = SimpleMonitor::new();
    monitor.cancel();
    let err = IndexBuilder::new(BuildConfig::default())?
        .build(&dump, &prefix, &monitor)
        .unwrap_err();
    assert!(matches!(err, HprofError::Cancelled));
    Ok(())
}

/// Parallel and sequential Pass 2 produce the same indices.
#[test]
fn parallel_build_matches_sequential() -> hprof_index::Result<()> {
    common::init_logging();
    let dir = tempfile::tempdir()?;
    let (_, dump) = write_sample(dir.path(), 400)?;
    let config_for = |threads| BuildConfig {
        parallel: ParallelConfig {
            threads,
            batch_records: 7,
            batch_bytes: 512,
            memory_budget: None,
        },
        ..BuildConfig::default()
    };

    let seq = HprofIndex::build(&dump, dir.path().join("seq"), &config_for(1))?;
    let par = HprofIndex::build(&dump, dir.path().join("par"), &config_for(4))?;
    assert!(par.stats.pass2.batches > 1);
    assert_eq!(seq.stats.pass2.records, par.stats.pass2.records);
    assert_eq!(seq.info.object_count, par.info.object_count);

    for kind in IndexKind::ALL {
        let a = index_path(&dir.path().join("seq"), kind);
        let b = index_path(&dir.path().join("par"), kind);
        if kind.is_optional() {
            assert!(!a.exists() && !b.exists());
            continue;
        }
        assert_eq!(std::fs::read(&a)?, std::fs::read(&b)?, "{kind} differs");
    }
    Ok(())
}

/// Thread-local roots hang off their thread and are reachable from it.
#[test]
fn thread_local_roots() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let (sample, dump) = write_sample(dir.path(), 2)?;
    let prefix = dir.path().join("t");
    HprofIndex::build(&dump, &prefix, &BuildConfig::default())?;
    let set = IndexSet::open(&prefix)?;

    let thread = set.id_of(sample.thread).expect("thread id");
    let local = set.id_of(sample.instances[0]).expect("local id");
    assert_eq!(set.thread_locals().len(), 1);
    let (owner, entries) = &set.thread_locals()[0];
    assert_eq!(*owner, thread);
    assert_eq!(entries.len(), 1);
    let (object, infos) = &entries[0];
    assert_eq!(*object, local);
    assert_eq!(infos[0].root_type, GcRootType::JavaLocal);
    assert_eq!(infos[0].referrer_id, Some(thread));
    assert_eq!(infos[0].context_id, None, "frames are not heap objects");
    assert!(set.outbound_of(thread)?.contains(&local));

    let thread_roots = set.roots_of(thread).expect("thread is a root");
    assert_eq!(thread_roots[0].root_type, GcRootType::Thread);
    let global = set.id_of(sample.instances[1]).expect("jni id");
    assert_eq!(set.roots_of(global).expect("jni root")[0].root_type, GcRootType::JniGlobal);
    let class = set.id_of(sample.object_class).expect("class id");
    assert_eq!(set.roots_of(class).expect("sticky")[0].root_type, GcRootType::SystemClass);
    assert_eq!(set.roots_of(local), None);
    Ok(())
}

/// A compressed adjacency payload reads back the same lists as an uncompressed one.
#[test]
fn compressed_adjacency_matches_plain() -> hprof_index::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_, dump) = write_sample(dir.path(), 300)?;
    let plain = dir.path().join("plain");
    let packed = dir.path().join("packed");
    HprofIndex::build(&dump, &plain, &BuildConfig::default())?;
    let config = BuildConfig {
        compress_adjacency: true,
        ..BuildConfig::default()
    };
    HprofIndex::build(&dump, &packed, &config)?;

    let bytes = std::fs::read(index_path(&packed, IndexKind::Outbound))?;
    let method = TailHeader::from_file_bytes(&bytes)?.meta.compression_method();
    #[cfg(feature = "lz4_flex")]
    assert_eq!(method, 1);
    #[cfg(not(feature = "lz4_flex"))]
    assert_eq!(method, 0);

    let a = IndexSet::open(&plain)?;
    let b = IndexSet::open(&packed)?;
    assert_eq!(a.len(), b.len());
    for id in 0..a.len() as u32 {
        assert_eq!(a.outbound_of(id)?, b.outbound_of(id)?, "id {id}");
    }
    let reader = HprofIndex::open(&dump, &packed, &config)?;
    assert_eq!(reader.outbound(1)?, a.outbound_of(1)?);

    let report = IndexInspector::inspect(&packed)?;
    assert!(report.is_healthy(), "{report}");
    Ok(())
}

/// The memory budget caps Pass 2 workers at two batches each, sized by the largest array.
#[test]
fn memory_budget_limits_workers() -> hprof_index::Result<()> {
    const MIB: u64 = 1024 * 1024;
    let builder_with = |budget: Option<u64>| {
        IndexBuilder::new(BuildConfig {
            parallel: ParallelConfig {
                threads: 4,
                batch_records: 1_000,
                batch_bytes: MIB as usize,
                memory_budget: budget,
            },
            ..BuildConfig::default()
        })
    };

    assert_eq!(builder_with(None)?.plan_threads(64 * MIB), 4);
    // Below one worker's two batches.
    assert_eq!(builder_with(Some(MIB))?.plan_threads(0), 1);
    assert_eq!(builder_with(Some(1 << 40))?.plan_threads(0), 4);
    assert_eq!(builder_with(Some(8 * MIB))?.plan_threads(0), 4);
    // A batch is at least as large as the largest array.
    assert_eq!(builder_with(Some(8 * MIB))?.plan_threads(2 * MIB), 2);
    assert_eq!(builder_with(Some(8 * MIB))?.plan_threads(4 * MIB), 1);
    assert_eq!(builder_with(Some(8 * MIB))?.plan_threads(64 * MIB), 1);

    // The same decision during a build.
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("big.hprof");
    let content = vec![7u8; 400_000];
    let mut w = common::HprofWriter::new(8);
    w.class_name(0x1000, "java/lang/Object");
    let mut body = w.body();
    body.class_dump(0x1000, 0, 0, &[], &[])
        .primitive_array(0x10_0000, hprof_index::BasicType::Byte, &content);
    for i in 0..50 {
        body.instance(0x20_0000 + 16 * i, 0x1000, &[]);
    }
    w.heap_dump(&body);
    w.write_to(&dump)?;

    let config_for = |budget| BuildConfig {
        parallel: ParallelConfig {
            threads: 4,
            batch_records: 5,
            batch_bytes: 512,
            memory_budget: budget,
        },
        ..BuildConfig::default()
    };
    let tight = HprofIndex::build(&dump, dir.path().join("tight"), &config_for(Some(MIB)))?;
    assert_eq!(tight.stats.largest_array_bytes, 400_000);
    assert_eq!(tight.stats.pass2.threads, 1);
    let roomy = HprofIndex::build(&dump, dir.path().join("roomy"), &config_for(Some(64 * MIB)))?;
    assert_eq!(roomy.stats.pass2.threads, 4);
    assert_eq!(tight.info.object_count, roomy.info.object_count);
    Ok(())
}
