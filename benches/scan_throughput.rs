#![allow(missing_docs)]

use std::hint::black_box;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use hprof_index::{BuildConfig, HprofIndex, ParallelConfig};

const ARRAYS: u64 = 200_000;
const ID_SIZE: usize = 8;

/// A dump holding `java.lang.Object` and `ARRAYS` small int arrays.
fn generate_dump() -> Vec<u8> {
    let mut out = b"JAVA PROFILE 1.0.2\0".to_vec();
    out.extend_from_slice(&(ID_SIZE as u32).to_be_bytes());
    out.extend_from_slice(&0u64.to_be_bytes());

    let name = b"java/lang/Object";
    record(&mut out, 0x01, &[&1u64.to_be_bytes()[..], name].concat());
    let mut load = Vec::new();
    load.extend_from_slice(&1u32.to_be_bytes());
    load.extend_from_slice(&0x1000u64.to_be_bytes());
    load.extend_from_slice(&0u32.to_be_bytes());
    load.extend_from_slice(&1u64.to_be_bytes());
    record(&mut out, 0x02, &load);

    let mut body = vec![0x20];
    body.extend_from_slice(&0x1000u64.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&[0u8; ID_SIZE * 6]);
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&[0u8; 6]);
    for i in 0..ARRAYS {
        body.push(0x23);
        body.extend_from_slice(&(0x10_0000 + i * 0x20).to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&4u32.to_be_bytes());
        body.push(10);
        for v in 0..4u32 {
            body.extend_from_slice(&(v + i as u32).to_be_bytes());
        }
    }
    record(&mut out, 0x0c, &body);
    out
}

fn record(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
}

fn bench_build(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let dump = dir.path().join("bench.hprof");
    let bytes = generate_dump();
    std::fs::write(&dump, &bytes).expect("Failed to write dump");

    let mut group = c.benchmark_group("Index Build");
    group.sample_size(10);
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    for threads in [1usize, 4] {
        let config = BuildConfig {
            parallel: ParallelConfig {
                threads,
                ..ParallelConfig::default()
            },
            ..BuildConfig::default()
        };
        let prefix = dir.path().join(format!("bench{threads}"));
        group.bench_function(format!("build_{threads}_threads"), |b| {
            b.iter(|| {
                let output = HprofIndex::build(&dump, &prefix, &config).expect("Failed to build");
                black_box(output.info.object_count);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_build);
criterion_main!(benches);
