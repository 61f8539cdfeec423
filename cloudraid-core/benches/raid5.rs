//! Benchmarks for the RAID5 split/merge codec
//!
//! Run with: cargo bench --package cloudraid-core --bench raid5

use cloudraid_core::raid5::{merge, split, ParityPolicy};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Generate test data of specified size
fn generate_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * i + i) as u8).collect()
}

fn format_size(size: usize) -> String {
    if size >= 1024 * 1024 {
        format!("{}MB", size / (1024 * 1024))
    } else {
        format!("{}KB", size / 1024)
    }
}

fn split_to_vecs(data: &[u8]) -> [Vec<u8>; 3] {
    let mut devices: [Vec<u8>; 3] = Default::default();
    split(data, devices.each_mut()).unwrap();
    devices
}

/// Benchmark splitting at various sizes
fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("raid5_split");

    for size in [
        64 * 1024,        // 64 KB
        1024 * 1024,      // 1 MB
        10 * 1024 * 1024, // 10 MB
    ] {
        let data = generate_data(size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format_size(size)), &data, |b, data| {
            b.iter(|| split_to_vecs(black_box(data)))
        });
    }

    group.finish();
}

/// Benchmark merging with all devices and with one device lost
fn bench_merge(c: &mut Criterion) {
    let size = 10 * 1024 * 1024;
    let data = generate_data(size);
    let devices = split_to_vecs(&data);

    let mut group = c.benchmark_group("raid5_merge_10MB");
    group.throughput(Throughput::Bytes(size as u64));

    group.bench_function("all_devices", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(size);
            merge(
                [Some(&devices[0][..]), Some(&devices[1][..]), Some(&devices[2][..])],
                &mut out,
                ParityPolicy::Warn,
                None,
            )
            .unwrap();
            black_box(out)
        })
    });

    for dead in 0..3 {
        group.bench_function(BenchmarkId::new("degraded", dead), |b| {
            b.iter(|| {
                let mut inputs = [Some(&devices[0][..]), Some(&devices[1][..]), Some(&devices[2][..])];
                inputs[dead] = None;
                let mut out = Vec::with_capacity(size);
                merge(inputs, &mut out, ParityPolicy::Warn, Some(size as u64)).unwrap();
                black_box(out)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_split, bench_merge);
criterion_main!(benches);
