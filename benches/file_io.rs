//! Append and read throughput for the two storage backends.
//!
//! The parallel backend should win clearly on multi-threaded append (its
//! CAS reservation never blocks other appenders), while single-threaded
//! numbers for the two variants should stay within lock-overhead distance
//! of each other.
//!
//! ```bash
//! cargo bench --bench file_io
//! cargo bench --bench file_io -- "append"
//! ```

use std::sync::Barrier;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mapfile::{AtomicMapFile, OpenFlags, ParallelMapFile, StorageFile};
use tempfile::tempdir;

const RECORD: &[u8] = &[0x42; 128];
const RECORDS_PER_ITER: usize = 256;

fn open_backend(dir: &tempfile::TempDir, name: &str, parallel: bool) -> Box<dyn StorageFile> {
    let file: Box<dyn StorageFile> = if parallel {
        Box::new(ParallelMapFile::new())
    } else {
        Box::new(AtomicMapFile::new())
    };
    file.set_allocation_strategy(1 << 20, 2.0).unwrap();
    file.open(&dir.path().join(name), true, OpenFlags::default())
        .unwrap();
    file
}

fn bench_single_thread_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_single_thread");
    group.throughput(Throughput::Bytes((RECORD.len() * RECORDS_PER_ITER) as u64));

    for (label, parallel) in [("parallel", true), ("atomic", false)] {
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            let dir = tempdir().unwrap();
            let file = open_backend(&dir, "bench.db", parallel);
            b.iter(|| {
                for _ in 0..RECORDS_PER_ITER {
                    black_box(file.append(black_box(RECORD)).unwrap());
                }
                // Rewind the logical size so the file stays at its
                // steady-state allocation across iterations.
                file.truncate_fakely(0).unwrap();
            });
            file.close().unwrap();
        });
    }
    group.finish();
}

fn bench_contended_append(c: &mut Criterion) {
    const THREADS: usize = 4;

    let mut group = c.benchmark_group("append_contended");
    group.throughput(Throughput::Bytes(
        (RECORD.len() * RECORDS_PER_ITER * THREADS) as u64,
    ));

    for (label, parallel) in [("parallel", true), ("atomic", false)] {
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            let dir = tempdir().unwrap();
            let file = open_backend(&dir, "bench.db", parallel);
            b.iter(|| {
                let barrier = Barrier::new(THREADS);
                thread::scope(|scope| {
                    for _ in 0..THREADS {
                        let file = &file;
                        let barrier = &barrier;
                        scope.spawn(move || {
                            barrier.wait();
                            for _ in 0..RECORDS_PER_ITER {
                                black_box(file.append(black_box(RECORD)).unwrap());
                            }
                        });
                    }
                });
                file.truncate_fakely(0).unwrap();
            });
            file.close().unwrap();
        });
    }
    group.finish();
}

fn bench_random_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_random");
    group.throughput(Throughput::Bytes((RECORD.len() * RECORDS_PER_ITER) as u64));

    for (label, parallel) in [("parallel", true), ("atomic", false)] {
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            let dir = tempdir().unwrap();
            let file = open_backend(&dir, "bench.db", parallel);
            for _ in 0..1024 {
                file.append(RECORD).unwrap();
            }
            let mut buf = [0u8; 128];
            let mut cursor = 0u64;
            b.iter(|| {
                for _ in 0..RECORDS_PER_ITER {
                    // Strided walk over the 1024 records.
                    cursor = (cursor + 37) % 1024;
                    file.read(cursor * RECORD.len() as u64, &mut buf).unwrap();
                    black_box(&buf);
                }
            });
            file.close().unwrap();
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_single_thread_append,
    bench_contended_append,
    bench_random_read
);
criterion_main!(benches);
