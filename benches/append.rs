//! Batched append throughput, mirroring the teacher's `benches/append.rs`
//! shape: a fresh queue directory per iteration, a fixed batch of
//! fixed-size payloads pushed back to back.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use chronicle_queue::{Params, Publisher};

fn push_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("publisher_push");

    for payload_len in [8usize, 256, 4096] {
        let payload = vec![0xABu8; payload_len];
        group.bench_function(format!("payload_{payload_len}"), |b| {
            b.iter_batched(
                || {
                    let dir = tempfile::tempdir().unwrap();
                    let publisher = Publisher::open(dir.path(), Some(Params::default())).unwrap();
                    (dir, publisher)
                },
                |(_dir, mut publisher)| {
                    for _ in 0..1000 {
                        black_box(publisher.push(&payload).unwrap());
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, push_batch);
criterion_main!(benches);
