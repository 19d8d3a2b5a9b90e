//! Throughput benchmarks for the bounded branches and the orchestrated tee.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use riverfork::observability::NullSink;
use riverfork::{Branch, Consumer, Orchestrator, TeeConfig};
use std::hint::black_box;
use std::io::{self, Cursor};

const PAYLOAD: usize = 4 * 1024 * 1024;

fn counting_consumer() -> Consumer<u64> {
    Consumer::new(|reader| Ok(io::copy(reader, &mut io::sink())?))
}

fn bench_branch_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("branch_transfer");
    group.throughput(Throughput::Bytes(PAYLOAD as u64));

    for capacity in [64, 2048, 64 * 1024].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            capacity,
            |b, &capacity| {
                let chunk = vec![7u8; 4096];
                b.iter(|| {
                    let (mut writer, mut reader) =
                        Branch::with_capacity(capacity).split().unwrap();

                    std::thread::scope(|s| {
                        let consumer = s.spawn(move || io::copy(&mut reader, &mut io::sink()));

                        for _ in 0..PAYLOAD / chunk.len() {
                            writer.write_chunk(&chunk).unwrap();
                        }
                        writer.close_write();

                        black_box(consumer.join().unwrap().unwrap());
                    });
                });
            },
        );
    }

    group.finish();
}

fn bench_tee_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("tee_fanout");
    group.throughput(Throughput::Bytes(PAYLOAD as u64));

    let input = vec![3u8; PAYLOAD];
    let orchestrator = Orchestrator::with_config(TeeConfig::upload()).with_sink(NullSink);

    for consumers in [1, 2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(consumers),
            consumers,
            |b, &consumers| {
                b.iter(|| {
                    let results = orchestrator
                        .run(
                            Cursor::new(input.as_slice()),
                            (0..consumers).map(|_| counting_consumer()).collect(),
                        )
                        .unwrap();
                    black_box(results)
                });
            },
        );
    }

    group.finish();
}

fn bench_chunk_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_size");
    group.throughput(Throughput::Bytes(PAYLOAD as u64));

    let input = vec![5u8; PAYLOAD];

    for chunk_size in [256, 2048, 16 * 1024].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            chunk_size,
            |b, &chunk_size| {
                let orchestrator = Orchestrator::with_config(
                    TeeConfig::default()
                        .with_chunk_size(chunk_size)
                        .with_default_capacity(chunk_size * 2),
                )
                .with_sink(NullSink);

                b.iter(|| {
                    black_box(
                        orchestrator
                            .run_pair(
                                Cursor::new(input.as_slice()),
                                counting_consumer(),
                                counting_consumer(),
                            )
                            .unwrap(),
                    )
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_branch_transfer,
    bench_tee_fanout,
    bench_chunk_size
);
criterion_main!(benches);
