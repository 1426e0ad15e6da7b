//! Performance benchmarks for transcript reconciliation

use chrono::{Duration as ChronoDuration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use switchboard::reconcile::{Reconciler, ReconcilerConfig};
use switchboard::types::{Direction, Event, MessageBody};

fn inbound(i: usize, offset_secs: i64) -> Event {
    Event::remote(
        format!("m{}", i),
        "c1",
        MessageBody::customer(format!("Customer message number {}", i)),
        Direction::Inbound,
        Utc::now() + ChronoDuration::seconds(offset_secs),
    )
}

fn seeded(size: usize) -> Reconciler {
    let mut reconciler = Reconciler::new("c1", ReconcilerConfig::default());
    reconciler.snapshot((0..size).map(|i| inbound(i, -(size as i64) + i as i64)).collect());
    reconciler
}

fn bench_ingest_tail(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest_tail");
    group.throughput(Throughput::Elements(1));

    for size in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || seeded(size),
                |mut reconciler| {
                    black_box(reconciler.ingest(inbound(size, 1)));
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_ingest_out_of_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest_out_of_order");
    group.throughput(Throughput::Elements(1));

    // Lands at the front, so the whole sequence shifts
    for size in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || seeded(size),
                |mut reconciler| {
                    black_box(reconciler.ingest(inbound(size, -(size as i64) - 10)));
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_duplicate_delivery(c: &mut Criterion) {
    let mut reconciler = seeded(1_000);
    let duplicate = inbound(500, 0);

    c.bench_function("ingest_duplicate_1000", |b| {
        b.iter(|| black_box(reconciler.ingest(duplicate.clone())))
    });
}

fn bench_echo_correlation(c: &mut Criterion) {
    let mut group = c.benchmark_group("echo_correlation");

    for pending in [1, 16, 128] {
        group.bench_with_input(
            BenchmarkId::from_parameter(pending),
            &pending,
            |b, &pending| {
                b.iter_batched(
                    || {
                        let mut reconciler = seeded(1_000);
                        for i in 0..pending {
                            reconciler
                                .add_local(
                                    MessageBody::operator(format!("reply {}", i)),
                                    Direction::Outbound,
                                )
                                .unwrap();
                        }
                        reconciler
                    },
                    |mut reconciler| {
                        let echo = Event::remote(
                            "srv-echo",
                            "c1",
                            MessageBody::operator("reply 0"),
                            Direction::Outbound,
                            Utc::now(),
                        );
                        black_box(reconciler.ingest(echo));
                    },
                    criterion::BatchSize::LargeInput,
                )
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ingest_tail,
    bench_ingest_out_of_order,
    bench_duplicate_delivery,
    bench_echo_correlation
);
criterion_main!(benches);
