use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rask_telemetry_channel::buffer::EventBatch;
use rask_telemetry_channel::domain::{EventSendType, SendRequestReason, TelemetryItem};
use rask_telemetry_channel::sender::Serializer;
use std::hint::black_box;

fn batch(tenant: &str, n: usize) -> EventBatch {
    EventBatch::with_events(
        tenant,
        (0..n)
            .map(|i| {
                TelemetryItem::new(format!("event-{i}"), tenant)
                    .with_data("uri", format!("/page/{i}"))
                    .with_data("duration", i as u64)
            })
            .collect(),
    )
}

fn bench_append_payload(c: &mut Criterion) {
    let serializer = Serializer::new();
    let mut group = c.benchmark_group("append_payload");

    for size in [10, 100, 500] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || batch("tenant", size),
                |batch| {
                    let mut payload = serializer.create_payload(
                        0,
                        false,
                        false,
                        false,
                        SendRequestReason::NormalSchedule,
                        EventSendType::Batched,
                    );
                    serializer.append_payload(&mut payload, batch, 500);
                    black_box(payload.blob().len())
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_reduced_payload_overflow(c: &mut Criterion) {
    let serializer = Serializer::new();

    c.bench_function("reduced_payload_overflow", |b| {
        b.iter_batched(
            || batch("tenant", 2_000),
            |batch| {
                let mut payload = serializer.create_payload(
                    0,
                    true,
                    true,
                    true,
                    SendRequestReason::Unload,
                    EventSendType::SendBeacon,
                );
                serializer.append_payload(&mut payload, batch, 2_000);
                black_box(payload.overflow.as_ref().map(EventBatch::count))
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_append_payload, bench_reduced_payload_overflow);
criterion_main!(benches);
