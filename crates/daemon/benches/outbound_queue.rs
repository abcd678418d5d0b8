//! Throughput benchmarks for the outbound queue.
//!
//! These measure the path every byte of shell output takes:
//! - Frame construction and UTF-8 boundary handling
//! - Push/recv through a bounded queue with one subscriber
//! - Fan-out to several subscribers

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protocol::{utf8_boundary, Frame, ServerMessage};
use ptygate::session::{OutboundQueue, QueueConfig};
use tokio::runtime::Runtime;

const FRAMES: u64 = 1_000;

/// Benchmark frame construction and conversion to the wire message.
fn bench_frame_conversion(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_conversion");

    for size in [1usize, 4096] {
        let payload = Bytes::from("x".repeat(size));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("data_to_json", size), &payload, |b, payload| {
            b.iter(|| {
                let frame = Frame::data(0, black_box(payload.clone()));
                ServerMessage::from_frame(&frame).unwrap().to_json().unwrap()
            });
        });
    }

    let mixed = "héllo wörld €".repeat(300).into_bytes();
    group.throughput(Throughput::Bytes(mixed.len() as u64));
    group.bench_function("utf8_boundary_4KB", |b| {
        b.iter(|| utf8_boundary(black_box(&mixed[..mixed.len() - 1])));
    });

    group.finish();
}

/// Benchmark push/recv with one subscriber at different capacities.
fn bench_queue_single_subscriber(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("queue_single_subscriber");
    group.throughput(Throughput::Elements(FRAMES));

    for capacity in [4usize, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &capacity| {
            b.iter(|| {
                rt.block_on(async {
                    let queue = OutboundQueue::new(QueueConfig {
                        capacity,
                        ..QueueConfig::default()
                    });
                    let mut stream = queue.subscribe();

                    let producer = {
                        let queue = queue.clone();
                        tokio::spawn(async move {
                            for _ in 0..FRAMES {
                                queue.push(Bytes::from_static(b"output line\r\n")).await.unwrap();
                            }
                            queue.close();
                        })
                    };

                    let mut received = 0u64;
                    while stream.recv().await.is_some() {
                        received += 1;
                    }
                    producer.await.unwrap();
                    received
                })
            });
        });
    }

    group.finish();
}

/// Benchmark fan-out to several subscribers.
fn bench_queue_fan_out(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("queue_fan_out");
    group.throughput(Throughput::Elements(FRAMES));

    for subscribers in [2usize, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, &subscribers| {
                b.iter(|| {
                    rt.block_on(async {
                        let queue = OutboundQueue::new(QueueConfig::default());
                        let consumers: Vec<_> = (0..subscribers)
                            .map(|_| {
                                let mut stream = queue.subscribe();
                                tokio::spawn(async move {
                                    let mut received = 0u64;
                                    while stream.recv().await.is_some() {
                                        received += 1;
                                    }
                                    received
                                })
                            })
                            .collect();

                        for _ in 0..FRAMES {
                            queue.push(Bytes::from_static(b"output line\r\n")).await.unwrap();
                        }
                        queue.close();

                        for consumer in consumers {
                            consumer.await.unwrap();
                        }
                    })
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_conversion,
    bench_queue_single_subscriber,
    bench_queue_fan_out,
);

criterion_main!(benches);
