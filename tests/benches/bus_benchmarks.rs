//! # Message Bus Benchmarks
//!
//! | Area | Operation |
//! |------|-----------|
//! | Codec | JSON encode/decode of the payload envelope |
//! | Topology | Route derivation per publish |
//! | Publisher | Publish through the in-process broker |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use message_bus::{
    Backend, BusConfig, InMemoryBroker, JsonCodec, MessagePublisher, Payload, PayloadCodec,
    Publisher, Topology,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Codec
// ============================================================================

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    group.measurement_time(Duration::from_secs(5));

    for fields in [1usize, 16, 256] {
        let data: serde_json::Map<String, serde_json::Value> = (0..fields)
            .map(|i| (format!("field_{i}"), json!({"n": i, "s": "value"})))
            .collect();
        let payload = Payload::new(serde_json::Value::Object(data)).ensure_trace_id();
        let encoded = JsonCodec.encode(&payload).unwrap();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", fields), &payload, |b, p| {
            b.iter(|| black_box(JsonCodec.encode(p).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("decode", fields), &encoded, |b, bytes| {
            b.iter(|| black_box(JsonCodec.decode(bytes).unwrap()))
        });
    }

    group.finish();
}

// ============================================================================
// Topology
// ============================================================================

fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("topology");
    let exchange = Topology::new(&BusConfig::new(Backend::Exchange, "memory://bench"));
    let queue = Topology::new(&BusConfig::new(Backend::Queue, "memory://bench"));

    group.bench_function("route_exchange_delayed", |b| {
        b.iter(|| black_box(exchange.route(black_box("order.created"), 500).unwrap()))
    });
    group.bench_function("binding_queue", |b| {
        b.iter(|| black_box(queue.binding(black_box("order.created"))))
    });

    group.finish();
}

// ============================================================================
// Publisher
// ============================================================================

fn bench_publish(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("publisher");
    group.measurement_time(Duration::from_secs(5));

    for backend in [Backend::Queue, Backend::Exchange] {
        let broker = InMemoryBroker::new(format!("bench-{backend}"));
        let config = BusConfig::new(backend, broker.url());
        let publisher = Publisher::with_transport(&config, Arc::new(broker.connect()));
        let payload = Payload::new(json!({"order": 1})).ensure_trace_id();

        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("publish_unbound", backend.as_str()), |b| {
            b.iter(|| {
                runtime
                    .block_on(publisher.publish("order.created", 0, &payload))
                    .unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec, bench_route, bench_publish);

criterion_main!(benches);
