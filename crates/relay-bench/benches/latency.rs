//! Latency benchmarks for the event path.
//!
//! These measure the time from a bus payload arriving to its frame sitting
//! in a member's outbound queue.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relay_bench::{drain, join_room};
use relay_core::{EventBridge, Hub, HubConfig, MemoryBus, DEFAULT_DEDUP_WINDOW};
use relay_protocol::events::types;
use relay_protocol::EventEnvelope;
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use uuid::Uuid;

fn message_payload(room: Uuid) -> String {
    let mut data = Map::new();
    data.insert("content".into(), json!("x".repeat(64)));
    let event =
        EventEnvelope::message_event(types::MESSAGE_SEND, room, Uuid::new_v4(), data, None);
    serde_json::to_string(&event).unwrap()
}

/// Benchmark decoding and dispatching one bus payload.
fn bench_bridge_dispatch(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("bridge_dispatch");

    let room = Uuid::new_v4();
    let (bridge, mut receivers) = runtime.block_on(async {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let mut receivers = join_room(&hub, room, 10, 4096).unwrap();
        hub.stats().await.unwrap();
        drain(&mut receivers);
        let bridge =
            EventBridge::with_default_handlers(hub, Arc::new(MemoryBus::new()), DEFAULT_DEDUP_WINDOW);
        (bridge, receivers)
    });

    group.bench_function("message_send_to_queue", |b| {
        b.iter_custom(|iters| {
            // Fresh ids so the dedup window never short-circuits.
            let payloads: Vec<String> = (0..iters).map(|_| message_payload(room)).collect();
            runtime.block_on(async {
                let mut total = Duration::ZERO;
                for payload in &payloads {
                    let start = Instant::now();
                    black_box(bridge.dispatch_payload(payload).unwrap());
                    let first = &mut receivers[0];
                    black_box(first.recv().await);
                    total += start.elapsed();
                    drain(&mut receivers);
                }
                total
            })
        });
    });

    group.bench_function("duplicate_rejected", |b| {
        let payload = message_payload(room);
        runtime.block_on(async {
            bridge.dispatch_payload(&payload).unwrap();
        });
        b.iter(|| bridge.dispatch_payload(black_box(&payload)).unwrap());
    });

    group.finish();
    drain(&mut receivers);
}

criterion_group!(benches, bench_bridge_dispatch);
criterion_main!(benches);
