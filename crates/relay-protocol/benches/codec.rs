//! Codec benchmarks for relay-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relay_protocol::{codec, FramePayload, OutboundFrame};
use serde_json::json;
use uuid::Uuid;

fn message_frame() -> OutboundFrame {
    OutboundFrame::new(FramePayload::Message(json!({
        "message_id": Uuid::new_v4(),
        "room_id": Uuid::new_v4(),
        "content": "x".repeat(64),
    })))
}

fn bench_encode_message(c: &mut Criterion) {
    let frame = message_frame();
    let size = codec::encode(&frame).unwrap().len();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(size as u64));
    group.bench_function("message_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_decode_client(c: &mut Criterion) {
    let room = Uuid::new_v4();
    let data = format!(r#"{{"type":"typing_start","data":{{"room_id":"{room}"}}}}"#);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("typing_start", |b| {
        b.iter(|| codec::decode_client(black_box(data.as_bytes()), codec::MAX_FRAME_SIZE))
    });
    group.finish();
}

fn bench_batch(c: &mut Criterion) {
    let frames: Vec<_> = (0..16)
        .map(|_| codec::encode(&message_frame()).unwrap())
        .collect();

    c.bench_function("batch_16", |b| b.iter(|| codec::encode_batch(black_box(&frames))));
}

criterion_group!(benches, bench_encode_message, bench_decode_client, bench_batch);
criterion_main!(benches);
