//! # Channel Proxy Benchmarks
//!
//! Hot paths touched for every frame or bus message:
//!
//! | Path | Runs per |
//! |------|----------|
//! | Frame read + packet decode | client frame |
//! | Channel topic parse | SUBSCRIBE / PUBLISH |
//! | Delivery queue push + pop | bus message per subscriber |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mqtt_proxy::domain::{encode_publish, encode_subscribe};
use mqtt_proxy::{parse_channel_topic, read_frame, Packet, DEFAULT_MAX_FRAME_SIZE};
use shared_bus::delivery_queue;
use shared_types::{BridgeMessage, ChannelId, ThingId, PROTOCOL_HTTP};
use std::time::Duration;

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    group.measurement_time(Duration::from_secs(5));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    for size in [16usize, 1024, 64 * 1024] {
        let payload = vec![0xAB; size];
        let wire = encode_publish("channels.42", &payload).unwrap();

        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::new("read_and_decode_publish", size), &wire, |b, wire| {
            b.iter(|| {
                let frame = runtime
                    .block_on(read_frame(&mut wire.as_ref(), DEFAULT_MAX_FRAME_SIZE))
                    .unwrap();
                black_box(Packet::decode(&frame).unwrap())
            })
        });
    }

    let subscribe = encode_subscribe(1, &["channels.42"]).unwrap();
    let frame = runtime
        .block_on(read_frame(&mut subscribe.as_ref(), DEFAULT_MAX_FRAME_SIZE))
        .unwrap();
    group.bench_function("decode_subscribe", |b| {
        b.iter(|| black_box(Packet::decode(&frame).unwrap()))
    });

    group.finish();
}

fn bench_topic_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic");
    group.bench_function("parse_channel_topic", |b| {
        b.iter(|| black_box(parse_channel_topic(black_box("channels.18446744073709551615"))))
    });
    group.bench_function("reject_malformed_topic", |b| {
        b.iter(|| black_box(parse_channel_topic(black_box("channels.42/extra")).is_err()))
    });
    group.finish();
}

fn bench_delivery_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("delivery_queue");
    let message = BridgeMessage::new(ChannelId(42), PROTOCOL_HTTP, vec![0u8; 256], ThingId::new("bench"));

    group.throughput(Throughput::Elements(1));
    group.bench_function("push_pop", |b| {
        let (sender, mut receiver) = delivery_queue(256);
        b.iter(|| {
            sender.push(message.clone());
            black_box(receiver.try_recv())
        })
    });

    // Producer never blocks on a full queue
    group.bench_function("push_full_drop_oldest", |b| {
        let (sender, receiver) = delivery_queue(16);
        for _ in 0..16 {
            sender.push(message.clone());
        }
        b.iter(|| black_box(sender.push(message.clone())));
        black_box(receiver.dropped());
    });

    group.finish();
}

criterion_group!(benches, bench_frame_decode, bench_topic_parse, bench_delivery_queue);
criterion_main!(benches);
