use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use scribe_collab::broker::LocalBroker;
use scribe_collab::error::Result;
use scribe_collab::presence::cursor_color;
use scribe_collab::protocol::{to_payload, EditEnvelope, EditKind, EditOperation, Frame, Message, Payload};
use scribe_collab::session::apply_edit;
use scribe_relay::TopicGroup;
use serde_json::json;
use uuid::Uuid;

fn edit_payload() -> Payload {
    let edit = EditOperation {
        document_id: "tpl-bench".into(),
        author_id: "user-1".into(),
        author_name: "Bench".into(),
        timestamp: 1_700_000_000_000,
        kind: EditKind::Replace {
            position: 0,
            length: 512,
            content: "x".repeat(512),
        },
    };
    to_payload(&EditEnvelope::new(edit)).unwrap()
}

fn subscribed_broker(subscribers: usize) -> LocalBroker {
    let broker = LocalBroker::new();
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..subscribers {
        let hits = hits.clone();
        broker.subscribe_now(
            "template-edits",
            Arc::new(move |_m: &Message| -> Result<()> {
                hits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        );
    }
    broker
}

fn bench_local_publish_fan_out(c: &mut Criterion) {
    let payload = edit_payload();

    // Fresh broker per batch so the append-only log stays bounded.
    c.bench_function("local_publish_100_msgs_10_subscribers", |b| {
        b.iter_batched(
            || subscribed_broker(10),
            |broker| {
                for _ in 0..100 {
                    black_box(broker.publish_now(Message::new("template-edits", payload.clone())));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let wire = Message::new("template-edits", edit_payload()).to_wire().unwrap();
    let frame = Frame::Produce(wire);

    c.bench_function("frame_encode_edit", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let wire = Message::new("template-edits", edit_payload()).to_wire().unwrap();
    let encoded = Frame::Deliver(wire).encode().unwrap();

    c.bench_function("frame_decode_edit", |b| {
        b.iter(|| {
            let Frame::Deliver(wire) = Frame::decode(black_box(&encoded)).unwrap() else {
                unreachable!()
            };
            black_box(wire.into_message().unwrap());
        })
    });
}

fn bench_apply_edit(c: &mut Criterion) {
    let text = "lorem ipsum dolor sit amet ".repeat(200);
    let insert = EditKind::Insert {
        position: 2_000,
        content: "inserted".into(),
    };

    c.bench_function("apply_insert_5k_chars", |b| {
        b.iter(|| black_box(apply_edit(black_box(&text), black_box(&insert))))
    });
}

fn bench_cursor_color(c: &mut Criterion) {
    c.bench_function("cursor_color", |b| {
        b.iter(|| black_box(cursor_color(black_box("5f0c6a3e-user"))))
    });
}

fn bench_relay_topic_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = TopicGroup::new("all-events", 4096);
    let receivers: Vec<_> = rt.block_on(async {
        let mut receivers = Vec::new();
        for _ in 0..100 {
            receivers.push(group.add_consumer(Uuid::new_v4()).await);
        }
        receivers
    });
    let frame = Arc::new(
        Frame::Deliver(
            Message::new("all-events", json!({"k": "v"}).as_object().cloned().unwrap())
                .to_wire()
                .unwrap(),
        )
        .encode()
        .unwrap(),
    );

    c.bench_function("topic_fan_out_100_consumers", |b| {
        b.iter(|| black_box(group.publish_raw(frame.clone())))
    });
    drop(receivers);
}

criterion_group!(
    benches,
    bench_local_publish_fan_out,
    bench_frame_encode,
    bench_frame_decode,
    bench_apply_edit,
    bench_cursor_color,
    bench_relay_topic_fan_out,
);
criterion_main!(benches);
