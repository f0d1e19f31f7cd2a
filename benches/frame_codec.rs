/// Benchmark: frame encode/decode hot path.
///
/// Every outbound message and every inbound message crosses the codec, so at
/// tens of thousands of clients this is the busiest non-I/O code in the run.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use phxload::protocol::{Equality, Frame, SubscribePayload};

fn bench_encode_join(c: &mut Criterion) {
    c.bench_function("encode_join", |b| {
        b.iter(|| {
            let frame = Frame::join(black_box("user:100001"), black_box("100001"));
            black_box(frame.encode());
        });
    });
}

fn bench_encode_subscribe(c: &mut Criterion) {
    c.bench_function("encode_subscribe", |b| {
        b.iter(|| {
            let payload = SubscribePayload::new(
                black_box("100001"),
                "posts",
                "userid",
                "57",
                Equality::Eq,
                "updated_at desc",
                5,
                "posts",
                "id",
            );
            let frame = Frame::new(Some("1"), "2", "user:100001", "subscribe", payload.into_map());
            black_box(frame.encode());
        });
    });
}

fn bench_decode_reply(c: &mut Criterion) {
    let text = r#"["1","2","user:100001","phx_reply",{"status":"ok","response":{}}]"#;
    c.bench_function("decode_reply", |b| {
        b.iter(|| {
            black_box(Frame::decode(black_box(text)).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_encode_join,
    bench_encode_subscribe,
    bench_decode_reply
);
criterion_main!(benches);
