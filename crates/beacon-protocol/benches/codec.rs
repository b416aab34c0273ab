//! Codec benchmarks for beacon-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use beacon_protocol::{codec, kinds, Envelope};

fn message(size: usize) -> Envelope {
    Envelope::new(kinds::NEW_MESSAGE)
        .with_field("matchId", "m1")
        .with_field("content", "x".repeat(size))
}

fn bench_encode_small(c: &mut Criterion) {
    let envelope = message(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| b.iter(|| codec::encode(black_box(&envelope))));
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let encoded = codec::encode(&message(64)).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(black_box(&encoded[..]));
            codec::decode_from(&mut buf).unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode_small, bench_decode_small);
criterion_main!(benches);
