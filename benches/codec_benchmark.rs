//! Benchmarks for the pipe frame codecs.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use procfan::pool::{Command, LengthPrefixedCodec, LineCodec, OnError, Outcome, Reply};
use serde_json::{Value, json};

/// A task payload of roughly `size` bytes.
fn payload(size: usize) -> Value {
    json!({ "id": 42, "data": "x".repeat(size) })
}

fn bench_line_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("line_codec");
    let codec = LineCodec;

    for size in [16, 1024, 64 * 1024].iter() {
        let command = Command::compute_one(OnError::Continue, 7, payload(*size));
        let frame = codec.encode(&command).unwrap();
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), size, |b, _| {
            b.iter(|| codec.encode(black_box(&command)).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("decode", size), size, |b, _| {
            b.iter(|| {
                codec
                    .try_decode::<Command>(black_box(&frame))
                    .unwrap()
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_length_prefixed_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("length_prefixed_codec");
    let codec = LengthPrefixedCodec::default();

    for size in [16, 1024, 1024 * 1024].iter() {
        let reply = Reply::compute(vec![(7, Outcome::Ok(payload(*size)))]);
        let frame = codec.encode(&reply).unwrap();
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), size, |b, _| {
            b.iter(|| codec.encode(black_box(&reply)).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("decode", size), size, |b, _| {
            b.iter(|| {
                codec
                    .try_decode::<Reply>(black_box(&frame))
                    .unwrap()
                    .unwrap()
            });
        });

        // The dispatcher retries decode after every partial read.
        let partial = &frame[..frame.len() / 2];
        group.bench_with_input(BenchmarkId::new("incomplete", size), size, |b, _| {
            b.iter(|| codec.try_decode::<Reply>(black_box(partial)).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_line_codec, bench_length_prefixed_codec);
criterion_main!(benches);
