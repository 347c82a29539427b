use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rolepool::protocol::frame::{read_length_prefixed, write_length_prefixed};
use rolepool::protocol::{self, Frame, Operation};
use serde_json::json;
use std::time::Instant;

/// Frame codec throughput for typical body sizes
fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame");

    for size in [0usize, 64, 1024, 64 * 1024] {
        let frame = Frame::new(1, 42, Bytes::from(vec![0xAB; size]));
        let encoded = frame.encode();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode()))
        });

        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| black_box(Frame::decode(encoded.clone()).is_ok()))
        });

        group.bench_with_input(BenchmarkId::new("length_prefixed", size), &encoded, |b, encoded| {
            let mut buf = BytesMut::with_capacity(encoded.len() + 4);
            b.iter(|| {
                buf.clear();
                write_length_prefixed(&mut buf, encoded).unwrap();
                black_box(read_length_prefixed(&mut buf).unwrap())
            })
        });
    }

    group.finish();
}

/// Building requests and reading responses, as done per dispatched call
fn bench_request_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("request");

    group.bench_function("select_into_request", |b| {
        b.iter(|| {
            let op = Operation::Select {
                space: json!("users"),
                index: json!("primary"),
                offset: 0,
                limit: 100,
                iterator: 0,
                key: json!([42]),
            };
            black_box(op.into_request(Instant::now()).unwrap().to_frame(7).encode())
        })
    });

    let rows: Vec<_> = (0..100).map(|i| json!([i, format!("user-{}", i), i * 10])).collect();
    let response = protocol::Response {
        code: protocol::RESPONSE_OK,
        sync: 7,
        body: protocol::data_body(rows),
    };
    group.bench_function("response_data_100_rows", |b| {
        b.iter(|| black_box(response.data().unwrap().len()))
    });

    group.finish();
}

criterion_group!(benches, bench_frame_codec, bench_request_response);
criterion_main!(benches);
