//! Benchmarks for the frame codec.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use prefork::codec::{FrameReader, FrameWriter};
use prefork::http::RequestArgs;
use prefork::protocol::{Command, WireRequest};
use std::io::Cursor;

/// Build a request frame with a binary body of the given size.
fn request_with_blob(size: usize) -> Command {
    let mut args = RequestArgs {
        ip: "127.0.0.1".to_string(),
        ips: vec!["127.0.0.1".to_string()],
        method: "POST".to_string(),
        http_version: "1.1".to_string(),
        uri: "/img/resize".to_string(),
        url: "/img/resize?w=256".to_string(),
        ..Default::default()
    };
    args.headers
        .insert("content-type".to_string(), "image/png".to_string());
    args.params.raw = Some(vec![0xa5; size]);
    Command::Request(WireRequest {
        id: "req-abc123-00".to_string(),
        args,
    })
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [1024, 64 * 1024, 1024 * 1024].iter() {
        let command = request_with_blob(*size);
        group.bench_with_input(BenchmarkId::new("blob", size), size, |b, _| {
            b.iter(|| {
                let mut buf = Vec::with_capacity(size + 256);
                let mut writer = FrameWriter::new(&mut buf);
                writer.write(black_box(&command)).unwrap();
                drop(writer);
                black_box(buf)
            });
        });
    }

    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_roundtrip");

    for size in [1024, 64 * 1024].iter() {
        let command = request_with_blob(*size);
        let mut encoded = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut encoded);
            writer.write(&command).unwrap();
        }

        group.bench_with_input(BenchmarkId::new("blob", size), size, |b, _| {
            b.iter(|| {
                let mut reader = FrameReader::new(Cursor::new(black_box(&encoded)));
                let decoded: Command = reader.read().unwrap().unwrap();
                black_box(decoded)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_roundtrip);
criterion_main!(benches);
