//! Performance benchmarks for FrameCodec.
//!
//! Run benchmarks with:
//! ```sh
//! cargo bench --bench codec_bench
//! ```

use bytes::BytesMut;
use cardterm_core::SubProtocol;
use cardterm_protocol::{CommandCode, FrameCodec, Message, ResponseCode};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tokio_util::codec::{Decoder, Encoder};

/// Keepalive request, the most frequent message on both links.
fn create_keepalive() -> Message {
    Message::request(CommandCode::Diagnostics)
}

/// SAM APDU response as seen during authentication.
fn create_sam_response() -> Message {
    Message::response(CommandCode::SamApdu, ResponseCode::Success)
        .with_slot(0)
        .with_apdu(vec![0x5A; 18])
}

fn codec() -> FrameCodec {
    FrameCodec::for_protocol(SubProtocol::Transit)
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));

    let keepalive = create_keepalive();
    let sam = create_sam_response();

    group.bench_function("keepalive", |b| {
        b.iter(|| {
            let mut buffer = BytesMut::new();
            codec().encode(black_box(keepalive.clone()), &mut buffer).unwrap();
            black_box(buffer);
        });
    });

    group.bench_function("sam_apdu_response", |b| {
        b.iter(|| {
            let mut buffer = BytesMut::new();
            codec().encode(black_box(sam.clone()), &mut buffer).unwrap();
            black_box(buffer);
        });
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));

    let mut encoded = BytesMut::new();
    codec().encode(create_sam_response(), &mut encoded).unwrap();
    let encoded = encoded.freeze();

    group.bench_function("sam_apdu_response", |b| {
        b.iter(|| {
            let mut buffer = BytesMut::from(&encoded[..]);
            black_box(codec().decode(&mut buffer).unwrap());
        });
    });

    group.finish();
}

fn bench_decode_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_batch");

    for batch_size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));

        let mut encoded = BytesMut::new();
        let mut encoder = codec();
        for _ in 0..*batch_size {
            encoder.encode(create_sam_response(), &mut encoded).unwrap();
        }
        let encoded = encoded.freeze();

        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, _| {
                b.iter(|| {
                    let mut decoder = codec();
                    let mut buffer = BytesMut::from(&encoded[..]);
                    let mut count = 0;
                    while let Ok(Some(_)) = decoder.decode(&mut buffer) {
                        count += 1;
                    }
                    black_box(count);
                });
            },
        );
    }

    group.finish();
}

/// Frames arriving in small TCP segments.
fn bench_decode_partial_streaming(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_partial_streaming");
    group.throughput(Throughput::Elements(1));

    let mut encoded = BytesMut::new();
    codec().encode(create_sam_response(), &mut encoded).unwrap();
    let full_frame = encoded.freeze();

    for chunk_size in [4, 8, 16].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("chunk_{chunk_size}_bytes")),
            chunk_size,
            |b, &size| {
                b.iter(|| {
                    let mut decoder = codec();
                    let mut buffer = BytesMut::new();
                    let mut result = None;
                    for chunk in full_frame.chunks(size) {
                        buffer.extend_from_slice(chunk);
                        if let Ok(Some(frame)) = decoder.decode(&mut buffer) {
                            result = Some(frame);
                            break;
                        }
                    }
                    black_box(result);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_decode_batch,
    bench_decode_partial_streaming,
);

criterion_main!(benches);
