//! Chunk Codec Benchmarks
//!
//! Measures encode/decode throughput for both chunk layouts:
//!
//! - `simple_encode` / `simple_decode`: the length-prefixed layout at
//!   several record counts, with and without compression
//! - `transposed_encode` / `transposed_decode`: the columnar layout over
//!   uniform wire-format records
//! - `transposed_projected_decode`: selective decoding, which should
//!   beat the full decode by skipping whole columns
//!
//! ```bash
//! cargo bench -p baler-chunk
//! cargo bench -p baler-chunk -- --save-baseline main
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use baler_chunk::{
    Chunk, ChunkDecoder, CompressionKind, EncoderOptions, FieldPath, FieldProjection,
    SimpleEncoder, TransposeEncoder,
};

/// A wire-format record: {1: counter, 2: short string, 3: counter}.
fn wire_record(index: u64) -> Bytes {
    let mut record = BytesMut::new();
    record.put_u8(0x08);
    baler_core::varint::encode_varint_u64(&mut record, index);
    let text = format!("value-{:06}", index);
    record.put_u8(0x12);
    record.put_u8(text.len() as u8);
    record.put_slice(text.as_bytes());
    record.put_u8(0x18);
    baler_core::varint::encode_varint_u64(&mut record, index % 97);
    record.freeze()
}

fn simple_chunk(count: u64, compression: CompressionKind) -> Chunk {
    let mut encoder = SimpleEncoder::new(EncoderOptions {
        compression,
        ..Default::default()
    });
    for i in 0..count {
        encoder.add_record(wire_record(i)).unwrap();
    }
    encoder.encode().unwrap()
}

fn transposed_chunk(count: u64, compression: CompressionKind) -> Chunk {
    let mut encoder = TransposeEncoder::new(EncoderOptions {
        compression,
        ..Default::default()
    });
    for i in 0..count {
        encoder.add_record(wire_record(i)).unwrap();
    }
    encoder.encode().unwrap()
}

fn decode_all(chunk: &Chunk, projection: FieldProjection) -> u64 {
    let mut decoder = ChunkDecoder::new(projection);
    assert!(decoder.reset(chunk));
    let mut out = Bytes::new();
    let mut total = 0u64;
    while decoder.read_record(&mut out) {
        total += out.len() as u64;
    }
    assert!(decoder.healthy());
    total
}

fn bench_simple(c: &mut Criterion) {
    let mut group = c.benchmark_group("simple_decode");
    for &count in &[100u64, 1_000, 10_000] {
        for compression in [CompressionKind::None, CompressionKind::Zstd] {
            let chunk = simple_chunk(count, compression);
            group.throughput(Throughput::Elements(count));
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", compression), count),
                &chunk,
                |b, chunk| b.iter(|| black_box(decode_all(chunk, FieldProjection::all()))),
            );
        }
    }
    group.finish();
}

fn bench_transposed(c: &mut Criterion) {
    let mut group = c.benchmark_group("transposed_decode");
    for &count in &[100u64, 1_000, 10_000] {
        let chunk = transposed_chunk(count, CompressionKind::Zstd);
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("full", count), &chunk, |b, chunk| {
            b.iter(|| black_box(decode_all(chunk, FieldProjection::all())))
        });
        group.bench_with_input(BenchmarkId::new("projected", count), &chunk, |b, chunk| {
            b.iter(|| {
                black_box(decode_all(
                    chunk,
                    FieldProjection::new([FieldPath::from([1])]),
                ))
            })
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let count = 1_000u64;
    group.throughput(Throughput::Elements(count));
    group.bench_function("simple_zstd", |b| {
        b.iter(|| black_box(simple_chunk(count, CompressionKind::Zstd)))
    });
    group.bench_function("transposed_zstd", |b| {
        b.iter(|| black_box(transposed_chunk(count, CompressionKind::Zstd)))
    });
    group.finish();
}

criterion_group!(benches, bench_simple, bench_transposed, bench_encode);
criterion_main!(benches);
