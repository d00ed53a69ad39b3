use std::hint::black_box;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};

use mfp::frame::MAX_ACK_RANGES;
use mfp::range_set::RangeSet;
use mfp::{AckRange, Frame, StreamId};

fn full_frame() -> Frame {
    let ranges = (0..MAX_ACK_RANGES as u64)
        .map(|i| AckRange::new(i * 2400, i * 2400 + 1200))
        .collect();
    Frame::data(0x1234, StreamId(4), 1 << 20, Bytes::from(vec![0xAB; 1200]), false)
        .with_acks(ranges)
}

fn bench_encode(c: &mut Criterion) {
    let frame = full_frame();
    c.bench_function("encode_1200_with_16_acks", |b| {
        b.iter(|| black_box(black_box(&frame).encode()))
    });

    let ack = Frame::ack(0x1234, StreamId(4), vec![AckRange::new(0, 1 << 20)]);
    c.bench_function("encode_pure_ack", |b| b.iter(|| black_box(black_box(&ack).encode())));
}

fn bench_decode(c: &mut Criterion) {
    let bytes = full_frame().encode();
    c.bench_function("decode_1200_with_16_acks", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&bytes))))
    });

    let mut corrupt = bytes.to_vec();
    corrupt[40] ^= 0xFF;
    c.bench_function("decode_checksum_mismatch", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&corrupt))))
    });
}

fn bench_range_set(c: &mut Criterion) {
    // 짝수 블록 먼저, 홀수 블록이 빈틈을 채우는 재조립 패턴
    c.bench_function("range_set_fill_gaps_1024", |b| {
        b.iter(|| {
            let mut set = RangeSet::new();
            for i in (0..1024u64).step_by(2) {
                set.insert(i * 1200, (i + 1) * 1200);
            }
            for i in (1..1024u64).step_by(2) {
                set.insert(i * 1200, (i + 1) * 1200);
            }
            black_box(set.len())
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_range_set);
criterion_main!(benches);
