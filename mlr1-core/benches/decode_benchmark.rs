//! Benchmarks for APTS and DPTS decoding.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use mlr1_core::dpts::{self, ZeroSuppress};
use mlr1_core::parser::{self, EVENT_TRAILER, FRAME_SIZE, FRAME_TRAILER};
use mlr1_core::types::ChipVariant;
use mlr1_core::AptsDecoder;

const EVENTS: usize = 10_000;
const FRAMES: usize = 200;

/// Builds an APTS stream with pseudo-random frame bits and valid trailers.
fn synthetic_stream() -> Vec<u8> {
    let mut data = Vec::with_capacity(EVENTS * (8 + FRAMES * FRAME_SIZE + 16));
    let mut state = 0x2545_F491_4F6C_DD1Du64;
    for e in 0..EVENTS {
        data.extend_from_slice(&[0xAA; 4]);
        data.extend_from_slice(&((FRAMES * FRAME_SIZE) as u32).to_le_bytes());
        for f in 0..FRAMES {
            for _ in 0..parser::FRAME_BITS_SIZE {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                data.push(state as u8);
            }
            data.extend_from_slice(&[0u8; 6]);
            let trailer = if f + 1 == FRAMES {
                EVENT_TRAILER
            } else {
                FRAME_TRAILER
            };
            data.extend_from_slice(&trailer.to_le_bytes());
        }
        data.extend_from_slice(&[0xBB; 4]);
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&(e as u32).to_le_bytes());
        data.extend_from_slice(&0xAEAE_AE00u32.to_le_bytes());
    }
    data
}

fn decode_apts_benchmark(c: &mut Criterion) {
    let data = synthetic_stream();

    let mut group = c.benchmark_group("decode_apts");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("synthetic_10k_events", |b| {
        b.iter(|| {
            let decoder = AptsDecoder::from_bytes(black_box(data.clone()), ChipVariant::Standard);
            let run = decoder.decode_all().unwrap();
            black_box(run.events.len())
        })
    });

    group.finish();
}

fn zero_suppress_benchmark(c: &mut Criterion) {
    // 1 Msample square-ish wave with a 4 ns period at 50 ps sampling
    let samples = 1_000_000;
    let t: Vec<f64> = (0..samples).map(|i| i as f64 * 50e-12).collect();
    let p: Vec<f64> = t
        .iter()
        .map(|&t| (t * std::f64::consts::TAU / 4e-9).sin() * 0.2)
        .collect();
    let n = vec![0.0; samples];

    let mut group = c.benchmark_group("dpts");
    group.throughput(Throughput::Elements(samples as u64));

    group.bench_function("zero_suppress_1m_samples", |b| {
        b.iter(|| {
            let set = dpts::decode(black_box(&t), &p, &n, &ZeroSuppress::default()).unwrap();
            black_box(set.trains.len())
        })
    });

    group.finish();
}

criterion_group!(benches, decode_apts_benchmark, zero_suppress_benchmark);
criterion_main!(benches);
