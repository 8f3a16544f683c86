//! Benchmarks for the ADSR evaluator and ramp generation.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion};
use wavesmith::dsp::{Envelope, EnvelopeAmount, EnvelopeParams};

use crate::BLOCK_SIZES;

pub fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("dsp/envelope");
    let params = EnvelopeParams::adsr(0.1, 0.1, 0.7, 0.3);
    let dt = 1.0 / 48_000.0;

    // Pull evaluation, one value per sample; the scheduler only needs one
    // per tick, so this is an upper bound
    for &size in BLOCK_SIZES {
        let mut env = Envelope::new(params);
        env.note_on(0.0);
        group.bench_with_input(BenchmarkId::new("attack", size), &size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    black_box(env.value(black_box(i as f64 * dt)));
                }
            })
        });

        let mut env = Envelope::new(params);
        env.note_on(0.0);
        env.value(0.5);
        group.bench_with_input(BenchmarkId::new("sustain", size), &size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    black_box(env.value(black_box(0.5 + i as f64 * dt)));
                }
            })
        });
    }

    // Ramp commands issued at note on / note off / crossfade
    let amount = EnvelopeAmount::from_percent(80.0);
    group.bench_function("ramps_note_on", |b| {
        let mut env = Envelope::new(params);
        b.iter(|| {
            env.note_on(0.0);
            black_box(env.ramps_from(0.0, |l| amount.apply(l)))
        })
    });
    group.bench_function("ramps_note_off", |b| {
        let mut env = Envelope::new(params);
        b.iter(|| {
            env.note_on(0.0);
            env.note_off(0.05);
            black_box(env.ramps_from(0.05, |l| amount.apply(l)))
        })
    });

    group.finish();
}
