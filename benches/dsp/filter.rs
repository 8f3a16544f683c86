//! Benchmarks for the low-pass stages of the output cascade.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion};
use wavesmith::dsp::filter::{stage_qs, SVFilter, STAGE_COUNT};

use crate::BLOCK_SIZES;

pub fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("dsp/filter");
    let sample_rate = 48_000.0;

    for &size in BLOCK_SIZES {
        // Generate a test signal (sawtooth-like ramp)
        let input: Vec<f32> = (0..size)
            .map(|i| (i as f32 / size as f32) * 2.0 - 1.0)
            .collect();

        let mut filter = SVFilter::lowpass(1000.0, 0.7);
        let mut buffer = input.clone();
        group.bench_with_input(BenchmarkId::new("stage", size), &size, |b, _| {
            b.iter(|| {
                buffer.copy_from_slice(&input);
                filter.render(black_box(&mut buffer), black_box(sample_rate));
            })
        });

        // The full ladder at high resonance
        let mut ladder: Vec<SVFilter> = stage_qs(20.0)
            .into_iter()
            .map(|q| SVFilter::lowpass(1000.0, q))
            .collect();
        assert_eq!(ladder.len(), STAGE_COUNT);
        group.bench_with_input(BenchmarkId::new("ladder", size), &size, |b, _| {
            b.iter(|| {
                buffer.copy_from_slice(&input);
                for stage in ladder.iter_mut() {
                    stage.render(black_box(&mut buffer), black_box(sample_rate));
                }
            })
        });
    }

    group.finish();
}
