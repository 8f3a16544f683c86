//! Benchmarks for one-cycle synthesis and harmonic analysis.
//!
//! Both run on the control thread whenever the user edits the waveform.

use std::hint::black_box;

use criterion::Criterion;
use wavesmith::dsp::{
    analysis::HarmonicAnalyzer,
    waveform::{
        combine_layers, synthesize_from_expression, synthesize_from_harmonics,
        ExpressionError, ExpressionFailurePolicy, ExpressionVariables,
    },
    Harmonic,
};
use wavesmith::{HARMONIC_COUNT, WAVEFORM_LEN};

pub fn bench_waveform(c: &mut Criterion) {
    let mut group = c.benchmark_group("dsp/waveform");

    let saw: Vec<Harmonic> = (1..=HARMONIC_COUNT)
        .map(|k| Harmonic::new(1.0 / k as f32, 0.0))
        .collect();

    group.bench_function("harmonics", |b| {
        b.iter(|| synthesize_from_harmonics(black_box(&saw)))
    });

    let vars = ExpressionVariables::new(HARMONIC_COUNT);
    let sampler = |t: f64, vars: &ExpressionVariables| {
        let n = vars.harmonic_count;
        let value = (1..=n)
            .map(|k| (std::f64::consts::TAU * k as f64 * t).sin() / k as f64)
            .sum::<f64>();
        Ok::<f64, ExpressionError>(value)
    };
    group.bench_function("expression", |b| {
        b.iter(|| {
            synthesize_from_expression(
                black_box(&sampler),
                &vars,
                WAVEFORM_LEN,
                ExpressionFailurePolicy::ZeroSample,
            )
        })
    });

    // Harmonic view + expression view, normalized
    let harmonic = synthesize_from_harmonics(&saw);
    let expression = synthesize_from_harmonics(&saw[..3]);
    group.bench_function("combine", |b| {
        b.iter(|| combine_layers(black_box(&[harmonic.samples(), expression.samples()])))
    });

    let mut analyzer = HarmonicAnalyzer::new();
    group.bench_function("analyze", |b| {
        b.iter(|| analyzer.extract_harmonics(black_box(harmonic.samples()), HARMONIC_COUNT))
    });

    group.finish();
}
