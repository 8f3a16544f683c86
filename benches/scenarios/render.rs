//! Benchmarks for the render path of the software device.
//!
//! Measures what the audio callback pays for the voice graph: playback,
//! gain ramps, taps and the four-stage filter cascade.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion};
use wavesmith::{dsp::Harmonic, graph::SoftwareDevice, EngineConfig, SynthEngine, OSCILLATOR_COUNT};

use crate::BLOCK_SIZES;

pub fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("scenarios/render");
    let saw: Vec<Harmonic> = (1..=8).map(|k| Harmonic::new(1.0 / k as f32, 0.0)).collect();

    for &size in BLOCK_SIZES {
        let mut buffer = vec![0.0f32; size];

        // One voice, sustaining
        let (device, mut renderer) = SoftwareDevice::new(48_000.0, 4096);
        let mut engine = SynthEngine::with_device(EngineConfig::default(), device);
        engine.trigger_note_on();
        group.bench_with_input(BenchmarkId::new("one_voice", size), &size, |b, _| {
            b.iter(|| renderer.render(black_box(&mut buffer)))
        });

        // Every slot active
        let (device, mut renderer) = SoftwareDevice::new(48_000.0, 4096);
        let mut engine = SynthEngine::with_device(EngineConfig::default(), device);
        for slot in 1..OSCILLATOR_COUNT {
            engine.toggle_oscillator(slot, true);
            engine.update_oscillator_detune(slot, slot as f32 * 5.0);
        }
        engine.set_harmonics(&saw);
        engine.trigger_note_on();
        group.bench_with_input(BenchmarkId::new("four_voices", size), &size, |b, _| {
            b.iter(|| renderer.render(black_box(&mut buffer)))
        });

        // Mid-crossfade: each slot temporarily runs two chains
        let (device, mut renderer) = SoftwareDevice::new(48_000.0, 4096);
        let mut engine = SynthEngine::with_device(EngineConfig::default(), device);
        for slot in 1..OSCILLATOR_COUNT {
            engine.toggle_oscillator(slot, true);
        }
        engine.trigger_note_on();
        engine.set_harmonics(&saw);
        group.bench_with_input(BenchmarkId::new("crossfading", size), &size, |b, _| {
            b.iter(|| renderer.render(black_box(&mut buffer)))
        });
    }

    group.finish();
}
