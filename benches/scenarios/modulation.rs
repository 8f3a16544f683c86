//! Benchmarks for the control-rate tick.
//!
//! The budget is 10ms per tick; these should land orders of magnitude below.

use criterion::Criterion;
use wavesmith::{
    engine::{
        params::{FilterField, OscillatorField},
        ModSource, ParameterAddress,
    },
    graph::SoftwareDevice,
    EngineConfig, SynthEngine, OSCILLATOR_COUNT,
};

fn engine() -> (SynthEngine<SoftwareDevice>, wavesmith::graph::DeviceRenderer) {
    let (device, renderer) = SoftwareDevice::new(48_000.0, 1 << 16);
    let mut engine = SynthEngine::with_device(EngineConfig::default(), device);
    for slot in 1..OSCILLATOR_COUNT {
        engine.toggle_oscillator(slot, true);
    }
    engine.toggle_lfo(0, true);
    engine.toggle_lfo(1, true);
    engine.trigger_note_on();
    (engine, renderer)
}

pub fn bench_modulation(c: &mut Criterion) {
    let mut group = c.benchmark_group("scenarios/modulation");
    let cutoff = ParameterAddress::Filter(FilterField::Cutoff);
    let mut block = vec![0.0f32; 480];

    // Nothing routed: the tick should be close to free
    let (mut engine, mut renderer) = engine();
    group.bench_function("idle", |b| {
        b.iter(|| {
            renderer.render(&mut block);
            engine.tick()
        })
    });

    // Two LFOs on the filter
    let (mut engine, mut renderer) = engine();
    engine.add_route(cutoff, 0, ModSource::Lfo(0), 30.0, true).ok();
    engine.add_route(cutoff, 1, ModSource::Lfo(1), 10.0, true).ok();
    group.bench_function("lfo_cutoff", |b| {
        b.iter(|| {
            renderer.render(&mut block);
            engine.tick()
        })
    });

    // Every voice read as a source, every oscillator volume routed
    let (mut engine, mut renderer) = engine();
    for slot in 0..OSCILLATOR_COUNT {
        let target = ParameterAddress::oscillator(slot, OscillatorField::Volume);
        let source = ModSource::Voice((slot + 1) % OSCILLATOR_COUNT);
        engine.add_route(target, 0, source, 20.0, true).ok();
        engine.add_route(target, 1, ModSource::ModEnvelope, 20.0, false).ok();
    }
    group.bench_function("voice_sources", |b| {
        b.iter(|| {
            renderer.render(&mut block);
            engine.tick()
        })
    });

    group.finish();
}
