#![cfg(feature = "rtrb")]

use std::sync::Arc;

use wavesmith::{
    dsp::{
        waveform::{ExpressionError, ExpressionVariables},
        EnvelopeParams, Harmonic,
    },
    engine::{params::OscillatorField, ModSource, ParameterAddress, TickOutcome},
    graph::{DeviceRenderer, SoftwareDevice},
    synth::ExpressionLayer,
    EngineConfig, SynthEngine,
};

const SAMPLE_RATE: f32 = 48_000.0;

fn engine() -> (SynthEngine<SoftwareDevice>, DeviceRenderer) {
    let (device, renderer) = SoftwareDevice::new(SAMPLE_RATE, 4096);
    let mut engine = SynthEngine::with_device(EngineConfig::default(), device);
    engine.set_envelope(EnvelopeParams::adsr(0.01, 0.05, 0.7, 0.1));
    (engine, renderer)
}

fn render(renderer: &mut DeviceRenderer, seconds: f64) -> Vec<f32> {
    let mut out = vec![0.0; (seconds * SAMPLE_RATE as f64) as usize];
    renderer.render(&mut out);
    out
}

fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0, |acc, s| acc.max(s.abs()))
}

fn max_step(samples: &[f32]) -> f32 {
    samples
        .windows(2)
        .fold(0.0, |acc, pair| acc.max((pair[1] - pair[0]).abs()))
}

#[test]
fn silent_until_note_on() {
    let (_engine, mut renderer) = engine();
    let out = render(&mut renderer, 0.05);
    assert!(peak(&out) < 1e-4, "peak {}", peak(&out));
}

#[test]
fn note_renders_bounded_audio() {
    let (mut engine, mut renderer) = engine();
    engine.trigger_note_on();
    let out = render(&mut renderer, 0.2);

    assert!(peak(&out) > 0.05);
    assert!(out.iter().all(|s| s.is_finite() && s.abs() <= 1.0));
}

#[test]
fn release_rings_out_to_silence() {
    let (mut engine, mut renderer) = engine();
    engine.trigger_note_on();
    render(&mut renderer, 0.2);
    engine.trigger_note_off();

    // still sounding right after note off
    let tail = render(&mut renderer, 0.02);
    assert!(peak(&tail) > 0.01);

    let release = engine.max_release_time_ms() as f64 / 1000.0;
    render(&mut renderer, release);
    let after = render(&mut renderer, 0.05);
    assert!(peak(&after) < 1e-3, "peak {}", peak(&after));
}

#[test]
fn waveform_edit_under_held_note_does_not_click() {
    let (mut engine, mut renderer) = engine();
    engine.trigger_note_on();
    let steady = render(&mut renderer, 0.3);
    let steady_step = max_step(&steady[steady.len() / 2..]);

    engine.set_harmonics(&[Harmonic::new(1.0, 0.0), Harmonic::new(0.5, 0.0)]);
    let swap = render(&mut renderer, 0.1);
    engine.tick();

    // a restarted envelope or a hard switch would jump by a large fraction
    // of the sustain level in one sample
    assert!(max_step(&swap) < steady_step * 3.0 + 0.01, "step {}", max_step(&swap));
    assert!(peak(&swap) > 0.05);
    assert_eq!(engine.voices().pending_cleanups(), 0);
}

#[test]
fn retrigger_during_sustain_does_not_click() {
    let (mut engine, mut renderer) = engine();
    engine.trigger_note_on();
    let steady = render(&mut renderer, 0.3);
    let steady_step = max_step(&steady[steady.len() / 2..]);

    engine.trigger_note_on();
    let retriggered = render(&mut renderer, 0.05);

    // dropping to zero before the new attack would step by the sustain level
    assert!(
        max_step(&retriggered) < steady_step * 3.0 + 0.01,
        "step {}",
        max_step(&retriggered)
    );
    assert!(peak(&retriggered[..256]) > 0.05);
}

#[test]
fn toggling_an_oscillator_releases_its_nodes() {
    let (mut engine, _renderer) = engine();
    let baseline = engine.device().unwrap().node_count();

    engine.toggle_oscillator(1, true);
    assert_eq!(engine.device().unwrap().node_count(), baseline + 5);

    engine.toggle_oscillator(1, false);
    assert_eq!(engine.device().unwrap().node_count(), baseline);
}

#[test]
fn rebuild_keeps_node_count_stable() {
    let (mut engine, _renderer) = engine();
    engine.toggle_oscillator(2, true);
    let before = engine.device().unwrap().node_count();

    engine.rebuild_audio_chain();
    engine.rebuild_audio_chain();
    assert_eq!(engine.device().unwrap().node_count(), before);
}

#[test]
fn voice_source_is_read_only_when_routed() {
    let (mut engine, mut renderer) = engine();
    let target = ParameterAddress::oscillator(1, OscillatorField::Volume);
    engine.toggle_oscillator(1, true);
    engine
        .add_route(target, 0, ModSource::Voice(0), 50.0, true)
        .unwrap();
    assert!(engine.active_sources().contains(&ModSource::Voice(0)));

    let mut seen = 0.0f32;
    for _ in 0..20 {
        render(&mut renderer, 0.003);
        assert!(matches!(engine.tick(), TickOutcome::Applied { .. }));
        seen = seen.max(engine.read_source_value(ModSource::Voice(0)).abs());
    }
    assert!(seen > 0.1, "voice source never moved: {seen}");
    // the base value is untouched by modulation
    assert_eq!(engine.voices().slot(1).unwrap().volume(), 0.5);
}

#[test]
fn failing_expression_samples_become_silence() {
    let (mut engine, mut renderer) = engine();
    let sampler = |t: f64, _vars: &ExpressionVariables| {
        if t < 0.5 {
            Ok((std::f64::consts::TAU * t).sin())
        } else {
            Err(ExpressionError::new("domain error"))
        }
    };

    engine.set_harmonics_enabled(false);
    engine.set_expression(Some(ExpressionLayer {
        sampler: Arc::new(sampler),
        valid: true,
        variables: ExpressionVariables::new(8),
    }));

    let cycle = engine.synthesis().current().samples().to_vec();
    assert!(cycle[cycle.len() / 2..].iter().all(|&s| s == 0.0));
    assert!(peak(&cycle) > 0.99);

    engine.trigger_note_on();
    let out = render(&mut renderer, 0.1);
    assert!(out.iter().all(|s| s.is_finite() && s.abs() <= 1.0));
}
