pub mod dsp; // Pure signal math: waveform synthesis, analysis, envelopes, LFOs, filters
pub mod engine; // Control-rate core: parameter registry, modulation matrix, scheduler
pub mod error;
pub mod graph; // Abstract output device and the software reference device
pub mod synth; // Oscillator slots, voice chains, waveform state

pub use engine::{EngineConfig, SynthEngine};
pub use error::EngineError;

/// Largest block the render path processes in one pass.
pub const MAX_BLOCK_SIZE: usize = 2048;
/// Number of samples in one synthesized waveform cycle.
pub const WAVEFORM_LEN: usize = 2048;
/// Number of oscillator slots (voices) in the engine.
pub const OSCILLATOR_COUNT: usize = 4;
/// Number of harmonics exposed by the harmonic editing view.
pub const HARMONIC_COUNT: usize = 8;
pub(crate) const MIN_TIME: f32 = 1.0 / 48_000.0;
