//! Pure signal math used by the voice layer and the control-rate core.
//!
//! Nothing in here touches the output device. Waveform synthesis and analysis
//! run on the control thread over a fixed number of samples; envelopes and
//! LFOs are evaluated from absolute time; the filter stage is the one piece
//! the render path runs per sample.

/// Harmonic extraction from one-period buffers (FFT based).
pub mod analysis;
/// ADSR evaluator and ramp generator.
pub mod envelope;
/// State-variable low-pass stage and ladder cascade Q mapping.
pub mod filter;
/// Low frequency oscillators for parameter modulation.
pub mod lfo;
/// Route contribution, range mapping and tap reading.
pub mod modulate;
/// Single-cycle synthesis from harmonics or compiled expressions.
pub mod waveform;

pub use envelope::{Envelope, EnvelopeAmount, EnvelopeParams, EnvelopeStage};
pub use waveform::{Harmonic, WaveformBuffer};
