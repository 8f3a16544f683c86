//! Benchmarks for the signal math in `wavesmith::dsp`.

mod envelope;
mod filter;
mod waveform;

pub use envelope::bench_envelope;
pub use filter::bench_filter;
pub use waveform::bench_waveform;
