use std::f64::consts::{FRAC_PI_2, PI, TAU};

use rustfft::{num_complex::Complex, FftPlanner};

use crate::dsp::waveform::Harmonic;

/*
Harmonic Analysis
=================

The inverse of additive synthesis: given one period of an arbitrary waveform,
recover the amplitude and phase of harmonics 1..n. This is what keeps the
harmonic-slider view and the free-form expression view consistent when the
user switches between them.

Because the buffer holds exactly one period, harmonic k lands exactly on DFT
bin k, with no leakage and no windowing needed:

    X[k] = Σ x[i] · e^(-2πi·k·i/N)

For a single partial  x = a·sin(2πkt + φ):

    a·sin(θ + φ) = a·(e^(i(θ+φ)) - e^(-i(θ+φ))) / 2i

so bin k holds  X[k] = (N·a/2) · e^(i(φ - π/2)), giving

    amplitude = 2·|X[k]| / N
    phase     = arg(X[k]) + π/2

Bins at or above Nyquist (k ≥ N/2) cannot represent a harmonic and come back
silent. The DC term (bin 0) is not a harmonic and is ignored.
*/

const SILENT_AMPLITUDE: f64 = 1e-9;

/// FFT-backed harmonic extractor. Keeps its planner and scratch space so
/// repeated analysis of same-length buffers doesn't re-plan or reallocate.
pub struct HarmonicAnalyzer {
    planner: FftPlanner<f64>,
    spectrum: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl HarmonicAnalyzer {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            spectrum: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Amplitude and phase of harmonics 1..=n of a one-period buffer.
    pub fn extract_harmonics(&mut self, samples: &[f32], n: usize) -> Vec<Harmonic> {
        let len = samples.len();
        if len == 0 {
            return vec![Harmonic::default(); n];
        }

        let fft = self.planner.plan_fft_forward(len);

        self.spectrum.clear();
        self.spectrum
            .extend(samples.iter().map(|&s| Complex::new(s as f64, 0.0)));
        self.scratch
            .resize(fft.get_inplace_scratch_len(), Complex::default());
        fft.process_with_scratch(&mut self.spectrum, &mut self.scratch);

        (1..=n)
            .map(|k| {
                if 2 * k >= len {
                    return Harmonic::default();
                }

                let bin = self.spectrum[k];
                let amplitude = 2.0 * bin.norm() / len as f64;
                if amplitude < SILENT_AMPLITUDE {
                    return Harmonic::default();
                }

                let phase = wrap_phase(bin.arg() + FRAC_PI_2);
                Harmonic::new(amplitude as f32, phase as f32)
            })
            .collect()
    }
}

impl Default for HarmonicAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot convenience wrapper around [`HarmonicAnalyzer`].
pub fn extract_harmonics(samples: &[f32], n: usize) -> Vec<Harmonic> {
    HarmonicAnalyzer::new().extract_harmonics(samples, n)
}

/// Wrap an angle into (-π, π].
fn wrap_phase(phase: f64) -> f64 {
    let wrapped = (phase + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

/// Pearson correlation coefficient of two equal-length signals.
///
/// Returns 0.0 when either signal has no variance.
pub fn correlation(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    if len == 0 {
        return 0.0;
    }

    let mean_a = a[..len].iter().map(|&x| x as f64).sum::<f64>() / len as f64;
    let mean_b = b[..len].iter().map(|&x| x as f64).sum::<f64>() / len as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a[..len].iter().zip(&b[..len]) {
        let dx = x as f64 - mean_a;
        let dy = y as f64 - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return 0.0;
    }

    (cov / (var_a.sqrt() * var_b.sqrt())) as f32
}
