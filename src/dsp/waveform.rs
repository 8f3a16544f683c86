use std::{collections::BTreeMap, f64::consts::TAU, fmt, sync::Arc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{error::EngineError, WAVEFORM_LEN};

/*
Single-Cycle Waveforms
======================

Every voice in the engine loops one period of a waveform. That period lives in
a fixed-length buffer (2048 samples) where sample `i` sits at normalized time
t = i / 2048, so t runs over [0, 1) and the buffer never contains the start of
the next period.

Two ways to fill it:

  harmonics     Additive synthesis. Each harmonic k (1..8) contributes
                  amplitude_k * sin(2π·k·t + phase_k)
                The sum of a few of these gives classic timbres:
                  1, 1/2, 1/3, 1/4 ...   → sawtooth-ish
                  1, 0, 1/3, 0, 1/5 ...  → square-ish

  expression    A compiled sampler function f(t) produced by the expression
                front end. We call it once per output sample.

When both layers are active they are summed sample by sample. The sum can
easily exceed [-1, 1] (eight harmonics at full amplitude peak near 8.0), so
the combined cycle is divided by its peak before it reaches any gain or
filter stage:

    peak = max |x[i]|
    if peak > ε:  x[i] = x[i] / peak

Buffers are immutable once built. Editing the waveform always produces a new
buffer that replaces the old one wholesale; voices crossfade between them.
*/

const NORMALIZE_EPSILON: f32 = 1e-6;

/// One additive partial: amplitude and phase (radians) of harmonic k.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Harmonic {
    pub amplitude: f32,
    pub phase: f32,
}

impl Harmonic {
    pub fn new(amplitude: f32, phase: f32) -> Self {
        Self { amplitude, phase }
    }
}

/// One normalized period of a waveform, shared between the control thread and
/// the render path.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformBuffer {
    samples: Arc<[f32]>,
}

impl WaveformBuffer {
    pub fn silence() -> Self {
        Self::from(vec![0.0; WAVEFORM_LEN])
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn peak(&self) -> f32 {
        peak(&self.samples)
    }

    /// Cheap handle to the underlying samples (no copy).
    pub fn shared(&self) -> Arc<[f32]> {
        Arc::clone(&self.samples)
    }
}

impl From<Vec<f32>> for WaveformBuffer {
    fn from(samples: Vec<f32>) -> Self {
        Self {
            samples: samples.into(),
        }
    }
}

/// Additive synthesis of one cycle. Harmonic `k` of the slice (0-based) is
/// partial number `k + 1`. The result is NOT normalized.
pub fn synthesize_from_harmonics(harmonics: &[Harmonic]) -> WaveformBuffer {
    let samples = (0..WAVEFORM_LEN)
        .map(|i| {
            let t = i as f64 / WAVEFORM_LEN as f64;
            harmonics
                .iter()
                .enumerate()
                .map(|(k, h)| {
                    let partial = (k + 1) as f64;
                    h.amplitude as f64 * (TAU * partial * t + h.phase as f64).sin()
                })
                .sum::<f64>() as f32
        })
        .collect::<Vec<_>>();

    WaveformBuffer::from(samples)
}

/// Error raised by a compiled expression for a single sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionError {
    message: String,
}

impl ExpressionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExpressionError {}

/// Variables visible to a compiled expression.
///
/// `harmonic_count` lets expressions that sum partials internally
/// (e.g. `sum(k, 1, n, sin(2πkt)/k)`) follow the harmonic view's size.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExpressionVariables {
    pub harmonic_count: usize,
    pub values: BTreeMap<String, f64>,
}

impl ExpressionVariables {
    pub fn new(harmonic_count: usize) -> Self {
        Self {
            harmonic_count,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

/// A compiled expression: maps normalized time t ∈ [0, 1) to a sample value.
///
/// The expression parser lives outside this crate; anything that can be
/// called like `f(t, vars)` can act as a sampler.
pub trait WaveSampler: Send + Sync {
    fn sample(&self, t: f64, vars: &ExpressionVariables) -> Result<f64, ExpressionError>;
}

impl<F> WaveSampler for F
where
    F: Fn(f64, &ExpressionVariables) -> Result<f64, ExpressionError> + Send + Sync,
{
    fn sample(&self, t: f64, vars: &ExpressionVariables) -> Result<f64, ExpressionError> {
        self(t, vars)
    }
}

/// What to do when a single expression sample fails.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpressionFailurePolicy {
    /// Replace the failing sample with 0 and keep going.
    #[default]
    ZeroSample,
    /// Reject the whole buffer on the first failure.
    AbortBuffer,
}

/// Sample a compiled expression over t ∈ [0, 1), once per output sample.
///
/// Non-finite results count as failures.
pub fn synthesize_from_expression(
    sampler: &dyn WaveSampler,
    vars: &ExpressionVariables,
    sample_count: usize,
    policy: ExpressionFailurePolicy,
) -> Result<Vec<f32>, EngineError> {
    let mut out = Vec::with_capacity(sample_count);
    let mut failures = 0usize;
    let mut first_failure: Option<(usize, ExpressionError)> = None;

    for i in 0..sample_count {
        let t = i as f64 / sample_count as f64;
        let result = sampler.sample(t, vars).and_then(|value| {
            if value.is_finite() {
                Ok(value)
            } else {
                Err(ExpressionError::new(format!("non-finite value {value}")))
            }
        });

        match result {
            Ok(value) => out.push(value as f32),
            Err(err) => match policy {
                ExpressionFailurePolicy::AbortBuffer => {
                    return Err(EngineError::ExpressionEvaluation {
                        index: i,
                        message: err.to_string(),
                    });
                }
                ExpressionFailurePolicy::ZeroSample => {
                    failures += 1;
                    if first_failure.is_none() {
                        first_failure = Some((i, err));
                    }
                    out.push(0.0);
                }
            },
        }
    }

    if let Some((index, err)) = first_failure {
        warn!(
            failures,
            first_index = index,
            error = %err,
            "expression evaluation failed; substituted silence"
        );
    }

    Ok(out)
}

/// Peak absolute sample value.
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()))
}

/// Scale so the peak sits at exactly 1.0. Near-silent buffers are left alone.
pub fn normalize(samples: &mut [f32]) {
    let peak = peak(samples);
    if peak > NORMALIZE_EPSILON {
        for sample in samples.iter_mut() {
            *sample /= peak;
        }
    }
}

/// Sum layers sample-wise, then normalize the result.
///
/// Layers shorter than the longest one contribute silence past their end.
/// With no layers the result is one cycle of silence.
pub fn combine_layers(layers: &[&[f32]]) -> WaveformBuffer {
    let len = layers.iter().map(|l| l.len()).max().unwrap_or(0);
    if len == 0 {
        return WaveformBuffer::silence();
    }

    let mut mixed = vec![0.0f32; len];
    for layer in layers {
        for (o, s) in mixed.iter_mut().zip(layer.iter()) {
            *o += s;
        }
    }

    normalize(&mut mixed);
    WaveformBuffer::from(mixed)
}
