//! Low Frequency Oscillators used as modulation sources.

use std::f32::consts::TAU;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/*
Low Frequency Oscillators
=========================

An LFO is an oscillator running at sub-audio rates (~0.01 Hz to ~20 Hz). It
never reaches the speakers; the modulation matrix samples it once per control
tick and uses the value to push parameters around.

  bipolar     Output swings -1.0 to +1.0. Every LFO here is bipolar.
  unipolar    0.0 to 1.0. Envelopes are unipolar and get rescaled:
                bipolar = unipolar * 2 - 1

Shapes
------

    sine       smooth sweep
    triangle   constant rate of change
    sawtooth   rise then snap back (╱╱╱╱)
    square     hard switch between -1 and +1

Phase
-----

The control loop doesn't run at a fixed rate, so an LFO is evaluated from
absolute time instead of being stepped:

    phase(t) = phase₀ + f · (t - t₀)      (wrapped to [0, 1))

Changing the rate re-anchors (t₀, phase₀) at the current phase, so a rate
change never makes the output jump. A disabled LFO reads as 0.
*/

/// Convert bipolar signal (-1.0 to +1.0) to unipolar (0.0 to 1.0).
#[inline]
pub fn bipolar_to_unipolar(bipolar: f32) -> f32 {
    (bipolar + 1.0) * 0.5
}

/// Convert unipolar signal (0.0 to 1.0) to bipolar (-1.0 to +1.0).
///
/// Useful when you have a 0-1 source but need symmetric modulation.
#[inline]
pub fn unipolar_to_bipolar(unipolar: f32) -> f32 {
    (unipolar * 2.0) - 1.0
}

pub const MIN_LFO_HZ: f32 = 0.01;
pub const MAX_LFO_HZ: f32 = 20.0;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LfoWaveform {
    #[default]
    Sine,
    Triangle,
    Sawtooth,
    Square,
}

impl LfoWaveform {
    /// Bipolar value at phase ∈ [0, 1).
    pub fn value_at_phase(self, phase: f32) -> f32 {
        match self {
            LfoWaveform::Sine => (TAU * phase).sin(),
            LfoWaveform::Triangle => {
                // 0 → 1 → 0 → -1 → 0 over one period, in phase with the sine
                if phase < 0.25 {
                    4.0 * phase
                } else if phase < 0.75 {
                    2.0 - 4.0 * phase
                } else {
                    4.0 * phase - 4.0
                }
            }
            LfoWaveform::Sawtooth => 2.0 * phase - 1.0,
            LfoWaveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Lfo {
    waveform: LfoWaveform,
    frequency: f32,
    enabled: bool,
    anchor_time: f64,
    anchor_phase: f64,
}

impl Lfo {
    pub fn new(waveform: LfoWaveform, frequency: f32) -> Self {
        Self {
            waveform,
            frequency: frequency.clamp(MIN_LFO_HZ, MAX_LFO_HZ),
            enabled: false,
            anchor_time: 0.0,
            anchor_phase: 0.0,
        }
    }

    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    pub fn waveform(&self) -> LfoWaveform {
        self.waveform
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Phase in [0, 1) at time `now`.
    pub fn phase_at(&self, now: f64) -> f32 {
        let phase = self.anchor_phase + self.frequency as f64 * (now - self.anchor_time);
        phase.rem_euclid(1.0) as f32
    }

    /// Change the rate without a discontinuity at `now`.
    pub fn set_frequency(&mut self, frequency: f32, now: f64) {
        self.anchor_phase = self.phase_at(now) as f64;
        self.anchor_time = now;
        self.frequency = frequency.clamp(MIN_LFO_HZ, MAX_LFO_HZ);
    }

    pub fn set_waveform(&mut self, waveform: LfoWaveform) {
        self.waveform = waveform;
    }

    /// Enabling restarts the cycle at `now`.
    pub fn set_enabled(&mut self, enabled: bool, now: f64) {
        if enabled && !self.enabled {
            self.anchor_time = now;
            self.anchor_phase = 0.0;
        }
        self.enabled = enabled;
    }

    /// Bipolar output at `now`; 0.0 while disabled.
    pub fn value(&self, now: f64) -> f32 {
        if !self.enabled {
            return 0.0;
        }
        self.waveform.value_at_phase(self.phase_at(now))
    }
}

impl Default for Lfo {
    fn default() -> Self {
        Self::new(LfoWaveform::Sine, 1.0)
    }
}
