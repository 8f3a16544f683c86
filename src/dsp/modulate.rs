//! Parameter modulation primitives.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/*
Parameter Modulation
====================

Modulation is using one signal to continuously vary a parameter of another.

Vocabulary
----------

  source        The signal doing the controlling: an LFO, the shared
                modulation envelope, or a voice's own output. Always read as
                a value in [-1.0, +1.0].

  amount        Route depth in percent (-100 .. +100).

  bipolar       The route lets the parameter move below AND above the base.

  unipolar      Negative contributions are dropped; the parameter only moves
                in the direction of the amount's sign.

  range         (max - min) of the target parameter. Contributions are
                fractions of the range, so one route at 100% with a source
                at +1 sweeps the whole range.

The Math
--------

    contribution_i = source_i × amount_i / 100        (unipolar: max(0, ·))
    offset         = Σ contribution_i

    linear:       value = clamp(base + offset × (max - min), min, max)

    exponential:  n     = ln(base / min) / ln(max / min)        0 .. 1
                  value = min × (max / min) ^ clamp(n + offset, 0, 1)

The exponential curve moves pitch- and cutoff-like parameters by equal
musical intervals; a +0.1 offset is the same number of octaves whether the
base is 100 Hz or 5 kHz.

Reading Audio-Rate Sources
--------------------------

A voice used as a source produces audio, but the control loop needs ONE value
per tick. Two readings are available:

  FIRST SAMPLE    Cheapest. Ignores movement inside the window, so a fast
                  oscillator can alias into a slow wobble.
  WINDOW AVERAGE  Sum the window and divide. Smooth, but a full period of a
                  symmetric waveform averages toward 0.
*/

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CurveKind {
    #[default]
    Linear,
    Exponential,
}

/// One route's contribution, as a fraction of the target's range.
#[inline]
pub fn route_contribution(source_value: f32, amount_percent: f32, bipolar: bool) -> f32 {
    let contribution = source_value * (amount_percent / 100.0);
    if bipolar {
        contribution
    } else {
        contribution.max(0.0)
    }
}

/// Apply a summed offset (fraction of range) to a base value.
pub fn apply_offset(base: f32, offset: f32, min: f32, max: f32, curve: CurveKind) -> f32 {
    let clamp = |v: f32| v.max(min).min(max);

    match curve {
        CurveKind::Exponential if min > 0.0 && max > min => {
            let ratio = max / min;
            let norm = (clamp(base) / min).ln() / ratio.ln();
            let shifted = (norm + offset).clamp(0.0, 1.0);
            clamp(min * ratio.powf(shifted))
        }
        _ => clamp(base + offset * (max - min)),
    }
}

/// Calculate the average of a modulator signal over a block.
#[inline]
pub fn block_average(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f32>() / samples.len() as f32
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TapReadMode {
    #[default]
    FirstSample,
    WindowAverage,
}

/// Collapse a window of tap samples into one source value in [-1, 1].
pub fn read_window(samples: &[f32], mode: TapReadMode) -> f32 {
    let value = match mode {
        TapReadMode::FirstSample => samples.first().copied().unwrap_or(0.0),
        TapReadMode::WindowAverage => block_average(samples),
    };
    value.clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unipolar_drops_negative_contributions() {
        assert_eq!(route_contribution(-1.0, 100.0, false), 0.0);
        assert_eq!(route_contribution(0.5, 50.0, false), 0.25);
        assert_eq!(route_contribution(-0.5, -100.0, false), 0.5);
    }

    #[test]
    fn bipolar_keeps_sign() {
        assert_eq!(route_contribution(-1.0, 100.0, true), -1.0);
        assert_eq!(route_contribution(0.5, -50.0, true), -0.25);
    }

    #[test]
    fn linear_offset_is_fraction_of_range() {
        assert_eq!(apply_offset(0.5, 0.25, 0.0, 1.0, CurveKind::Linear), 0.75);
        assert_eq!(apply_offset(0.5, 1.0, 0.0, 1.0, CurveKind::Linear), 1.0);
        assert_eq!(apply_offset(0.5, -1.0, 0.0, 1.0, CurveKind::Linear), 0.0);
    }

    #[test]
    fn exponential_offset_moves_in_octaves() {
        // 20 Hz .. 20480 Hz spans 10 octaves; +0.1 is one octave
        let up = apply_offset(1000.0, 0.1, 20.0, 20_480.0, CurveKind::Exponential);
        assert!((up - 2000.0).abs() < 0.5, "got {up}");

        let top = apply_offset(1000.0, 1.0, 20.0, 20_480.0, CurveKind::Exponential);
        assert!((top - 20_480.0).abs() < 0.5);
    }

    #[test]
    fn exponential_falls_back_to_linear_without_positive_range() {
        let v = apply_offset(0.0, 0.5, -1.0, 1.0, CurveKind::Exponential);
        assert_eq!(v, 1.0);
    }

    #[test]
    fn zero_offset_returns_base() {
        assert_eq!(apply_offset(440.0, 0.0, 20.0, 20_000.0, CurveKind::Linear), 440.0);
        let exp = apply_offset(440.0, 0.0, 20.0, 20_000.0, CurveKind::Exponential);
        assert!((exp - 440.0).abs() < 0.01);
    }

    #[test]
    fn window_reading_modes() {
        let window = [0.8, -0.4, 0.2, -0.6];
        assert_eq!(read_window(&window, TapReadMode::FirstSample), 0.8);
        assert!(read_window(&window, TapReadMode::WindowAverage).abs() < 1e-6);
        assert_eq!(read_window(&[], TapReadMode::FirstSample), 0.0);
        assert_eq!(read_window(&[3.0], TapReadMode::FirstSample), 1.0);
    }

    #[test]
    fn test_block_average() {
        assert_eq!(block_average(&[1.0, 1.0, 1.0, 1.0]), 1.0);
        assert_eq!(block_average(&[-1.0, 1.0, -1.0, 1.0]), 0.0);
        assert_eq!(block_average(&[]), 0.0);
    }
}
