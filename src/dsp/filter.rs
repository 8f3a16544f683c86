use std::f32::consts::TAU;

/*
Ladder-Style Low-Pass Cascade
=============================

One 2-pole low-pass rolls off at 12 dB/octave. Chaining four of them, all
sharing one cutoff, gives a much steeper slope closer to a classic ladder
filter. Each stage is a state-variable filter built with the TPT
(topology-preserving transform), which stays stable while the cutoff moves.

Resonance (0-20 in the editor) maps onto a base Q:

    baseQ = 0.5 + (resonance / 20) · 3.5          0.5 .. 4.0

and each stage gets a fixed fraction of it:

    stage     1      2      3      4
    ratio     0.70   0.85   1.00   1.15

Q rises strictly from the first stage to the last. Putting the most resonant
stage at the END of the chain keeps the early stages from ringing up and
self-oscillating before the later ones can tame them.

    resonance = 0   →  Q = [0.35, 0.425, 0.5, 0.575]
    resonance = 20  →  Q = [2.8,  3.4,   4.0, 4.6  ]

SVF damping is k = 1 / Q, so a low Q is a gentle roll-off and a high Q peaks
at the cutoff.
*/

pub const MIN_CUTOFF_HZ: f32 = 20.0;
pub const MAX_CUTOFF_HZ: f32 = 20_000.0;
pub const MAX_RESONANCE: f32 = 20.0;
pub const STAGE_COUNT: usize = 4;
pub const STAGE_Q_RATIOS: [f32; STAGE_COUNT] = [0.7, 0.85, 1.0, 1.15];

/// Base Q for an editor resonance in [0, 20].
pub fn base_q(resonance: f32) -> f32 {
    0.5 + (resonance.clamp(0.0, MAX_RESONANCE) / MAX_RESONANCE) * 3.5
}

/// Per-stage Q values for the cascade, strictly increasing.
pub fn stage_qs(resonance: f32) -> [f32; STAGE_COUNT] {
    let q = base_q(resonance);
    STAGE_Q_RATIOS.map(|ratio| q * ratio)
}

pub fn clamp_cutoff(cutoff_hz: f32) -> f32 {
    cutoff_hz.clamp(MIN_CUTOFF_HZ, MAX_CUTOFF_HZ)
}

/// One TPT state-variable low-pass stage.
pub struct SVFilter {
    ic1eq: f32, // First integrator's memory
    ic2eq: f32, // Second integrator's memory

    pub cutoff_hz: f32,
    pub q: f32,
}

impl SVFilter {
    pub fn lowpass(cutoff_hz: f32, q: f32) -> Self {
        Self {
            ic1eq: 0.0,
            ic2eq: 0.0,
            cutoff_hz,
            q,
        }
    }

    #[inline]
    fn compute_g(&self, sample_rate: f32) -> f32 {
        // Keep the prewarp below Nyquist; tan() blows up at fs/2
        let cutoff = self.cutoff_hz.clamp(MIN_CUTOFF_HZ, sample_rate * 0.49);
        let wd = TAU * cutoff;
        let wa = (2.0 * sample_rate) * (wd / (2.0 * sample_rate)).tan();
        wa / (2.0 * sample_rate)
    }

    #[inline]
    pub fn next_sample(&mut self, sample: f32, k: f32, g: f32) -> f32 {
        let h = 1.0 / (1.0 + g * (g + k));
        let v3 = sample - self.ic2eq;
        let v1 = h * (self.ic1eq + g * v3);
        let v2 = self.ic2eq + g * v1;

        self.ic1eq = 2.0 * v1 - self.ic1eq;
        self.ic2eq = 2.0 * v2 - self.ic2eq;

        v2
    }

    /// Filter a block in place. Coefficients are computed once per block.
    pub fn render(&mut self, buffer: &mut [f32], sample_rate: f32) {
        let g = self.compute_g(sample_rate);
        let k = 1.0 / self.q.max(0.05);

        for sample in buffer.iter_mut() {
            *sample = self.next_sample(*sample, k, g);
        }
    }

    pub fn reset(&mut self) {
        self.ic1eq = 0.0;
        self.ic2eq = 0.0;
    }

    pub fn set_cutoff(&mut self, cutoff: f32) {
        self.cutoff_hz = cutoff;
    }

    pub fn set_q(&mut self, q: f32) {
        self.q = q;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: f32 = 48_000.0;

    fn sine(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (TAU * freq * i as f32 / SAMPLE_RATE).sin())
            .collect()
    }

    fn peak_after_transient(buffer: &[f32]) -> f32 {
        let skip = buffer.len() / 2;
        buffer[skip..].iter().fold(0.0f32, |acc, &x| acc.max(x.abs()))
    }

    #[test]
    fn stage_q_at_zero_resonance() {
        let qs = stage_qs(0.0);
        let expected = [0.35, 0.425, 0.5, 0.575];
        for (q, e) in qs.iter().zip(expected) {
            assert!((q - e).abs() < 1e-6, "got {qs:?}");
        }
    }

    #[test]
    fn stage_q_at_full_resonance() {
        assert!((base_q(20.0) - 4.0).abs() < 1e-6);
        let qs = stage_qs(20.0);
        let expected = [2.8, 3.4, 4.0, 4.6];
        for (q, e) in qs.iter().zip(expected) {
            assert!((q - e).abs() < 1e-5, "got {qs:?}");
        }
    }

    #[test]
    fn stage_q_strictly_increases() {
        for resonance in [0.0, 3.0, 10.0, 20.0, 35.0] {
            let qs = stage_qs(resonance);
            assert!(qs.windows(2).all(|w| w[0] < w[1]), "got {qs:?}");
        }
    }

    #[test]
    fn lowpass_passes_dc() {
        let mut filter = SVFilter::lowpass(500.0, 0.707);
        let mut buffer = vec![1.0; 4096];
        filter.render(&mut buffer, SAMPLE_RATE);
        assert!(buffer[4095] > 0.99);
    }

    #[test]
    fn lowpass_filters_high_freq() {
        let mut filter = SVFilter::lowpass(500.0, 0.707);
        let mut buffer = sine(5_000.0, 2048);
        filter.render(&mut buffer, SAMPLE_RATE);

        // 12 dB/octave, ~3.3 octaves above cutoff
        let peak = peak_after_transient(&buffer);
        assert!(peak < 0.05, "Expected high freq attenuation, got peak: {peak}");
    }

    #[test]
    fn higher_q_boosts_cutoff_frequency() {
        let mut gentle = SVFilter::lowpass(1_000.0, 0.5);
        let mut resonant = SVFilter::lowpass(1_000.0, 4.0);

        let mut a = sine(1_000.0, 4096);
        let mut b = a.clone();
        gentle.render(&mut a, SAMPLE_RATE);
        resonant.render(&mut b, SAMPLE_RATE);

        let peak_gentle = peak_after_transient(&a);
        let peak_resonant = peak_after_transient(&b);
        assert!(
            peak_resonant > peak_gentle * 2.0,
            "resonant={peak_resonant}, gentle={peak_gentle}"
        );
    }

    #[test]
    fn extreme_cutoff_stays_finite() {
        let mut filter = SVFilter::lowpass(100_000.0, 4.6);
        let mut buffer = sine(440.0, 1024);
        filter.render(&mut buffer, SAMPLE_RATE);
        assert!(buffer.iter().all(|s| s.is_finite()));
    }
}
