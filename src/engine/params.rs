use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    dsp::{
        filter::{MAX_CUTOFF_HZ, MAX_RESONANCE, MIN_CUTOFF_HZ},
        lfo::{MAX_LFO_HZ, MIN_LFO_HZ},
        modulate::CurveKind,
    },
    engine::sources::LFO_COUNT,
    synth::voice::{DEFAULT_CUTOFF_HZ, DEFAULT_FREQUENCY_HZ, DEFAULT_MASTER_VOLUME, DEFAULT_VOLUME},
    OSCILLATOR_COUNT,
};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OscillatorField {
    Frequency,
    Volume,
    DetuneCents,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterField {
    Cutoff,
    Resonance,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LfoField {
    Rate,
}

/// Every parameter the modulation matrix can drive.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParameterAddress {
    Oscillator { index: usize, field: OscillatorField },
    Filter(FilterField),
    Lfo { index: usize, field: LfoField },
    MasterVolume,
}

impl ParameterAddress {
    pub fn oscillator(index: usize, field: OscillatorField) -> Self {
        ParameterAddress::Oscillator { index, field }
    }

    pub fn lfo_rate(index: usize) -> Self {
        ParameterAddress::Lfo {
            index,
            field: LfoField::Rate,
        }
    }
}

impl fmt::Display for ParameterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterAddress::Oscillator { index, field } => {
                let field = match field {
                    OscillatorField::Frequency => "frequency",
                    OscillatorField::Volume => "volume",
                    OscillatorField::DetuneCents => "detune",
                };
                write!(f, "osc{}.{field}", index + 1)
            }
            ParameterAddress::Filter(FilterField::Cutoff) => write!(f, "filter.cutoff"),
            ParameterAddress::Filter(FilterField::Resonance) => write!(f, "filter.resonance"),
            ParameterAddress::Lfo { index, field } => match field {
                LfoField::Rate => write!(f, "lfo{}.rate", index + 1),
            },
            ParameterAddress::MasterVolume => write!(f, "master.volume"),
        }
    }
}

/// Range and curve of one modulatable parameter. Immutable once registered.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterMetadata {
    pub address: ParameterAddress,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    pub curve: CurveKind,
}

impl ParameterMetadata {
    pub fn linear(address: ParameterAddress, min: f32, max: f32, default: f32) -> Self {
        Self {
            address,
            min,
            max,
            default,
            curve: CurveKind::Linear,
        }
    }

    pub fn exponential(address: ParameterAddress, min: f32, max: f32, default: f32) -> Self {
        Self {
            curve: CurveKind::Exponential,
            ..Self::linear(address, min, max, default)
        }
    }

    pub fn range(&self) -> f32 {
        self.max - self.min
    }

    /// The set registered at engine start.
    pub fn defaults() -> Vec<ParameterMetadata> {
        let mut params = Vec::with_capacity(OSCILLATOR_COUNT * 3 + LFO_COUNT + 3);

        for index in 0..OSCILLATOR_COUNT {
            params.push(Self::exponential(
                ParameterAddress::oscillator(index, OscillatorField::Frequency),
                20.0,
                20_000.0,
                DEFAULT_FREQUENCY_HZ,
            ));
            params.push(Self::linear(
                ParameterAddress::oscillator(index, OscillatorField::Volume),
                0.0,
                1.0,
                DEFAULT_VOLUME,
            ));
            params.push(Self::linear(
                ParameterAddress::oscillator(index, OscillatorField::DetuneCents),
                -1200.0,
                1200.0,
                0.0,
            ));
        }

        params.push(Self::exponential(
            ParameterAddress::Filter(FilterField::Cutoff),
            MIN_CUTOFF_HZ,
            MAX_CUTOFF_HZ,
            DEFAULT_CUTOFF_HZ,
        ));
        params.push(Self::linear(
            ParameterAddress::Filter(FilterField::Resonance),
            0.0,
            MAX_RESONANCE,
            0.0,
        ));

        for index in 0..LFO_COUNT {
            params.push(Self::exponential(
                ParameterAddress::lfo_rate(index),
                MIN_LFO_HZ,
                MAX_LFO_HZ,
                1.0,
            ));
        }

        params.push(Self::linear(
            ParameterAddress::MasterVolume,
            0.0,
            1.0,
            DEFAULT_MASTER_VOLUME,
        ));
        params
    }
}

/// Something owning parameters the modulation matrix can drive.
pub trait Modulatable {
    type Param: Copy;

    /// The unmodulated value currently set by the user.
    fn get_param(&self, param: Self::Param) -> f32;

    /// Push a resolved value to wherever the parameter lives.
    fn apply_modulation(&mut self, param: Self::Param, base: f32, value: f32);
}
