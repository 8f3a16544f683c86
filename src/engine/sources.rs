use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::OSCILLATOR_COUNT;

pub const LFO_COUNT: usize = 2;

/// Where a modulation route reads its value from.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModSource {
    Lfo(usize),
    /// The shared modulation envelope, rescaled to [-1, 1].
    ModEnvelope,
    /// An oscillator's own output, read through its analysis tap.
    Voice(usize),
}

impl ModSource {
    pub fn is_valid(&self) -> bool {
        match *self {
            ModSource::Lfo(index) => index < LFO_COUNT,
            ModSource::ModEnvelope => true,
            ModSource::Voice(index) => index < OSCILLATOR_COUNT,
        }
    }
}

impl fmt::Display for ModSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModSource::Lfo(index) => write!(f, "lfo{}", index + 1),
            ModSource::ModEnvelope => write!(f, "mod-envelope"),
            ModSource::Voice(index) => write!(f, "osc{}", index + 1),
        }
    }
}

/// Reads the current value of a source, in [-1, 1].
pub trait SourceReader {
    fn read_source(&mut self, source: ModSource) -> f32;
}
