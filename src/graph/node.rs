use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::dsp::WaveformBuffer;

/// Handle to a node on an output device.
///
/// Slots are reused after removal; the generation tells a live node apart
/// from an older one that used to sit in the same slot.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub index: u32,
    pub generation: u32,
}

impl NodeId {
    /// The device output. Always present, never removed.
    pub const DESTINATION: NodeId = NodeId {
        index: 0,
        generation: 0,
    };

    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Automatable parameters a node can expose.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Gain,
    PlaybackRate,
    Frequency,
    Q,
}

/// What to build when creating a node.
#[derive(Debug, Clone)]
pub enum NodeSpec {
    /// Loops a one-cycle buffer. `rate` is in buffer samples per output sample.
    Playback { buffer: WaveformBuffer, rate: f32 },
    Gain { gain: f32 },
    LowPass { cutoff: f32, q: f32 },
    /// Passes audio through and keeps the most recent `window` samples
    /// readable from the control thread.
    Tap { window: usize },
}

impl NodeSpec {
    /// Parameters this node exposes, with their starting values.
    pub fn initial_params(&self) -> Vec<(ParamKind, f32)> {
        match *self {
            NodeSpec::Playback { rate, .. } => vec![(ParamKind::PlaybackRate, rate)],
            NodeSpec::Gain { gain } => vec![(ParamKind::Gain, gain)],
            NodeSpec::LowPass { cutoff, q } => {
                vec![(ParamKind::Frequency, cutoff), (ParamKind::Q, q)]
            }
            NodeSpec::Tap { .. } => Vec::new(),
        }
    }

    pub fn is_tap(&self) -> bool {
        matches!(self, NodeSpec::Tap { .. })
    }
}
