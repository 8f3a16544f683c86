#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::dsp::{modulate::TapReadMode, waveform::ExpressionFailurePolicy};

/// Tunables for the control-rate core.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Length of a waveform hot-swap.
    pub crossfade_ms: f32,
    /// Extra time a faded-out chain is kept before teardown.
    pub cleanup_margin_ms: f32,
    /// Target duration of one modulation tick; slower ticks log at debug.
    pub tick_budget_ms: f32,
    /// Ticks slower than this log a warning and are counted.
    pub tick_warning_ms: f32,
    /// How a voice's tap window becomes one source value.
    pub tap_read_mode: TapReadMode,
    pub expression_policy: ExpressionFailurePolicy,
    /// Capacity of the control → device command queue.
    pub queue_size: usize,
    /// Samples kept per analysis tap.
    pub tap_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            crossfade_ms: 30.0,
            cleanup_margin_ms: 50.0,
            tick_budget_ms: 10.0,
            tick_warning_ms: 14.0,
            tap_read_mode: TapReadMode::FirstSample,
            expression_policy: ExpressionFailurePolicy::ZeroSample,
            queue_size: 4096,
            tap_window: 256,
        }
    }
}
