// Purpose: Oscillator slots, their device node chains, and the waveform they play
// Waveforms flow one way: SynthesisState renders, VoiceGraphManager consumes

pub mod state;
pub mod voice;

pub use state::{ExpressionLayer, SynthesisState};
pub use voice::{CleanupToken, OscillatorSlot, OutputChain, VoiceChain, VoiceGraphManager};
