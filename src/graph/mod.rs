//! The output device seen from the control thread.
//!
//! The engine never renders audio itself. It creates nodes (looping playback
//! units, gain stages, low-pass stages, analysis taps), wires them together and
//! schedules ramps on their parameters; a device realizes all of that on its
//! own real-time path. `software` is the reference device used by the host
//! binary and the tests.

/// The `AudioDevice` trait.
pub mod device;
/// Node handles, node kinds and automatable parameters.
pub mod node;
/// Scheduled parameter automation.
pub mod param;
/// Lock-free software device: control handle plus renderer.
#[cfg(feature = "rtrb")]
pub mod software;

pub use device::AudioDevice;
pub use node::{NodeId, NodeSpec, ParamKind};
pub use param::{ParamTimeline, RampCommand};
#[cfg(feature = "rtrb")]
pub use software::{DeviceRenderer, SoftwareDevice};
