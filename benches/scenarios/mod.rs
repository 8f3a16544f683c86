//! Whole-engine benchmarks.
//!
//! These drive the engine and the software device the way the host binary
//! does: a render callback pulling blocks, a control loop ticking.

mod modulation;
mod render;

pub use modulation::bench_modulation;
pub use render::bench_render;
