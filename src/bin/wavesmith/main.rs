//! wavesmith - play the synthesis core from the terminal
//!
//! Run with: cargo run
//! Log with: RUST_LOG=wavesmith=debug cargo run 2> wavesmith.log

mod app;

use app::Wavesmith;
use tracing_subscriber::EnvFilter;
use wavesmith::EngineConfig;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wavesmith=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    Wavesmith::new(EngineConfig::default()).run()
}
