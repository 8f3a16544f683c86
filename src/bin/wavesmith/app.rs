//! Wavesmith - audio setup and the keyboard control loop

use std::{
    f32::consts::PI,
    io::Write,
    time::{Duration, Instant},
};

use color_eyre::eyre::{eyre, Result as EyreResult, WrapErr};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal,
};
use tracing::info;

use wavesmith::{
    dsp::{lfo::LfoWaveform, EnvelopeParams, Harmonic},
    engine::{params::FilterField, ModSource, ParameterAddress},
    graph::SoftwareDevice,
    EngineConfig, SynthEngine, HARMONIC_COUNT, MAX_BLOCK_SIZE, OSCILLATOR_COUNT,
};

/// Control-rate tick interval.
const TICK: Duration = Duration::from_millis(10);

const CUTOFF: ParameterAddress = ParameterAddress::Filter(FilterField::Cutoff);

const PRESETS: [&str; 4] = ["sine", "saw", "square", "triangle"];

fn preset(index: usize) -> [Harmonic; HARMONIC_COUNT] {
    std::array::from_fn(|i| {
        let k = (i + 1) as f32;
        let odd = (i + 1) % 2 == 1;
        match index % PRESETS.len() {
            0 if i == 0 => Harmonic::new(1.0, 0.0),
            1 => Harmonic::new(1.0 / k, 0.0),
            2 if odd => Harmonic::new(1.0 / k, 0.0),
            // alternate signs via a half-cycle phase shift
            3 if odd => Harmonic::new(1.0 / (k * k), if i % 4 == 2 { PI } else { 0.0 }),
            _ => Harmonic::default(),
        }
    })
}

/// Restores the terminal on every exit path.
struct RawMode;

impl RawMode {
    fn enable() -> EyreResult<Self> {
        terminal::enable_raw_mode().wrap_err("failed to enter raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

pub struct Wavesmith {
    config: EngineConfig,
    note_held: bool,
    preset: usize,
    cutoff: f32,
    lfo_route: bool,
    oscillators: [bool; OSCILLATOR_COUNT],
    should_quit: bool,
}

impl Wavesmith {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            note_held: false,
            preset: 0,
            cutoff: 2_000.0,
            lfo_route: false,
            oscillators: std::array::from_fn(|i| i == 0),
            should_quit: false,
        }
    }

    /// Open the default output, attach the engine and run until `q`.
    pub fn run(mut self) -> EyreResult<()> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| eyre!("no default output device available"))?;
        let config = device
            .default_output_config()
            .wrap_err("failed to fetch default output config")?;

        let sample_rate = config.sample_rate().0 as f32;
        let channels = config.channels() as usize;
        info!(sample_rate, channels, "opening output");

        let (software, mut renderer) = SoftwareDevice::new(sample_rate, self.config.queue_size);
        let mut engine = SynthEngine::with_device(self.config, software);
        engine.set_envelope(EnvelopeParams::from_ui(5.0, 20.0, 70.0, 40.0));
        engine.update_filter(self.cutoff, 4.0);
        engine.update_oscillator_frequency(1, 220.0);
        engine.update_oscillator_detune(2, 7.0);
        engine.update_oscillator_frequency(3, 660.0);
        engine.update_lfo_waveform(0, LfoWaveform::Triangle);
        engine.update_lfo_frequency(0, 0.5);
        engine.toggle_lfo(0, true);

        let mut mono = vec![0.0f32; MAX_BLOCK_SIZE];
        let stream = device.build_output_stream(
            &config.into(),
            move |data: &mut [f32], _| {
                for frame_block in data.chunks_mut(MAX_BLOCK_SIZE * channels) {
                    let frames = frame_block.len() / channels;
                    let block = &mut mono[..frames];
                    renderer.render(block);

                    // Mono to all channels
                    for (frame, &sample) in frame_block.chunks_mut(channels).zip(block.iter()) {
                        frame.fill(sample);
                    }
                }
            },
            |err| tracing::error!(%err, "audio stream error"),
            None,
        )?;
        stream.play()?;

        println!("=== wavesmith ===");
        println!("space: note on/off   1-4: oscillators   h: next harmonic preset");
        println!("l: LFO -> cutoff     up/down: cutoff    q: quit");

        let _raw = RawMode::enable()?;
        let mut next_tick = Instant::now();

        while !self.should_quit {
            let wait = next_tick.saturating_duration_since(Instant::now());
            if event::poll(wait)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_key(&mut engine, key.code);
                        self.print_status();
                    }
                }
            }

            if Instant::now() >= next_tick {
                engine.tick();
                next_tick += TICK;
            }
        }

        engine.trigger_note_off();
        std::thread::sleep(Duration::from_secs_f32(engine.max_release_time_ms() / 1000.0));
        drop(stream);
        println!("\r");
        Ok(())
    }

    fn handle_key(&mut self, engine: &mut SynthEngine<SoftwareDevice>, key: KeyCode) {
        match key {
            KeyCode::Char(' ') => {
                self.note_held = !self.note_held;
                if self.note_held {
                    engine.trigger_note_on();
                } else {
                    engine.trigger_note_off();
                }
            }
            KeyCode::Char(c @ '1'..='4') => {
                let slot = c as usize - '1' as usize;
                self.oscillators[slot] = !self.oscillators[slot];
                engine.toggle_oscillator(slot, self.oscillators[slot]);
            }
            KeyCode::Char('h') => {
                self.preset = (self.preset + 1) % PRESETS.len();
                engine.set_harmonics(&preset(self.preset));
            }
            KeyCode::Char('l') => {
                self.lfo_route = !self.lfo_route;
                let result = if self.lfo_route {
                    engine.add_route(CUTOFF, 0, ModSource::Lfo(0), 25.0, true)
                } else {
                    engine.remove_route(CUTOFF, 0)
                };
                if let Err(err) = result {
                    tracing::warn!(%err, "route change failed");
                }
            }
            KeyCode::Up => {
                self.cutoff = (self.cutoff * 1.25).min(20_000.0);
                engine.update_filter(self.cutoff, 4.0);
            }
            KeyCode::Down => {
                self.cutoff = (self.cutoff / 1.25).max(20.0);
                engine.update_filter(self.cutoff, 4.0);
            }
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            _ => {}
        }
    }

    fn print_status(&self) {
        let oscillators: String = self
            .oscillators
            .iter()
            .map(|&on| if on { '#' } else { '.' })
            .collect();
        print!(
            "\r\x1b[2K note {:<3}  osc [{}]  wave {:<8}  cutoff {:>7.0} Hz  lfo {}",
            if self.note_held { "on" } else { "off" },
            oscillators,
            PRESETS[self.preset],
            self.cutoff,
            if self.lfo_route { "on" } else { "off" },
        );
        let _ = std::io::stdout().flush();
    }
}
