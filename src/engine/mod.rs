//! Control-rate core: the parameter registry, the modulation matrix, the
//! scheduler that drives it, and the `SynthEngine` facade the host talks to.

pub mod config;
pub mod matrix;
pub mod params;
pub mod scheduler;
pub mod sources;

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

pub use self::{
    config::EngineConfig,
    matrix::{ModulationMatrix, ModulationRoute},
    params::{Modulatable, ParameterAddress, ParameterMetadata},
    scheduler::{ModulationScheduler, TickOutcome},
    sources::{ModSource, SourceReader, LFO_COUNT},
};

use crate::{
    dsp::{
        lfo::{unipolar_to_bipolar, Lfo, LfoWaveform},
        Envelope, EnvelopeAmount, EnvelopeParams, Harmonic,
    },
    engine::params::{FilterField, LfoField, OscillatorField},
    error::EngineError,
    graph::AudioDevice,
    synth::{ExpressionLayer, SynthesisState, VoiceGraphManager},
    HARMONIC_COUNT,
};

/*
Engine
======

    host ──commands──▶ SynthEngine ──┬──▶ SynthesisState ──buffer──▶ VoiceGraphManager ──▶ device
                                     │                                     ▲
                                     └──▶ ModulationMatrix ◀── tick ── ModulationScheduler
                                              (routes)          reads sources, applies values

Everything here runs on one control thread. Commands that need the device
are no-ops with a warning until a ready device is attached; LFO and envelope
settings are pure state and always apply.

Modulation never overwrites what the user set. Each parameter has a base
(owned by the voice layer or the LFO) and the scheduler pushes
`modulated(base)` to the device. A value identical to the one pushed last
tick is not sent again.
*/

struct EngineCore<D> {
    config: EngineConfig,
    device: Option<D>,
    voices: VoiceGraphManager,
    synthesis: SynthesisState,
    lfos: [Lfo; LFO_COUNT],
    lfo_rates: [f32; LFO_COUNT],
    mod_envelope: Envelope,
    note_held: bool,
    applied: BTreeMap<ParameterAddress, f32>,
}

impl<D: AudioDevice> EngineCore<D> {
    fn now(&self) -> f64 {
        self.device.as_ref().map_or(0.0, |device| device.current_time())
    }

    fn parts(&mut self) -> Option<(&mut VoiceGraphManager, &mut D)> {
        match self.device.as_mut() {
            Some(device) if device.is_ready() => Some((&mut self.voices, device)),
            _ => None,
        }
    }

    /// Run `f` against the voice layer and device, degrading to a logged no-op.
    fn with_voices<R>(
        &mut self,
        what: &'static str,
        f: impl FnOnce(&mut VoiceGraphManager, &mut D) -> Result<R, EngineError>,
    ) -> Option<R> {
        let Some((voices, device)) = self.parts() else {
            warn!(what, "output device not ready, ignoring");
            return None;
        };
        match f(voices, device) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(what, %err, "voice graph update failed");
                None
            }
        }
    }

    fn invalidate(&mut self, address: ParameterAddress) {
        self.applied.remove(&address);
    }
}

impl<D: AudioDevice> Modulatable for EngineCore<D> {
    type Param = ParameterAddress;

    fn get_param(&self, param: ParameterAddress) -> f32 {
        match param {
            ParameterAddress::Oscillator { index, field } => {
                let Some(slot) = self.voices.slot(index) else {
                    return 0.0;
                };
                match field {
                    OscillatorField::Frequency => slot.frequency(),
                    OscillatorField::Volume => slot.volume(),
                    OscillatorField::DetuneCents => slot.detune_cents(),
                }
            }
            ParameterAddress::Filter(FilterField::Cutoff) => self.voices.cutoff(),
            ParameterAddress::Filter(FilterField::Resonance) => self.voices.resonance(),
            ParameterAddress::Lfo {
                index,
                field: LfoField::Rate,
            } => self.lfo_rates.get(index).copied().unwrap_or(0.0),
            ParameterAddress::MasterVolume => self.voices.master_volume(),
        }
    }

    fn apply_modulation(&mut self, param: ParameterAddress, _base: f32, value: f32) {
        if self.applied.get(&param) == Some(&value) {
            return;
        }

        if let ParameterAddress::Lfo {
            index,
            field: LfoField::Rate,
        } = param
        {
            let now = self.now();
            if let Some(lfo) = self.lfos.get_mut(index) {
                lfo.set_frequency(value, now);
                self.applied.insert(param, value);
            }
            return;
        }

        let Some((voices, device)) = self.parts() else {
            return;
        };
        let result = match param {
            ParameterAddress::Oscillator { index, field } => match field {
                OscillatorField::Frequency => voices.apply_frequency(device, index, value),
                OscillatorField::Volume => voices.apply_volume(device, index, value),
                OscillatorField::DetuneCents => voices.apply_detune(device, index, value),
            },
            ParameterAddress::Filter(FilterField::Cutoff) => voices.apply_cutoff(device, value),
            ParameterAddress::Filter(FilterField::Resonance) => {
                voices.apply_resonance(device, value)
            }
            ParameterAddress::MasterVolume => voices.apply_master_volume(device, value),
            ParameterAddress::Lfo { .. } => Ok(()),
        };

        match result {
            Ok(()) => {
                self.applied.insert(param, value);
            }
            Err(err) => debug!(%param, %err, "modulation not applied"),
        }
    }
}

impl<D: AudioDevice> SourceReader for EngineCore<D> {
    fn read_source(&mut self, source: ModSource) -> f32 {
        let now = self.now();
        match source {
            ModSource::Lfo(index) => self.lfos.get(index).map_or(0.0, |lfo| lfo.value(now)),
            ModSource::ModEnvelope => unipolar_to_bipolar(self.mod_envelope.value(now)),
            ModSource::Voice(index) => {
                let mode = self.config.tap_read_mode;
                match self.parts() {
                    Some((voices, device)) => voices.read_voice_tap(device, index, mode),
                    None => 0.0,
                }
            }
        }
    }
}

/// The synthesizer core as seen by a host: every command and query the UI
/// layer needs, over any [`AudioDevice`].
pub struct SynthEngine<D: AudioDevice> {
    core: EngineCore<D>,
    matrix: ModulationMatrix,
    scheduler: ModulationScheduler,
}

impl<D: AudioDevice> SynthEngine<D> {
    /// An engine with no device attached. Every built-in parameter is
    /// registered and the scheduler is running.
    pub fn new(config: EngineConfig) -> Self {
        let mut scheduler = ModulationScheduler::new(&config);
        scheduler.start();

        let lfos: [Lfo; LFO_COUNT] = std::array::from_fn(|_| Lfo::default());
        let lfo_rates = std::array::from_fn(|index| lfos[index].frequency());

        Self {
            core: EngineCore {
                config,
                device: None,
                voices: VoiceGraphManager::new(&config),
                synthesis: SynthesisState::new(),
                lfos,
                lfo_rates,
                mod_envelope: Envelope::new(EnvelopeParams::default()),
                note_held: false,
                applied: BTreeMap::new(),
            },
            matrix: ModulationMatrix::with_defaults(),
            scheduler,
        }
    }

    pub fn with_device(config: EngineConfig, device: D) -> Self {
        let mut engine = Self::new(config);
        engine.attach_device(device);
        engine
    }

    /// Take ownership of the device and build the whole audio graph on it.
    pub fn attach_device(&mut self, device: D) {
        info!(sample_rate = device.sample_rate(), "output device attached");
        self.core.device = Some(device);
        self.rebuild_audio_chain();
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn device(&self) -> Option<&D> {
        self.core.device.as_ref()
    }

    pub fn device_mut(&mut self) -> Option<&mut D> {
        self.core.device.as_mut()
    }

    pub fn voices(&self) -> &VoiceGraphManager {
        &self.core.voices
    }

    pub fn synthesis(&self) -> &SynthesisState {
        &self.core.synthesis
    }

    pub fn matrix(&self) -> &ModulationMatrix {
        &self.matrix
    }

    pub fn scheduler(&self) -> &ModulationScheduler {
        &self.scheduler
    }

    pub fn lfo(&self, index: usize) -> Option<&Lfo> {
        self.core.lfos.get(index)
    }

    pub fn is_note_held(&self) -> bool {
        self.core.note_held
    }

    /// Release every node and build the graph again from the current state.
    pub fn rebuild_audio_chain(&mut self) {
        let buffer = self.core.synthesis.current().clone();
        self.core.applied.clear();
        if self
            .core
            .with_voices("rebuild audio chain", |voices, device| voices.rebuild(device, &buffer))
            .is_some()
        {
            info!("audio chain rebuilt");
        }
    }

    // Oscillators

    pub fn update_oscillator_frequency(&mut self, slot: usize, frequency: f32) {
        self.core
            .invalidate(ParameterAddress::oscillator(slot, OscillatorField::Frequency));
        self.core.with_voices("oscillator frequency", |voices, device| {
            voices.set_frequency(device, slot, frequency)
        });
    }

    pub fn update_oscillator_volume(&mut self, slot: usize, volume: f32) {
        self.core
            .invalidate(ParameterAddress::oscillator(slot, OscillatorField::Volume));
        self.core.with_voices("oscillator volume", |voices, device| {
            voices.set_volume(device, slot, volume)
        });
    }

    pub fn update_oscillator_detune(&mut self, slot: usize, cents: f32) {
        self.core
            .invalidate(ParameterAddress::oscillator(slot, OscillatorField::DetuneCents));
        self.core.with_voices("oscillator detune", |voices, device| {
            voices.set_detune(device, slot, cents)
        });
    }

    /// Build or tear down the slot's chain. A new chain plays the current
    /// waveform and joins a note that is already sounding.
    pub fn toggle_oscillator(&mut self, slot: usize, enabled: bool) {
        let buffer = self.core.synthesis.current().clone();
        for field in [
            OscillatorField::Frequency,
            OscillatorField::Volume,
            OscillatorField::DetuneCents,
        ] {
            self.core.invalidate(ParameterAddress::oscillator(slot, field));
        }
        self.core.with_voices("toggle oscillator", |voices, device| {
            if enabled {
                voices.create_voice(device, slot, &buffer)
            } else {
                voices.destroy_voice(device, slot)
            }
        });
    }

    // Filter and output

    pub fn update_filter(&mut self, cutoff: f32, resonance: f32) {
        self.core.invalidate(ParameterAddress::Filter(FilterField::Cutoff));
        self.core.invalidate(ParameterAddress::Filter(FilterField::Resonance));
        self.core.with_voices("filter", |voices, device| {
            voices.set_filter(device, cutoff, resonance)
        });
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        self.core.invalidate(ParameterAddress::MasterVolume);
        self.core.with_voices("master volume", |voices, device| {
            voices.set_master_volume(device, volume)
        });
    }

    // Envelopes

    /// Amplitude envelope for every voice; the modulation envelope follows it.
    /// Sounding voices glide onto the new curve from where they are.
    pub fn set_envelope(&mut self, params: EnvelopeParams) {
        self.core.voices.set_envelope(params);
        self.core.mod_envelope.set_params(params);
        if let Some((voices, device)) = self.core.parts() {
            if let Err(err) = voices.reschedule_envelopes(device) {
                warn!(%err, "failed to re-ramp envelopes");
            }
        }
    }

    /// How much the amplitude envelope shapes the output, 0 to 100.
    pub fn set_envelope_amount(&mut self, percent: f32) {
        let amount = EnvelopeAmount::from_percent(percent);
        self.core.with_voices("envelope amount", |voices, device| {
            voices.set_envelope_amount(device, amount)
        });
    }

    pub fn set_filter_envelope(&mut self, params: EnvelopeParams, enabled: bool) {
        self.core.invalidate(ParameterAddress::Filter(FilterField::Cutoff));
        self.core.with_voices("filter envelope", |voices, device| {
            voices.set_filter_envelope(device, params, enabled)
        });
    }

    pub fn trigger_note_on(&mut self) {
        let now = self.core.now();
        self.core.note_held = true;
        self.core.mod_envelope.note_on(now);
        self.core
            .with_voices("note on", |voices, device| voices.note_on(device));
    }

    /// Starts the release ramps. Nothing is hard-stopped; see
    /// [`max_release_time_ms`](Self::max_release_time_ms).
    pub fn trigger_note_off(&mut self) {
        let now = self.core.now();
        self.core.note_held = false;
        self.core.mod_envelope.note_off(now);
        self.core
            .with_voices("note off", |voices, device| voices.note_off(device));
    }

    /// Time after note off until every envelope in use has reached zero.
    pub fn max_release_time_ms(&self) -> f32 {
        self.core.voices.max_release_time() * 1000.0
    }

    // LFOs

    pub fn update_lfo_frequency(&mut self, index: usize, frequency: f32) {
        let now = self.core.now();
        let Some(lfo) = self.core.lfos.get_mut(index) else {
            warn!(index, "no such LFO");
            return;
        };
        lfo.set_frequency(frequency, now);
        self.core.lfo_rates[index] = lfo.frequency();
        self.core.invalidate(ParameterAddress::lfo_rate(index));
    }

    pub fn update_lfo_waveform(&mut self, index: usize, waveform: LfoWaveform) {
        match self.core.lfos.get_mut(index) {
            Some(lfo) => lfo.set_waveform(waveform),
            None => warn!(index, "no such LFO"),
        }
    }

    pub fn toggle_lfo(&mut self, index: usize, enabled: bool) {
        let now = self.core.now();
        match self.core.lfos.get_mut(index) {
            Some(lfo) => lfo.set_enabled(enabled, now),
            None => warn!(index, "no such LFO"),
        }
    }

    // Waveform

    /// Render the current layers and push the cycle to every active voice.
    /// While a note sounds the voices crossfade; otherwise they are rebuilt.
    pub fn update_waveform(&mut self) {
        let buffer = match self.core.synthesis.render(self.core.config.expression_policy) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!(%err, "waveform not updated, keeping previous cycle");
                return;
            }
        };

        let now = self.core.now();
        let note_held = self.core.note_held;
        self.core.with_voices("update waveform", |voices, device| {
            let sustained = note_held || voices.is_sounding(now);
            voices.apply_waveform(device, &buffer, sustained)
        });
    }

    pub fn set_harmonics(&mut self, harmonics: &[Harmonic]) {
        self.core.synthesis.set_harmonics(harmonics);
        self.update_waveform();
    }

    pub fn set_harmonics_enabled(&mut self, enabled: bool) {
        self.core.synthesis.set_harmonics_enabled(enabled);
        self.update_waveform();
    }

    pub fn set_expression(&mut self, layer: Option<ExpressionLayer>) {
        self.core.synthesis.set_expression(layer);
        self.update_waveform();
    }

    /// Re-derive the harmonic view from whatever is playing now.
    pub fn sync_harmonics_from_waveform(&mut self) -> [Harmonic; HARMONIC_COUNT] {
        *self.core.synthesis.sync_harmonics_from_current()
    }

    // Modulation routes

    pub fn register_parameter(&mut self, meta: ParameterMetadata) -> Result<(), EngineError> {
        self.matrix.register_parameter(meta)
    }

    pub fn add_route(
        &mut self,
        address: ParameterAddress,
        slot: usize,
        source: ModSource,
        amount: f32,
        bipolar: bool,
    ) -> Result<(), EngineError> {
        self.matrix.add_route(address, slot, source, amount, bipolar)
    }

    /// Clear a route slot. When it was the parameter's last route the base
    /// value is pushed back to the device.
    pub fn remove_route(
        &mut self,
        address: ParameterAddress,
        slot: usize,
    ) -> Result<(), EngineError> {
        if self.matrix.remove_route(address, slot)? {
            let base = self.core.get_param(address);
            self.core.apply_modulation(address, base, base);
        }
        Ok(())
    }

    pub fn update_route_amount(
        &mut self,
        address: ParameterAddress,
        slot: usize,
        amount: f32,
    ) -> Result<(), EngineError> {
        self.matrix.update_route_amount(address, slot, amount)
    }

    pub fn modulated_value(&self, address: ParameterAddress, base: f32) -> f32 {
        self.matrix.get_modulated_value(address, base)
    }

    pub fn active_sources(&self) -> &BTreeSet<ModSource> {
        self.matrix.active_sources()
    }

    /// Current value of any source in [-1, 1], routed or not.
    pub fn read_source_value(&mut self, source: ModSource) -> f32 {
        if !source.is_valid() {
            warn!(%source, "no such modulation source");
            return 0.0;
        }
        self.core.read_source(source).clamp(-1.0, 1.0)
    }

    /// One control-rate pass: release finished crossfades, then run the
    /// modulation scheduler.
    pub fn tick(&mut self) -> TickOutcome {
        let now = self.core.now();
        if let Some((voices, device)) = self.core.parts() {
            let released = voices.poll_cleanup(device, now);
            if released > 0 {
                debug!(released, "crossfaded chains released");
            }
        }
        self.scheduler.tick(&mut self.matrix, &mut self.core)
    }
}
