use tracing::{debug, warn};

use crate::{
    dsp::{
        envelope::filter_envelope_cutoff,
        filter::{clamp_cutoff, stage_qs, MAX_RESONANCE, STAGE_COUNT},
        modulate::{read_window, TapReadMode},
        Envelope, EnvelopeAmount, EnvelopeParams, WaveformBuffer,
    },
    engine::EngineConfig,
    error::EngineError,
    graph::{AudioDevice, NodeId, NodeSpec, ParamKind, RampCommand},
    OSCILLATOR_COUNT,
};

/*
Voice Graph
===========

Each oscillator slot owns one chain of device nodes while it is active:

    playback ──▶ volume ──▶ crossfade ──▶ envelope ──▶ mixer
        │
        └──▶ tap   (read by the modulation matrix when the voice is a source)

and every chain sums into one shared output path:

    mixer (1.0) ──▶ low-pass ×4 ──▶ master ──▶ destination

  playback    loops the current one-cycle buffer. Its rate is
                rate = pitch / (sample_rate / buffer_len)
              so one pass through the buffer takes exactly one period.
  volume      the slot's volume (0..1).
  crossfade   1.0 in steady state; only moves while a waveform is swapped.
  envelope    driven by pre-scheduled ramps at note on / note off.

Waveform Hot-Swap
-----------------

Rebuilding a chain while a key is held would restart the envelope and click.
Instead a second chain is built beside the old one:

    old crossfade  1 ─────╲____________  0      (then torn down)
    new crossfade  0 ____╱─────────────  1
                        │← duration →│

The new chain's envelope gain starts at the old chain's INSTANTANEOUS value
and continues with whatever ramps the envelope still has ahead, so a
sustaining or releasing note carries on without a level jump.

The old chain is handed to a cleanup task due at  now + duration + margin.
Each task carries a token. Destroying or rebuilding a slot tears down its
pending tasks right away and drops them, so a task can never fire on nodes
that were already released.

Base vs. Applied Values
-----------------------

Frequency, detune, volume, cutoff, resonance and master volume each keep a
BASE (what the user set) and an APPLIED value (what the device currently
has, possibly modulated). `set_*` changes the base and applies it;
`apply_*` pushes a value to the device and leaves the base alone.
*/

pub const DEFAULT_FREQUENCY_HZ: f32 = 440.0;
pub const DEFAULT_VOLUME: f32 = 0.5;
pub const DEFAULT_CUTOFF_HZ: f32 = 8_000.0;
pub const DEFAULT_MASTER_VOLUME: f32 = 0.5;

/// Identifies one scheduled chain teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CleanupToken(u64);

/// The device nodes making up one voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceChain {
    pub playback: NodeId,
    pub volume_gain: NodeId,
    pub crossfade_gain: NodeId,
    pub envelope_gain: NodeId,
    pub tap: NodeId,
    pub buffer_len: usize,
}

impl VoiceChain {
    fn nodes(&self) -> [NodeId; 5] {
        [
            self.playback,
            self.volume_gain,
            self.crossfade_gain,
            self.envelope_gain,
            self.tap,
        ]
    }
}

/// Shared path every voice sums into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputChain {
    pub mixer: NodeId,
    pub stages: [NodeId; STAGE_COUNT],
    pub master: NodeId,
}

impl OutputChain {
    fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::once(self.mixer)
            .chain(self.stages.iter().copied())
            .chain(std::iter::once(self.master))
    }
}

struct CleanupTask {
    token: CleanupToken,
    slot: usize,
    due: f64,
    chain: VoiceChain,
}

pub struct OscillatorSlot {
    index: usize,
    frequency: f32,
    detune_cents: f32,
    volume: f32,
    applied_frequency: f32,
    applied_detune: f32,
    active: bool,
    chain: Option<VoiceChain>,
    envelope: Envelope,
}

impl OscillatorSlot {
    fn new(index: usize, params: EnvelopeParams) -> Self {
        Self {
            index,
            frequency: DEFAULT_FREQUENCY_HZ,
            detune_cents: 0.0,
            volume: DEFAULT_VOLUME,
            applied_frequency: DEFAULT_FREQUENCY_HZ,
            applied_detune: 0.0,
            active: index == 0,
            chain: None,
            envelope: Envelope::new(params),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    pub fn detune_cents(&self) -> f32 {
        self.detune_cents
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn chain(&self) -> Option<&VoiceChain> {
        self.chain.as_ref()
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Sounding pitch after detune, using applied values.
    pub fn pitch(&self) -> f32 {
        self.applied_frequency * 2.0_f32.powf(self.applied_detune / 1200.0)
    }
}

/// Buffer samples per output sample for a looping one-cycle buffer.
pub fn playback_rate(pitch: f32, sample_rate: f32, buffer_len: usize) -> f32 {
    pitch / (sample_rate / buffer_len as f32)
}

struct ChainSpec<'a> {
    buffer: &'a WaveformBuffer,
    pitch: f32,
    volume: f32,
    crossfade: f32,
    envelope: f32,
    tap_window: usize,
}

fn build_chain<D: AudioDevice>(
    device: &mut D,
    mixer: NodeId,
    spec: ChainSpec<'_>,
    unreleased: &mut Vec<NodeId>,
) -> Result<VoiceChain, EngineError> {
    let mut created = Vec::with_capacity(5);
    let result = try_build_chain(device, mixer, spec, &mut created);
    if result.is_err() {
        for node in created {
            release(device, node, unreleased);
        }
    }
    result
}

fn try_build_chain<D: AudioDevice>(
    device: &mut D,
    mixer: NodeId,
    spec: ChainSpec<'_>,
    created: &mut Vec<NodeId>,
) -> Result<VoiceChain, EngineError> {
    let mut create = |device: &mut D, node: NodeSpec| -> Result<NodeId, EngineError> {
        let id = device.create_node(node)?;
        created.push(id);
        Ok(id)
    };

    let rate = playback_rate(spec.pitch, device.sample_rate(), spec.buffer.len());
    let playback = create(
        device,
        NodeSpec::Playback {
            buffer: spec.buffer.clone(),
            rate,
        },
    )?;
    let volume_gain = create(device, NodeSpec::Gain { gain: spec.volume })?;
    let crossfade_gain = create(device, NodeSpec::Gain { gain: spec.crossfade })?;
    let envelope_gain = create(device, NodeSpec::Gain { gain: spec.envelope })?;
    let tap = create(
        device,
        NodeSpec::Tap {
            window: spec.tap_window,
        },
    )?;

    device.connect(playback, volume_gain)?;
    device.connect(volume_gain, crossfade_gain)?;
    device.connect(crossfade_gain, envelope_gain)?;
    device.connect(envelope_gain, mixer)?;
    device.connect(playback, tap)?;

    let now = device.current_time();
    device.start(playback, now)?;

    Ok(VoiceChain {
        playback,
        volume_gain,
        crossfade_gain,
        envelope_gain,
        tap,
        buffer_len: spec.buffer.len(),
    })
}

fn schedule_crossfade<D: AudioDevice>(
    device: &mut D,
    incoming: &VoiceChain,
    outgoing: &VoiceChain,
    envelope: &[RampCommand],
    fade_in: &[RampCommand],
    duration: f64,
) -> Result<(), EngineError> {
    device.schedule_all(incoming.envelope_gain, ParamKind::Gain, envelope)?;
    device.schedule_all(incoming.crossfade_gain, ParamKind::Gain, fade_in)?;
    device.ramp_to(outgoing.crossfade_gain, ParamKind::Gain, 0.0, duration)
}

/// Nodes the device refused to release (a full queue, say) go to
/// `unreleased` and are retried on the next cleanup poll.
fn release<D: AudioDevice>(device: &mut D, node: NodeId, unreleased: &mut Vec<NodeId>) {
    match device.disconnect(node) {
        Ok(()) => {}
        Err(EngineError::StaleNode(node)) => debug!(%node, "node already released"),
        Err(err) => {
            warn!(%node, %err, "failed to release node, will retry");
            unreleased.push(node);
        }
    }
}

/// Re-ramp a chain's envelope gain, carrying on from the gain the device
/// holds right now.
fn reschedule_envelope<D: AudioDevice>(
    device: &mut D,
    chain: &VoiceChain,
    envelope: &mut Envelope,
    amount: EnvelopeAmount,
    now: f64,
) -> Result<(), EngineError> {
    let map = |level: f32| amount.apply(level);
    let current = match device.param_value(chain.envelope_gain, ParamKind::Gain) {
        Some(value) => value,
        None => map(envelope.value(now)),
    };
    let ramps = envelope.ramps_continuing(now, current, map);
    device.schedule_all(chain.envelope_gain, ParamKind::Gain, &ramps)
}

fn teardown<D: AudioDevice>(
    device: &mut D,
    chain: &VoiceChain,
    unreleased: &mut Vec<NodeId>,
) {
    match device.stop(chain.playback) {
        Ok(()) => {}
        Err(EngineError::StaleNode(node)) => debug!(%node, "playback already stopped"),
        Err(err) => warn!(%err, "failed to stop playback"),
    }
    for node in chain.nodes() {
        release(device, node, unreleased);
    }
}

/// Owns every node the engine places on the device.
pub struct VoiceGraphManager {
    slots: Vec<OscillatorSlot>,
    output: Option<OutputChain>,
    cleanup: Vec<CleanupTask>,
    unreleased: Vec<NodeId>,
    next_token: u64,
    amount: EnvelopeAmount,
    filter_envelope: Envelope,
    filter_envelope_enabled: bool,
    cutoff: f32,
    resonance: f32,
    master_volume: f32,
    applied_cutoff: f32,
    applied_resonance: f32,
    applied_master: f32,
    crossfade_ms: f32,
    cleanup_margin: f64,
    tap_scratch: Vec<f32>,
}

impl VoiceGraphManager {
    pub fn new(config: &EngineConfig) -> Self {
        let params = EnvelopeParams::default();
        Self {
            slots: (0..OSCILLATOR_COUNT)
                .map(|index| OscillatorSlot::new(index, params))
                .collect(),
            output: None,
            cleanup: Vec::new(),
            unreleased: Vec::new(),
            next_token: 0,
            amount: EnvelopeAmount::default(),
            filter_envelope: Envelope::new(params),
            filter_envelope_enabled: false,
            cutoff: DEFAULT_CUTOFF_HZ,
            resonance: 0.0,
            master_volume: DEFAULT_MASTER_VOLUME,
            applied_cutoff: DEFAULT_CUTOFF_HZ,
            applied_resonance: 0.0,
            applied_master: DEFAULT_MASTER_VOLUME,
            crossfade_ms: config.crossfade_ms,
            cleanup_margin: config.cleanup_margin_ms as f64 / 1000.0,
            tap_scratch: vec![0.0; config.tap_window.max(1)],
        }
    }

    pub fn slot(&self, slot: usize) -> Option<&OscillatorSlot> {
        self.slots.get(slot)
    }

    pub fn slots(&self) -> &[OscillatorSlot] {
        &self.slots
    }

    pub fn output(&self) -> Option<&OutputChain> {
        self.output.as_ref()
    }

    pub fn envelope_amount(&self) -> EnvelopeAmount {
        self.amount
    }

    pub fn cutoff(&self) -> f32 {
        self.cutoff
    }

    pub fn resonance(&self) -> f32 {
        self.resonance
    }

    pub fn master_volume(&self) -> f32 {
        self.master_volume
    }

    pub fn filter_envelope_enabled(&self) -> bool {
        self.filter_envelope_enabled
    }

    pub fn pending_cleanups(&self) -> usize {
        self.cleanup.len()
    }

    /// Nodes waiting for a second release attempt.
    pub fn unreleased_nodes(&self) -> &[NodeId] {
        &self.unreleased
    }

    fn slot_mut(&mut self, slot: usize) -> Result<&mut OscillatorSlot, EngineError> {
        self.slots
            .get_mut(slot)
            .ok_or(EngineError::SlotOutOfRange { slot })
    }

    fn mixer(&self) -> Result<NodeId, EngineError> {
        self.output
            .map(|output| output.mixer)
            .ok_or(EngineError::DeviceUnavailable)
    }

    /// Mixer, filter cascade and master stage.
    pub fn build_output<D: AudioDevice>(&mut self, device: &mut D) -> Result<(), EngineError> {
        let mixer = device.create_node(NodeSpec::Gain { gain: 1.0 })?;

        let mut stages = [mixer; STAGE_COUNT];
        let mut previous = mixer;
        for (stage, q) in stages.iter_mut().zip(stage_qs(self.applied_resonance)) {
            *stage = device.create_node(NodeSpec::LowPass {
                cutoff: self.applied_cutoff,
                q,
            })?;
            device.connect(previous, *stage)?;
            previous = *stage;
        }

        let master = device.create_node(NodeSpec::Gain {
            gain: self.applied_master,
        })?;
        device.connect(previous, master)?;
        device.connect(master, NodeId::DESTINATION)?;

        self.output = Some(OutputChain {
            mixer,
            stages,
            master,
        });
        Ok(())
    }

    /// Build a fresh chain for `slot`, replacing any chain it already has.
    pub fn create_voice<D: AudioDevice>(
        &mut self,
        device: &mut D,
        slot: usize,
        buffer: &WaveformBuffer,
    ) -> Result<(), EngineError> {
        if buffer.is_empty() {
            warn!(slot, "refusing to build a voice from an empty waveform");
            return Err(EngineError::InvalidWaveform {
                reason: "empty buffer",
            });
        }

        let mixer = self.mixer()?;
        let now = device.current_time();
        let amount = self.amount;
        let tap_window = self.tap_scratch.len();
        let unreleased = &mut self.unreleased;
        let state = self
            .slots
            .get_mut(slot)
            .ok_or(EngineError::SlotOutOfRange { slot })?;

        if let Some(old) = state.chain.take() {
            teardown(device, &old, unreleased);
        }

        let level = amount.apply(state.envelope.value(now));
        let chain = build_chain(
            device,
            mixer,
            ChainSpec {
                buffer,
                pitch: state.pitch(),
                volume: state.volume,
                crossfade: 1.0,
                envelope: level,
                tap_window,
            },
            unreleased,
        )?;

        // Join a note that is already sounding
        let ramps = state.envelope.ramps_from(now, |l| amount.apply(l));
        if let Err(err) = device.schedule_all(chain.envelope_gain, ParamKind::Gain, &ramps) {
            teardown(device, &chain, unreleased);
            return Err(err);
        }

        state.chain = Some(chain);
        state.active = true;
        debug!(slot, playback = %chain.playback, "voice created");
        Ok(())
    }

    /// Stop and release every node of the slot, including chains still fading.
    pub fn destroy_voice<D: AudioDevice>(
        &mut self,
        device: &mut D,
        slot: usize,
    ) -> Result<(), EngineError> {
        let unreleased = &mut self.unreleased;
        let state = self
            .slots
            .get_mut(slot)
            .ok_or(EngineError::SlotOutOfRange { slot })?;
        state.active = false;
        if let Some(chain) = state.chain.take() {
            teardown(device, &chain, unreleased);
        }

        self.cleanup.retain(|task| {
            if task.slot == slot {
                teardown(device, &task.chain, unreleased);
                false
            } else {
                true
            }
        });

        debug!(slot, "voice destroyed");
        Ok(())
    }

    /// Swap the slot's waveform under a held note. Returns the token of the
    /// cleanup task that will release the old chain, or `None` when the slot
    /// had no chain and one was simply built.
    pub fn crossfade_waveform<D: AudioDevice>(
        &mut self,
        device: &mut D,
        slot: usize,
        buffer: &WaveformBuffer,
        duration_ms: f32,
    ) -> Result<Option<CleanupToken>, EngineError> {
        if buffer.is_empty() {
            warn!(slot, "refusing to crossfade to an empty waveform");
            return Err(EngineError::InvalidWaveform {
                reason: "empty buffer",
            });
        }

        let existing = self.slot_mut(slot)?.chain;
        let Some(old) = existing else {
            self.create_voice(device, slot, buffer)?;
            return Ok(None);
        };

        let mixer = self.mixer()?;
        let now = device.current_time();
        let duration = duration_ms.max(0.0) as f64 / 1000.0;
        let amount = self.amount;
        let tap_window = self.tap_scratch.len();
        let unreleased = &mut self.unreleased;
        let state = self
            .slots
            .get_mut(slot)
            .ok_or(EngineError::SlotOutOfRange { slot })?;

        let level = match device.param_value(old.envelope_gain, ParamKind::Gain) {
            Some(value) => value,
            None => amount.apply(state.envelope.value(now)),
        };

        let chain = build_chain(
            device,
            mixer,
            ChainSpec {
                buffer,
                pitch: state.pitch(),
                volume: state.volume,
                crossfade: 0.0,
                envelope: level,
                tap_window,
            },
            unreleased,
        )?;

        let envelope = state.envelope.ramps_continuing(now, level, |l| amount.apply(l));

        let fade_in = [
            RampCommand::CancelScheduled { from: now },
            RampCommand::SetValueAt { value: 0.0, time: now },
            RampCommand::LinearRampTo {
                value: 1.0,
                end_time: now + duration,
            },
        ];

        if let Err(err) = schedule_crossfade(device, &chain, &old, &envelope, &fade_in, duration) {
            teardown(device, &chain, unreleased);
            return Err(err);
        }

        state.chain = Some(chain);

        let token = CleanupToken(self.next_token);
        self.next_token += 1;
        self.cleanup.push(CleanupTask {
            token,
            slot,
            due: now + duration + self.cleanup_margin,
            chain: old,
        });

        debug!(slot, ?token, duration_ms, "crossfading waveform");
        Ok(Some(token))
    }

    /// Push a new waveform to every active slot. While a note is sounding the
    /// slots crossfade; otherwise their chains are rebuilt outright.
    pub fn apply_waveform<D: AudioDevice>(
        &mut self,
        device: &mut D,
        buffer: &WaveformBuffer,
        sustained: bool,
    ) -> Result<(), EngineError> {
        for slot in 0..self.slots.len() {
            if !self.slots[slot].active {
                continue;
            }
            if sustained {
                self.crossfade_waveform(device, slot, buffer, self.crossfade_ms)?;
            } else {
                self.create_voice(device, slot, buffer)?;
            }
        }
        Ok(())
    }

    /// Tear down chains whose fade has finished and retry nodes that failed
    /// to release earlier. Returns how many chains were released.
    pub fn poll_cleanup<D: AudioDevice>(&mut self, device: &mut D, now: f64) -> usize {
        for node in std::mem::take(&mut self.unreleased) {
            release(device, node, &mut self.unreleased);
        }

        let unreleased = &mut self.unreleased;
        let mut released = 0;
        self.cleanup.retain(|task| {
            if task.due <= now {
                teardown(device, &task.chain, unreleased);
                released += 1;
                false
            } else {
                true
            }
        });
        released
    }

    /// Release a pending cleanup now instead of at its due time.
    pub fn cancel_cleanup<D: AudioDevice>(&mut self, device: &mut D, token: CleanupToken) -> bool {
        match self.cleanup.iter().position(|task| task.token == token) {
            Some(index) => {
                let task = self.cleanup.remove(index);
                teardown(device, &task.chain, &mut self.unreleased);
                true
            }
            None => false,
        }
    }

    /// Release every node and build the whole graph again.
    pub fn rebuild<D: AudioDevice>(
        &mut self,
        device: &mut D,
        buffer: &WaveformBuffer,
    ) -> Result<(), EngineError> {
        let unreleased = &mut self.unreleased;
        for state in &mut self.slots {
            if let Some(chain) = state.chain.take() {
                teardown(device, &chain, unreleased);
            }
        }
        for task in self.cleanup.drain(..) {
            teardown(device, &task.chain, unreleased);
        }
        if let Some(output) = self.output.take() {
            for node in output.nodes() {
                release(device, node, unreleased);
            }
        }

        self.build_output(device)?;
        self.apply_cutoff(device, self.applied_cutoff)?;

        for slot in 0..self.slots.len() {
            if self.slots[slot].active {
                self.create_voice(device, slot, buffer)?;
            }
        }
        Ok(())
    }

    pub fn note_on<D: AudioDevice>(&mut self, device: &mut D) -> Result<(), EngineError> {
        let now = device.current_time();
        for state in &mut self.slots {
            state.envelope.note_on(now);
        }
        if self.filter_envelope_enabled {
            self.filter_envelope.note_on(now);
        }
        self.schedule_envelopes(device, now)
    }

    pub fn note_off<D: AudioDevice>(&mut self, device: &mut D) -> Result<(), EngineError> {
        let now = device.current_time();
        for state in &mut self.slots {
            state.envelope.note_off(now);
        }
        if self.filter_envelope_enabled {
            self.filter_envelope.note_off(now);
        }
        self.schedule_envelopes(device, now)
    }

    fn schedule_envelopes<D: AudioDevice>(
        &mut self,
        device: &mut D,
        now: f64,
    ) -> Result<(), EngineError> {
        let amount = self.amount;
        for state in &mut self.slots {
            if let Some(chain) = state.chain {
                reschedule_envelope(device, &chain, &mut state.envelope, amount, now)?;
            }
        }
        if self.filter_envelope_enabled {
            self.schedule_filter_envelope(device, now)?;
        }
        Ok(())
    }

    /// Filter envelope ramps on every stage, continuing from the cutoff the
    /// first stage holds now.
    fn schedule_filter_envelope<D: AudioDevice>(
        &mut self,
        device: &mut D,
        now: f64,
    ) -> Result<(), EngineError> {
        let Some(output) = self.output else {
            return Ok(());
        };

        let base = self.applied_cutoff;
        let map = |level: f32| filter_envelope_cutoff(base, level);
        let current = match device.param_value(output.stages[0], ParamKind::Frequency) {
            Some(value) => value,
            None => map(self.filter_envelope.value(now)),
        };
        let ramps = self.filter_envelope.ramps_continuing(now, current, map);
        for stage in output.stages {
            device.schedule_all(stage, ParamKind::Frequency, &ramps)?;
        }
        Ok(())
    }

    /// New ADSR times and sustain for every voice. Takes effect on the
    /// device once [`reschedule_envelopes`](Self::reschedule_envelopes) runs.
    pub fn set_envelope(&mut self, params: EnvelopeParams) {
        for state in &mut self.slots {
            state.envelope.set_params(params);
        }
    }

    /// Re-issue every sounding envelope from the device's current values.
    pub fn reschedule_envelopes<D: AudioDevice>(
        &mut self,
        device: &mut D,
    ) -> Result<(), EngineError> {
        let now = device.current_time();
        self.schedule_envelopes(device, now)
    }

    pub fn envelope_params(&self) -> EnvelopeParams {
        self.slots
            .first()
            .map_or_else(EnvelopeParams::default, |slot| slot.envelope.params())
    }

    /// Changes the output range of the amplitude envelope. Sounding voices
    /// are re-ramped onto the new range.
    pub fn set_envelope_amount<D: AudioDevice>(
        &mut self,
        device: &mut D,
        amount: EnvelopeAmount,
    ) -> Result<(), EngineError> {
        self.amount = amount;
        let now = device.current_time();
        for state in &mut self.slots {
            if let Some(chain) = state.chain {
                reschedule_envelope(device, &chain, &mut state.envelope, amount, now)?;
            }
        }
        Ok(())
    }

    pub fn set_filter_envelope<D: AudioDevice>(
        &mut self,
        device: &mut D,
        params: EnvelopeParams,
        enabled: bool,
    ) -> Result<(), EngineError> {
        self.filter_envelope.set_params(params);
        if self.filter_envelope_enabled && !enabled {
            self.filter_envelope.reset();
        }
        self.filter_envelope_enabled = enabled;
        if enabled {
            let now = device.current_time();
            self.schedule_filter_envelope(device, now)
        } else {
            self.apply_cutoff(device, self.applied_cutoff)
        }
    }

    pub fn filter_envelope_params(&self) -> EnvelopeParams {
        self.filter_envelope.params()
    }

    /// Longest release among the envelopes currently in use, in seconds.
    pub fn max_release_time(&self) -> f32 {
        let amp = self.envelope_params().release;
        if self.filter_envelope_enabled {
            amp.max(self.filter_envelope.params().release)
        } else {
            amp
        }
    }

    /// True if any voice is audible: a live envelope or an amount below 100%.
    pub fn is_sounding(&mut self, now: f64) -> bool {
        let floor = self.amount.floor();
        self.slots.iter_mut().any(|state| {
            state.envelope.value(now);
            state.chain.is_some() && (state.envelope.is_active() || floor > 0.0)
        })
    }

    pub fn set_frequency<D: AudioDevice>(
        &mut self,
        device: &mut D,
        slot: usize,
        frequency: f32,
    ) -> Result<(), EngineError> {
        self.slot_mut(slot)?.frequency = frequency.max(0.0);
        self.apply_frequency(device, slot, frequency)
    }

    pub fn apply_frequency<D: AudioDevice>(
        &mut self,
        device: &mut D,
        slot: usize,
        frequency: f32,
    ) -> Result<(), EngineError> {
        self.slot_mut(slot)?.applied_frequency = frequency.max(0.0);
        self.apply_pitch(device, slot)
    }

    pub fn set_detune<D: AudioDevice>(
        &mut self,
        device: &mut D,
        slot: usize,
        cents: f32,
    ) -> Result<(), EngineError> {
        self.slot_mut(slot)?.detune_cents = cents;
        self.apply_detune(device, slot, cents)
    }

    pub fn apply_detune<D: AudioDevice>(
        &mut self,
        device: &mut D,
        slot: usize,
        cents: f32,
    ) -> Result<(), EngineError> {
        self.slot_mut(slot)?.applied_detune = cents;
        self.apply_pitch(device, slot)
    }

    fn apply_pitch<D: AudioDevice>(
        &mut self,
        device: &mut D,
        slot: usize,
    ) -> Result<(), EngineError> {
        let state = self.slot_mut(slot)?;
        let pitch = state.pitch();
        let Some(chain) = state.chain else {
            return Ok(());
        };

        let sample_rate = device.sample_rate();
        let rate = playback_rate(pitch, sample_rate, chain.buffer_len);
        device.set_now(chain.playback, ParamKind::PlaybackRate, rate)?;

        // Chains still fading out follow the pitch too
        for task in self.cleanup.iter().filter(|task| task.slot == slot) {
            let node = task.chain.playback;
            let rate = playback_rate(pitch, sample_rate, task.chain.buffer_len);
            if let Err(err) = device.set_now(node, ParamKind::PlaybackRate, rate) {
                debug!(%node, %err, "retiring chain already released");
            }
        }
        Ok(())
    }

    pub fn set_volume<D: AudioDevice>(
        &mut self,
        device: &mut D,
        slot: usize,
        volume: f32,
    ) -> Result<(), EngineError> {
        self.slot_mut(slot)?.volume = volume.clamp(0.0, 1.0);
        self.apply_volume(device, slot, volume)
    }

    pub fn apply_volume<D: AudioDevice>(
        &mut self,
        device: &mut D,
        slot: usize,
        volume: f32,
    ) -> Result<(), EngineError> {
        match self.slot_mut(slot)?.chain {
            Some(chain) => {
                device.set_now(chain.volume_gain, ParamKind::Gain, volume.clamp(0.0, 1.0))
            }
            None => Ok(()),
        }
    }

    pub fn set_filter<D: AudioDevice>(
        &mut self,
        device: &mut D,
        cutoff: f32,
        resonance: f32,
    ) -> Result<(), EngineError> {
        self.cutoff = clamp_cutoff(cutoff);
        self.resonance = resonance.clamp(0.0, MAX_RESONANCE);
        self.apply_cutoff(device, self.cutoff)?;
        self.apply_resonance(device, self.resonance)
    }

    /// Move every stage's cutoff. While the filter envelope is sounding, its
    /// remaining ramps are re-issued around the new base.
    pub fn apply_cutoff<D: AudioDevice>(
        &mut self,
        device: &mut D,
        cutoff: f32,
    ) -> Result<(), EngineError> {
        self.applied_cutoff = clamp_cutoff(cutoff);
        let Some(output) = self.output else {
            return Ok(());
        };

        let now = device.current_time();
        let base = self.applied_cutoff;
        self.filter_envelope.value(now);

        if self.filter_envelope_enabled && self.filter_envelope.is_active() {
            let ramps = self
                .filter_envelope
                .ramps_from(now, |l| filter_envelope_cutoff(base, l));
            for stage in output.stages {
                device.schedule_all(stage, ParamKind::Frequency, &ramps)?;
            }
        } else {
            for stage in output.stages {
                device.set_now(stage, ParamKind::Frequency, base)?;
            }
        }
        Ok(())
    }

    pub fn apply_resonance<D: AudioDevice>(
        &mut self,
        device: &mut D,
        resonance: f32,
    ) -> Result<(), EngineError> {
        self.applied_resonance = resonance.clamp(0.0, MAX_RESONANCE);
        let Some(output) = self.output else {
            return Ok(());
        };
        for (stage, q) in output.stages.into_iter().zip(stage_qs(self.applied_resonance)) {
            device.set_now(stage, ParamKind::Q, q)?;
        }
        Ok(())
    }

    pub fn set_master_volume<D: AudioDevice>(
        &mut self,
        device: &mut D,
        volume: f32,
    ) -> Result<(), EngineError> {
        self.master_volume = volume.clamp(0.0, 1.0);
        self.apply_master_volume(device, self.master_volume)
    }

    pub fn apply_master_volume<D: AudioDevice>(
        &mut self,
        device: &mut D,
        volume: f32,
    ) -> Result<(), EngineError> {
        self.applied_master = volume.clamp(0.0, 1.0);
        match self.output {
            Some(output) => device.set_now(output.master, ParamKind::Gain, self.applied_master),
            None => Ok(()),
        }
    }

    /// One value in [-1, 1] from the slot's analysis tap; 0 while inactive.
    pub fn read_voice_tap<D: AudioDevice>(
        &mut self,
        device: &mut D,
        slot: usize,
        mode: TapReadMode,
    ) -> f32 {
        let Some(chain) = self.slots.get(slot).and_then(|state| state.chain) else {
            return 0.0;
        };
        let count = device.read_tap(chain.tap, &mut self.tap_scratch);
        read_window(&self.tap_scratch[..count], mode)
    }
}

#[cfg(all(test, feature = "rtrb"))]
mod tests {
    use super::*;
    use crate::{
        dsp::waveform::{synthesize_from_harmonics, Harmonic},
        graph::{param::ParamEvent, DeviceRenderer, SoftwareDevice},
    };

    const SAMPLE_RATE: f32 = 48_000.0;

    fn setup() -> (VoiceGraphManager, SoftwareDevice, DeviceRenderer) {
        let (mut device, renderer) = SoftwareDevice::new(SAMPLE_RATE, 1024);
        let mut voices = VoiceGraphManager::new(&EngineConfig::default());
        voices.build_output(&mut device).unwrap();
        (voices, device, renderer)
    }

    fn sine() -> WaveformBuffer {
        synthesize_from_harmonics(&[Harmonic::new(1.0, 0.0)])
    }

    fn saw() -> WaveformBuffer {
        let harmonics: Vec<_> = (1..=8).map(|k| Harmonic::new(1.0 / k as f32, 0.0)).collect();
        synthesize_from_harmonics(&harmonics)
    }

    fn advance(renderer: &mut DeviceRenderer, seconds: f64) {
        let mut out = vec![0.0; (seconds * SAMPLE_RATE as f64) as usize];
        renderer.render(&mut out);
    }

    fn chain(voices: &VoiceGraphManager, slot: usize) -> VoiceChain {
        *voices.slot(slot).unwrap().chain().unwrap()
    }

    #[test]
    fn voice_plays_at_requested_pitch() {
        let (mut voices, mut device, _renderer) = setup();
        voices.create_voice(&mut device, 0, &sine()).unwrap();

        let rate = device
            .param_value(chain(&voices, 0).playback, ParamKind::PlaybackRate)
            .unwrap();
        assert!((rate - 440.0 / (SAMPLE_RATE / 2048.0)).abs() < 1e-4);
    }

    #[test]
    fn octave_detune_doubles_rate() {
        let (mut voices, mut device, _renderer) = setup();
        voices.create_voice(&mut device, 0, &sine()).unwrap();
        let playback = chain(&voices, 0).playback;
        let before = device.param_value(playback, ParamKind::PlaybackRate).unwrap();

        voices.set_detune(&mut device, 0, 1200.0).unwrap();
        let after = device.param_value(playback, ParamKind::PlaybackRate).unwrap();
        assert!((after - 2.0 * before).abs() < 1e-4);
        assert_eq!(voices.slot(0).unwrap().frequency(), 440.0);
    }

    #[test]
    fn empty_waveform_is_rejected() {
        let (mut voices, mut device, _renderer) = setup();
        let result = voices.create_voice(&mut device, 1, &WaveformBuffer::from(Vec::new()));

        assert!(matches!(result, Err(EngineError::InvalidWaveform { .. })));
        assert!(!voices.slot(1).unwrap().is_active());
        assert!(voices.slot(1).unwrap().chain().is_none());
    }

    #[test]
    fn out_of_range_slot_is_rejected() {
        let (mut voices, mut device, _renderer) = setup();
        assert_eq!(
            voices.create_voice(&mut device, OSCILLATOR_COUNT, &sine()),
            Err(EngineError::SlotOutOfRange {
                slot: OSCILLATOR_COUNT
            })
        );
    }

    #[test]
    fn crossfade_schedules_complementary_ramps() {
        let (mut voices, mut device, mut renderer) = setup();
        voices.create_voice(&mut device, 0, &sine()).unwrap();
        voices.note_on(&mut device).unwrap();
        advance(&mut renderer, 0.05);

        let old = chain(&voices, 0);
        let old_level = device.param_value(old.envelope_gain, ParamKind::Gain).unwrap();
        let now = device.current_time();

        let token = voices.crossfade_waveform(&mut device, 0, &saw(), 30.0).unwrap();
        assert!(token.is_some());
        let new = chain(&voices, 0);
        assert_ne!(new.playback, old.playback);

        assert_eq!(
            device.timeline(old.crossfade_gain, ParamKind::Gain).unwrap().events(),
            &[
                ParamEvent::Set { value: 1.0, time: now },
                ParamEvent::Ramp {
                    value: 0.0,
                    end_time: now + 0.03
                },
            ]
        );
        assert_eq!(
            device.timeline(new.crossfade_gain, ParamKind::Gain).unwrap().events(),
            &[
                ParamEvent::Set { value: 0.0, time: now },
                ParamEvent::Ramp {
                    value: 1.0,
                    end_time: now + 0.03
                },
            ]
        );

        let new_level = device.param_value(new.envelope_gain, ParamKind::Gain).unwrap();
        assert!((new_level - old_level).abs() < 1e-6);
        assert_eq!(voices.pending_cleanups(), 1);
    }

    #[test]
    fn crossfaded_envelope_continues_toward_sustain() {
        let (mut voices, mut device, mut renderer) = setup();
        voices.create_voice(&mut device, 0, &sine()).unwrap();
        voices.note_on(&mut device).unwrap();
        advance(&mut renderer, 0.05);

        voices.crossfade_waveform(&mut device, 0, &saw(), 30.0).unwrap();
        let new = chain(&voices, 0);
        let timeline = device.timeline(new.envelope_gain, ParamKind::Gain).unwrap();
        assert!((timeline.final_value() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn cleanup_releases_old_chain_after_fade() {
        let (mut voices, mut device, mut renderer) = setup();
        voices.create_voice(&mut device, 0, &sine()).unwrap();
        let old = chain(&voices, 0);
        voices.crossfade_waveform(&mut device, 0, &saw(), 30.0).unwrap();
        let new = chain(&voices, 0);

        let now = device.current_time();
        assert_eq!(voices.poll_cleanup(&mut device, now), 0);

        advance(&mut renderer, 0.1);
        let now = device.current_time();
        assert_eq!(voices.poll_cleanup(&mut device, now), 1);
        assert!(!device.is_live(old.playback));
        assert!(device.is_live(new.playback));
    }

    #[test]
    fn destroy_cancels_pending_cleanup() {
        let (mut voices, mut device, mut renderer) = setup();
        voices.create_voice(&mut device, 0, &sine()).unwrap();
        let old = chain(&voices, 0);
        voices.crossfade_waveform(&mut device, 0, &saw(), 30.0).unwrap();
        let new = chain(&voices, 0);

        voices.destroy_voice(&mut device, 0).unwrap();
        assert_eq!(voices.pending_cleanups(), 0);
        assert!(!device.is_live(old.playback));
        assert!(!device.is_live(new.playback));
        assert!(!voices.slot(0).unwrap().is_active());

        advance(&mut renderer, 0.2);
        let now = device.current_time();
        assert_eq!(voices.poll_cleanup(&mut device, now), 0);
    }

    #[test]
    fn cancelled_token_releases_immediately() {
        let (mut voices, mut device, _renderer) = setup();
        voices.create_voice(&mut device, 0, &sine()).unwrap();
        let old = chain(&voices, 0);
        let token = voices
            .crossfade_waveform(&mut device, 0, &saw(), 30.0)
            .unwrap()
            .unwrap();

        assert!(voices.cancel_cleanup(&mut device, token));
        assert!(!device.is_live(old.playback));
        assert!(!voices.cancel_cleanup(&mut device, token));
    }

    #[test]
    fn destroy_tolerates_stopped_playback() {
        let (mut voices, mut device, _renderer) = setup();
        voices.create_voice(&mut device, 0, &sine()).unwrap();
        let current = chain(&voices, 0);
        device.stop(current.playback).unwrap();

        assert_eq!(voices.destroy_voice(&mut device, 0), Ok(()));
        assert!(!device.is_live(current.envelope_gain));
    }

    #[test]
    fn note_on_and_off_schedule_envelope_ramps() {
        let (mut voices, mut device, mut renderer) = setup();
        voices.create_voice(&mut device, 0, &sine()).unwrap();
        let envelope_gain = chain(&voices, 0).envelope_gain;

        voices.note_on(&mut device).unwrap();
        let timeline = device.timeline(envelope_gain, ParamKind::Gain).unwrap();
        assert_eq!(timeline.value_at(device.current_time()), 0.0);
        assert!((timeline.final_value() - 0.7).abs() < 1e-6);

        advance(&mut renderer, 0.2);
        voices.note_off(&mut device).unwrap();
        let timeline = device.timeline(envelope_gain, ParamKind::Gain).unwrap();
        assert!((timeline.value_at(device.current_time()) - 0.7).abs() < 1e-6);
        assert_eq!(timeline.final_value(), 0.0);
    }

    #[test]
    fn retrigger_continues_from_current_gain() {
        let (mut voices, mut device, mut renderer) = setup();
        voices.create_voice(&mut device, 0, &sine()).unwrap();
        let envelope_gain = chain(&voices, 0).envelope_gain;
        voices.note_on(&mut device).unwrap();
        advance(&mut renderer, 0.5);

        let before = device.param_value(envelope_gain, ParamKind::Gain).unwrap();
        voices.note_on(&mut device).unwrap();
        let after = device.param_value(envelope_gain, ParamKind::Gain).unwrap();
        assert!((before - 0.7).abs() < 1e-6);
        assert!((after - before).abs() < 1e-6, "before {before} after {after}");

        let peak_at = device.current_time() + EnvelopeParams::default().attack as f64;
        let timeline = device.timeline(envelope_gain, ParamKind::Gain).unwrap();
        assert!((timeline.value_at(peak_at) - 1.0).abs() < 1e-4);
        assert!((timeline.final_value() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn envelope_edit_moves_sustaining_gain() {
        let (mut voices, mut device, mut renderer) = setup();
        voices.create_voice(&mut device, 0, &sine()).unwrap();
        let envelope_gain = chain(&voices, 0).envelope_gain;
        voices.note_on(&mut device).unwrap();
        advance(&mut renderer, 0.2);

        voices.set_envelope(EnvelopeParams::adsr(0.01, 0.1, 0.3, 0.3));
        voices.reschedule_envelopes(&mut device).unwrap();
        let timeline = device.timeline(envelope_gain, ParamKind::Gain).unwrap();
        assert!((timeline.value_at(device.current_time()) - 0.7).abs() < 1e-6);
        assert!((timeline.final_value() - 0.3).abs() < 1e-6);

        advance(&mut renderer, 0.05);
        let sustaining = device.param_value(envelope_gain, ParamKind::Gain).unwrap();
        assert!((sustaining - 0.3).abs() < 1e-6);

        voices.note_off(&mut device).unwrap();
        let at_release = device.param_value(envelope_gain, ParamKind::Gain).unwrap();
        assert!((at_release - sustaining).abs() < 1e-6);
    }

    #[test]
    fn filter_envelope_retrigger_keeps_cutoff() {
        let (mut voices, mut device, mut renderer) = setup();
        voices.set_filter(&mut device, 1_000.0, 0.0).unwrap();
        voices
            .set_filter_envelope(&mut device, EnvelopeParams::default(), true)
            .unwrap();
        voices.note_on(&mut device).unwrap();
        advance(&mut renderer, 0.5);

        let stage = voices.output().unwrap().stages[0];
        let before = device.param_value(stage, ParamKind::Frequency).unwrap();
        voices.note_on(&mut device).unwrap();
        let after = device.param_value(stage, ParamKind::Frequency).unwrap();
        assert!((before - filter_envelope_cutoff(1_000.0, 0.7)).abs() < 0.01);
        assert!((after - before).abs() < 0.01);
    }

    #[test]
    fn failed_release_is_retried_on_cleanup() {
        let (mut device, mut renderer) = SoftwareDevice::new(SAMPLE_RATE, 64);
        let mut voices = VoiceGraphManager::new(&EngineConfig::default());
        voices.build_output(&mut device).unwrap();
        voices.create_voice(&mut device, 0, &sine()).unwrap();
        advance(&mut renderer, 0.01);
        let before = device.node_count();

        let stage = voices.output().unwrap().stages[0];
        while device.set_now(stage, ParamKind::Q, 0.5).is_ok() {}

        voices.destroy_voice(&mut device, 0).unwrap();
        assert_eq!(voices.unreleased_nodes().len(), 5);
        assert_eq!(device.node_count(), before);

        advance(&mut renderer, 0.01);
        let now = device.current_time();
        voices.poll_cleanup(&mut device, now);
        assert!(voices.unreleased_nodes().is_empty());
        assert_eq!(device.node_count(), before - 5);
    }

    #[test]
    fn filter_stages_follow_resonance() {
        let (mut voices, mut device, _renderer) = setup();
        voices.set_filter(&mut device, 1_000.0, 20.0).unwrap();

        let output = *voices.output().unwrap();
        for (stage, q) in output.stages.iter().zip(stage_qs(20.0)) {
            assert!((device.param_value(*stage, ParamKind::Q).unwrap() - q).abs() < 1e-6);
            assert_eq!(
                device.param_value(*stage, ParamKind::Frequency),
                Some(1_000.0)
            );
        }
    }

    #[test]
    fn filter_envelope_reissues_around_new_cutoff() {
        let (mut voices, mut device, mut renderer) = setup();
        voices
            .set_filter_envelope(&mut device, EnvelopeParams::default(), true)
            .unwrap();
        voices.note_on(&mut device).unwrap();
        advance(&mut renderer, 0.2);

        voices.apply_cutoff(&mut device, 1_000.0).unwrap();
        let stage = voices.output().unwrap().stages[0];
        let cutoff = device.param_value(stage, ParamKind::Frequency).unwrap();
        assert!((cutoff - filter_envelope_cutoff(1_000.0, 0.7)).abs() < 0.01);
        assert_eq!(voices.cutoff(), DEFAULT_CUTOFF_HZ);
    }

    #[test]
    fn waveform_change_recreates_or_crossfades() {
        let (mut voices, mut device, _renderer) = setup();
        voices.create_voice(&mut device, 0, &sine()).unwrap();

        let first = chain(&voices, 0);
        voices.apply_waveform(&mut device, &saw(), false).unwrap();
        assert_ne!(chain(&voices, 0).playback, first.playback);
        assert_eq!(voices.pending_cleanups(), 0);

        voices.note_on(&mut device).unwrap();
        voices.apply_waveform(&mut device, &sine(), true).unwrap();
        assert_eq!(voices.pending_cleanups(), 1);
    }

    #[test]
    fn rebuild_recreates_active_slots() {
        let (mut voices, mut device, _renderer) = setup();
        voices.create_voice(&mut device, 0, &sine()).unwrap();
        voices.create_voice(&mut device, 2, &sine()).unwrap();
        let before = (chain(&voices, 0), *voices.output().unwrap());

        voices.rebuild(&mut device, &saw()).unwrap();

        assert_ne!(chain(&voices, 0).playback, before.0.playback);
        assert!(voices.slot(2).unwrap().chain().is_some());
        assert!(voices.slot(1).unwrap().chain().is_none());
        assert_ne!(voices.output().unwrap().mixer, before.1.mixer);
        assert!(!device.is_live(before.1.master));
    }

    #[test]
    fn voice_tap_reads_oscillator_output() {
        let (mut voices, mut device, mut renderer) = setup();
        voices
            .create_voice(&mut device, 0, &WaveformBuffer::from(vec![0.5; 2048]))
            .unwrap();
        advance(&mut renderer, 0.01);

        let first = voices.read_voice_tap(&mut device, 0, TapReadMode::FirstSample);
        assert!((first - 0.5).abs() < 1e-6);
        assert_eq!(
            voices.read_voice_tap(&mut device, 1, TapReadMode::FirstSample),
            0.0
        );
    }
}
