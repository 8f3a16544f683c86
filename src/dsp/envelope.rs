#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{dsp::filter::MAX_CUTOFF_HZ, graph::param::RampCommand, MIN_TIME};

/*
ADSR Envelope Implementation
============================

The envelope lives in two places at once:

  1. On the output device, as pre-scheduled ramp commands on a gain (or
     cutoff) parameter. These are issued once at note-on and once at
     note-off; the render path realizes them sample by sample.

  2. On the control thread, as a pull-based evaluator. Given the current time
     it reports which stage we're in and the representative level. The
     modulation matrix reads this; nothing else needs it every tick.

The ramps are derived from the evaluator's stages and targets, but the device
always continues from the value it holds. After a retrigger the evaluator
restarts at zero while the device climbs from its current gain; both reach
the peak together.

Vocabulary
----------

  level        The envelope's output (0.0 to 1.0) before range mapping.

  stage        Idle, Attack, Decay, Sustain or Release.

  stage_start  Absolute time (seconds, device clock) the current stage began.
               Every level is computed from  elapsed = now - stage_start.


The Shape: Linear Ramps
-----------------------

  Level
    1.0 ┐     ╱╲
        │    ╱  ╲___________
    S   │   ╱               ╲
        │  ╱                 ╲
    0.0 └─╱───────────────────╲──→ Time
        Attack Decay  Sustain  Release

  attack   level = min(1, elapsed / attack)
  decay    level = 1 - (1 - S) · elapsed / decay
  sustain  level = S
  release  level = L₀ · (1 - elapsed / release)     L₀ = level at note_off

Stage boundaries advance stage_start by exactly the stage length, so a sparse
caller (one query per control tick) still sees the same curve as a dense one.


Gate Behavior
-------------

  note_on   Always restarts Attack from zero, whatever the current stage.
  note_off  Moves to Release only from Attack, Decay or Sustain. Idle and
            Release ignore it. Release starts from the CURRENT level, so
            letting go during the attack doesn't jump up to sustain first.


Ramp Commands
-------------

`ramps_continuing(now, current, map)` turns the remaining curve into device
commands:

    cancel scheduled values from `now`
    set value  current                      at now
    ramp to    map(next stage target)       at stage boundary
    ...

`current` is what the device holds at `now`, so a retrigger or an edit of
the envelope never steps. `ramps_from` is the same with `current` taken
from the evaluator, for a freshly built node.

Sustain and Idle have no boundary ahead. They still get a short glide onto
map(level), so a new sustain level or envelope amount lands on the device
without a click.

`map` converts a level into the parameter's units. For an amplitude envelope
that is the envelope-amount range; for the filter envelope it is a cutoff
in Hz. Cancelling first means a retrigger never races a stale ramp.
*/

/// Glide used to move a held level onto a new target.
pub const RETARGET_TIME: f64 = 0.005;

/// Seconds per UI unit for attack/decay/release (0-100 → 0-2 s).
pub const UI_SECONDS_PER_UNIT: f32 = 0.02;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeParams {
    pub attack: f32,  // seconds to ramp 0 → 1
    pub decay: f32,   // seconds to ramp 1 → sustain
    pub sustain: f32, // level to hold (0.0 - 1.0)
    pub release: f32, // seconds to ramp current → 0
}

impl EnvelopeParams {
    pub fn adsr(attack: f32, decay: f32, sustain: f32, release: f32) -> Self {
        Self {
            attack: attack.max(MIN_TIME),
            decay: decay.max(MIN_TIME),
            sustain: sustain.clamp(0.0, 1.0),
            release: release.max(MIN_TIME),
        }
    }

    /// Convert editor units (each 0-100) into seconds and a sustain level.
    pub fn from_ui(attack: f32, decay: f32, sustain: f32, release: f32) -> Self {
        let seconds = |ui: f32| ui.clamp(0.0, 100.0) * UI_SECONDS_PER_UNIT;
        Self::adsr(
            seconds(attack),
            seconds(decay),
            sustain.clamp(0.0, 100.0) / 100.0,
            seconds(release),
        )
    }
}

impl Default for EnvelopeParams {
    fn default() -> Self {
        Self::adsr(0.01, 0.1, 0.7, 0.3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeStage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    params: EnvelopeParams,
    stage: EnvelopeStage,
    stage_start: f64,
    level: f32,
    release_level: f32, // level captured at note_off
}

impl Envelope {
    pub fn new(params: EnvelopeParams) -> Self {
        Self {
            params,
            stage: EnvelopeStage::Idle,
            stage_start: 0.0,
            level: 0.0,
            release_level: 0.0,
        }
    }

    pub fn params(&self) -> EnvelopeParams {
        self.params
    }

    /// New times apply from the next evaluation; the current stage keeps its
    /// start time.
    pub fn set_params(&mut self, params: EnvelopeParams) {
        self.params = params;
    }

    /// Gate high: restart the attack from zero.
    pub fn note_on(&mut self, now: f64) {
        self.stage = EnvelopeStage::Attack;
        self.stage_start = now;
        self.level = 0.0;
    }

    /// Gate low: release from whatever level was reached.
    pub fn note_off(&mut self, now: f64) {
        if matches!(self.stage, EnvelopeStage::Idle | EnvelopeStage::Release) {
            return;
        }

        self.advance(now);
        if self.stage == EnvelopeStage::Idle {
            return;
        }

        self.release_level = self.level;
        self.stage = EnvelopeStage::Release;
        self.stage_start = now;
    }

    /// Evaluate the envelope at `now`, advancing stages as needed.
    pub fn value(&mut self, now: f64) -> f32 {
        self.advance(now);
        self.level
    }

    fn advance(&mut self, now: f64) {
        loop {
            let elapsed = (now - self.stage_start).max(0.0) as f32;
            let p = self.params;

            match self.stage {
                EnvelopeStage::Idle => {
                    self.level = 0.0;
                    return;
                }
                EnvelopeStage::Attack => {
                    if elapsed >= p.attack {
                        self.level = 1.0;
                        self.stage = EnvelopeStage::Decay;
                        self.stage_start += p.attack as f64;
                        continue;
                    }
                    self.level = (elapsed / p.attack).min(1.0);
                    return;
                }
                EnvelopeStage::Decay => {
                    if elapsed >= p.decay {
                        self.level = p.sustain;
                        self.stage = EnvelopeStage::Sustain;
                        self.stage_start += p.decay as f64;
                        continue;
                    }
                    self.level = 1.0 - (1.0 - p.sustain) * elapsed / p.decay;
                    return;
                }
                EnvelopeStage::Sustain => {
                    self.level = p.sustain;
                    return;
                }
                EnvelopeStage::Release => {
                    if elapsed >= p.release {
                        self.level = 0.0;
                        self.stage = EnvelopeStage::Idle;
                        self.stage_start += p.release as f64;
                        return;
                    }
                    self.level = (self.release_level * (1.0 - elapsed / p.release)).max(0.0);
                    return;
                }
            }
        }
    }

    /// Device commands that reproduce the envelope from `now` onward, with
    /// each level passed through `map`.
    pub fn ramps_from(&mut self, now: f64, map: impl Fn(f32) -> f32) -> Vec<RampCommand> {
        self.advance(now);
        let current = map(self.level);
        self.ramps_continuing(now, current, map)
    }

    /// Like [`ramps_from`](Self::ramps_from), but the parameter carries on
    /// from `current` instead of jumping to the evaluated level.
    pub fn ramps_continuing(
        &mut self,
        now: f64,
        current: f32,
        map: impl Fn(f32) -> f32,
    ) -> Vec<RampCommand> {
        let mut commands = vec![
            RampCommand::CancelScheduled { from: now },
            RampCommand::SetValueAt {
                value: current,
                time: now,
            },
        ];
        commands.extend(self.remaining_ramps(now, map));
        commands
    }

    /// Only the ramps still ahead of `now`, without the cancel/set prefix.
    pub fn remaining_ramps(&mut self, now: f64, map: impl Fn(f32) -> f32) -> Vec<RampCommand> {
        self.advance(now);

        let mut commands = Vec::with_capacity(2);
        let p = self.params;
        let start = self.stage_start;
        match self.stage {
            EnvelopeStage::Idle | EnvelopeStage::Sustain => {
                commands.push(RampCommand::LinearRampTo {
                    value: map(self.level),
                    end_time: now + RETARGET_TIME,
                });
            }
            EnvelopeStage::Attack => {
                let peak_time = start + p.attack as f64;
                commands.push(RampCommand::LinearRampTo {
                    value: map(1.0),
                    end_time: peak_time,
                });
                commands.push(RampCommand::LinearRampTo {
                    value: map(p.sustain),
                    end_time: peak_time + p.decay as f64,
                });
            }
            EnvelopeStage::Decay => {
                commands.push(RampCommand::LinearRampTo {
                    value: map(p.sustain),
                    end_time: start + p.decay as f64,
                });
            }
            EnvelopeStage::Release => {
                commands.push(RampCommand::LinearRampTo {
                    value: map(0.0),
                    end_time: start + p.release as f64,
                });
            }
        }

        commands
    }

    /// Last evaluated level (0.0 to 1.0).
    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn stage(&self) -> EnvelopeStage {
        self.stage
    }

    /// True unless idle. Reflects the last evaluation.
    pub fn is_active(&self) -> bool {
        self.stage != EnvelopeStage::Idle
    }

    pub fn reset(&mut self) {
        self.stage = EnvelopeStage::Idle;
        self.level = 0.0;
        self.release_level = 0.0;
    }
}

/// How strongly the amplitude envelope shapes the output, in percent.
///
/// 0% maps every level to 1.0 (no shaping); 100% maps levels onto [0, 1].
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeAmount(f32);

impl EnvelopeAmount {
    pub fn from_percent(percent: f32) -> Self {
        Self(percent.clamp(0.0, 100.0))
    }

    pub fn percent(&self) -> f32 {
        self.0
    }

    /// Output value at envelope level 0.
    pub fn floor(&self) -> f32 {
        1.0 - self.0 / 100.0
    }

    pub fn apply(&self, level: f32) -> f32 {
        let floor = self.floor();
        floor + (1.0 - floor) * level
    }
}

impl Default for EnvelopeAmount {
    fn default() -> Self {
        Self(100.0)
    }
}

/// Cutoff reached by the filter envelope at `level`: the path runs from the
/// base cutoff up to `min(20 kHz, 4 × base)`.
pub fn filter_envelope_cutoff(base_cutoff: f32, level: f32) -> f32 {
    let peak = (4.0 * base_cutoff).min(MAX_CUTOFF_HZ).max(base_cutoff);
    base_cutoff + (peak - base_cutoff) * level
}
