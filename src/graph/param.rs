/*
Parameter Automation
====================

Every node parameter on the output device (a gain, a playback rate, a cutoff)
is a timeline of scheduled events rather than a plain number. The control
thread schedules; the render path evaluates the timeline once per sample (or
once per block for filter coefficients).

Commands
--------

  CancelScheduled { from }          drop every event at or after `from`
  SetValueAt { value, time }        jump to `value` at `time`
  LinearRampTo { value, end_time }  glide from the PREVIOUS event's
                                    (time, value) to `value` at `end_time`

Evaluating at time t:

    events:   Set(0.0 @ 1.0)        Ramp(1.0 @ 1.5)
                   │                      │
    value:  ───────●══════════════════════●──────────
                  0.0      ramp          1.0

      t < 1.0        → default value
      1.0 ≤ t < 1.5  → 0.0 + (1.0 - 0.0) · (t - 1.0) / 0.5
      t ≥ 1.5        → 1.0

A ramp that has nothing before it holds the default until it is reached, so
callers always pair a ramp with a preceding SetValueAt at "now". That pairing
is also how a cancelled ramp avoids a jump: read the current value, cancel,
set the current value, then schedule the new ramp.

History before "now" is pruned down to a single anchor event so timelines
don't grow without bound.
*/

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RampCommand {
    CancelScheduled { from: f64 },
    SetValueAt { value: f32, time: f64 },
    LinearRampTo { value: f32, end_time: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamEvent {
    Set { value: f32, time: f64 },
    Ramp { value: f32, end_time: f64 },
}

impl ParamEvent {
    pub fn time(&self) -> f64 {
        match *self {
            ParamEvent::Set { time, .. } => time,
            ParamEvent::Ramp { end_time, .. } => end_time,
        }
    }

    pub fn value(&self) -> f32 {
        match *self {
            ParamEvent::Set { value, .. } | ParamEvent::Ramp { value, .. } => value,
        }
    }
}

/// Room reserved up front so scheduling on the render path does not grow
/// the event list in the common case.
const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct ParamTimeline {
    default: f32,
    events: Vec<ParamEvent>,
}

impl ParamTimeline {
    pub fn new(value: f32) -> Self {
        Self {
            default: value,
            events: Vec::with_capacity(EVENT_CAPACITY),
        }
    }

    pub fn apply(&mut self, command: RampCommand) {
        match command {
            RampCommand::CancelScheduled { from } => self.events.retain(|e| e.time() < from),
            RampCommand::SetValueAt { value, time } => self.insert(ParamEvent::Set { value, time }),
            RampCommand::LinearRampTo { value, end_time } => {
                self.insert(ParamEvent::Ramp { value, end_time })
            }
        }
    }

    fn insert(&mut self, event: ParamEvent) {
        // Equal times keep insertion order
        let index = self.events.partition_point(|e| e.time() <= event.time());
        self.events.insert(index, event);
    }

    pub fn value_at(&self, t: f64) -> f32 {
        let index = self.events.partition_point(|e| e.time() <= t);

        let (anchor_time, anchor_value) = match index.checked_sub(1) {
            Some(prev) => (Some(self.events[prev].time()), self.events[prev].value()),
            None => (None, self.default),
        };

        match (self.events.get(index), anchor_time) {
            (Some(&ParamEvent::Ramp { value, end_time }), Some(t0)) if end_time > t0 => {
                let progress = ((t - t0) / (end_time - t0)) as f32;
                anchor_value + (value - anchor_value) * progress
            }
            _ => anchor_value,
        }
    }

    /// Collapse everything at or before `now` into one anchor event.
    pub fn prune(&mut self, now: f64) {
        let index = self.events.partition_point(|e| e.time() <= now);
        if index == 0 {
            return;
        }

        let anchor = self.events[index - 1];
        self.events.drain(..index - 1);
        self.events[0] = ParamEvent::Set {
            value: anchor.value(),
            time: anchor.time(),
        };
        self.default = anchor.value();
    }

    pub fn events(&self) -> &[ParamEvent] {
        &self.events
    }

    /// Value once every scheduled event has played out.
    pub fn final_value(&self) -> f32 {
        self.events.last().map_or(self.default, |e| e.value())
    }
}
