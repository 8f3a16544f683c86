use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::engine::{
    matrix::ModulationMatrix,
    params::{Modulatable, ParameterAddress},
    sources::SourceReader,
    EngineConfig,
};

/*
Modulation Scheduler
====================

The control-rate loop. The host calls `tick` once per frame (or every
~10 ms); each call is one pass:

    no routes      →  Idle   (nothing read, nothing written)
    routes exist   →  1. read every active source into the matrix
                      2. for every registered parameter:
                            base  = host.get_param(p)
                            value = matrix.get_modulated_value(p, base)
                            host.apply_modulation(p, base, value)

Parameters without routes resolve to their base, so step 2 also keeps
unrouted parameters pinned to what the user set.

Two limits apply to a tick's duration:

    budget      (10 ms)  over it the tick reports `over_budget` and logs at debug
    warning     (14 ms)  over it the tick also logs a warning and is counted

The work is never skipped or throttled.
*/

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    Stopped,
    Idle,
    Applied {
        parameters: usize,
        elapsed: Duration,
        over_budget: bool,
    },
}

#[derive(Debug)]
pub struct ModulationScheduler {
    running: bool,
    budget: Duration,
    warn_threshold: Duration,
    ticks: u64,
    overruns: u64,
}

impl ModulationScheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            running: false,
            budget: Duration::from_secs_f32(config.tick_budget_ms.max(0.0) / 1000.0),
            warn_threshold: Duration::from_secs_f32(config.tick_warning_ms.max(0.0) / 1000.0),
            ticks: 0,
            overruns: 0,
        }
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Ticks that went past the warning threshold.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn tick<H>(&mut self, matrix: &mut ModulationMatrix, host: &mut H) -> TickOutcome
    where
        H: SourceReader + Modulatable<Param = ParameterAddress>,
    {
        if !self.running {
            return TickOutcome::Stopped;
        }
        self.ticks += 1;

        if !matrix.has_routes() {
            return TickOutcome::Idle;
        }

        let started = Instant::now();
        matrix.refresh_source_values(host);

        let addresses: Vec<ParameterAddress> =
            matrix.parameters().map(|meta| meta.address).collect();
        for &address in &addresses {
            let base = host.get_param(address);
            let value = matrix.get_modulated_value(address, base);
            host.apply_modulation(address, base, value);
        }

        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let over_budget = elapsed > self.budget;
        if elapsed > self.warn_threshold {
            self.overruns += 1;
            warn!(
                elapsed_ms,
                threshold_ms = self.warn_threshold.as_secs_f64() * 1000.0,
                parameters = addresses.len(),
                "modulation tick too slow"
            );
        } else if over_budget {
            debug!(
                elapsed_ms,
                budget_ms = self.budget.as_secs_f64() * 1000.0,
                "modulation tick over budget"
            );
        } else {
            trace!(elapsed_us = elapsed.as_micros() as u64, "modulation tick");
        }

        TickOutcome::Applied {
            parameters: addresses.len(),
            elapsed,
            over_budget,
        }
    }
}
