//! Simulated step hardware: a recording step/direction port and the
//! two-channel step timer, driven in virtual time by the machine.

use motion::N_AXIS;
use serde::Serialize;
use stepper::{StepPort, StepTimer, DIRECTION_SHIFT};

/// One recorded port write, for trace dumps and scenario assertions.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TraceEntry {
    /// Virtual time of the write, in timer cycles.
    pub clock: u64,
    /// The raw bits driven onto the port.
    pub bits: u8,
}

/// Step/direction port that decodes its own edge stream: it counts step
/// pulses per axis and integrates them into a position, which scenario
/// tests compare against the planner's bookkeeping.
#[derive(Debug)]
pub struct SimStepPort {
    invert_mask: u8,
    last_logical: u8,
    clock: u64,
    pub enabled: bool,
    /// Rising step edges seen per axis.
    pub pulses: [u64; N_AXIS],
    /// Position integrated from pulses and direction lines.
    pub position: [i64; N_AXIS],
    /// Raw write log; only populated when `trace_enabled` is set.
    pub trace: Vec<TraceEntry>,
    pub trace_enabled: bool,
}

impl SimStepPort {
    pub fn new(invert_mask: u8) -> Self {
        Self {
            invert_mask,
            last_logical: 0,
            clock: 0,
            enabled: false,
            pulses: [0; N_AXIS],
            position: [0; N_AXIS],
            trace: Vec::new(),
            trace_enabled: false,
        }
    }

    /// Update the decode polarity after a settings change.
    pub fn set_invert_mask(&mut self, invert_mask: u8) {
        self.invert_mask = invert_mask;
    }

    pub fn set_clock(&mut self, clock: u64) {
        self.clock = clock;
    }
}

impl StepPort for SimStepPort {
    fn write(&mut self, bits: u8) {
        if self.trace_enabled {
            self.trace.push(TraceEntry {
                clock: self.clock,
                bits,
            });
        }
        let logical = bits ^ self.invert_mask;
        for i in 0..N_AXIS {
            let step_bit = 1u8 << i;
            if logical & step_bit != 0 && self.last_logical & step_bit == 0 {
                self.pulses[i] += 1;
                if logical & (step_bit << DIRECTION_SHIFT) != 0 {
                    self.position[i] -= 1;
                } else {
                    self.position[i] += 1;
                }
            }
        }
        self.last_logical = logical;
    }

    fn set_enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// The simulated timer block. The machine reads `period`, `running`, and
/// drains `pulse_armed` to schedule virtual-time events.
#[derive(Debug, Default)]
pub struct SimStepTimer {
    pub period: u32,
    pub running: bool,
    /// One-shot pulse delay armed by the executor, in cycles from "now".
    pub pulse_armed: Option<u32>,
    /// Reload history, newest last; used by tests asserting rate
    /// monotonicity.
    pub period_log: Vec<u32>,
    pub log_periods: bool,
}

impl StepTimer for SimStepTimer {
    fn set_period(&mut self, cycles: u32) {
        self.period = cycles;
        if self.log_periods {
            self.period_log.push(cycles);
        }
    }

    fn arm_pulse_reset(&mut self, cycles: u32) {
        self.pulse_armed = Some(cycles);
    }

    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }
}
