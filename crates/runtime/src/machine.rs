//! The machine aggregate and its runtime coordinator.
//!
//! Foreground code (the protocol layer) calls into [`Machine`]; hardware
//! interrupts are modeled as virtual-time events dispatched from
//! [`Machine::dispatch_next`]. Real-time commands arrive asynchronously as
//! bits in the shared [`ExecFlags`] set and are consumed here, in
//! [`Machine::service_pending`], never in interrupt context.

use std::sync::Arc;
use std::time::Duration;

use motion::{
    Appended, BlockBuffer, ExecFlags, FeedRate, MachineState, PlanError, Planner, PlannerConfig,
    SystemState, N_AXIS,
};
use stepper::{StepPort, Stepper, StepperConfig};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::devices::{SimStepPort, SimStepTimer};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MachineError {
    /// Motion is locked out until the alarm is explicitly cleared.
    #[error("alarm lock")]
    AlarmLock,
    #[error("invalid feed rate")]
    InvalidFeedRate,
    /// The operation needs an idle machine.
    #[error("machine is busy")]
    NotIdle,
    /// The virtual clock exceeded its event budget; something never
    /// settled.
    #[error("virtual clock ran away after {0} events")]
    Runaway(u64),
}

/// The whole machine: planner, stepper, shared state, and the simulated
/// hardware it executes against.
pub struct Machine {
    pub planner_cfg: PlannerConfig,
    pub stepper_cfg: StepperConfig,
    pub sys: SystemState,
    flags: Arc<ExecFlags>,
    pub buffer: BlockBuffer,
    pub planner: Planner,
    pub stepper: Stepper,
    pub port: SimStepPort,
    pub timer: SimStepTimer,
    clock: u64,
    next_step_at: u64,
    pulse_at: Option<u64>,
    hold_complete: bool,
    alarm_reason: Option<&'static str>,
    reset_count: u32,
}

impl Machine {
    pub fn new(planner_cfg: PlannerConfig, stepper_cfg: StepperConfig) -> Self {
        let port = SimStepPort::new(stepper_cfg.invert_mask);
        let stepper = Stepper::new(&stepper_cfg);
        Self {
            planner_cfg,
            stepper_cfg,
            sys: SystemState::new(),
            flags: Arc::new(ExecFlags::new()),
            buffer: BlockBuffer::new(),
            planner: Planner::new(),
            stepper,
            port,
            timer: SimStepTimer::default(),
            clock: 0,
            next_step_at: 0,
            pulse_at: None,
            hold_complete: false,
            alarm_reason: None,
            reset_count: 0,
        }
    }

    /// Finish boot: idle, or alarm-locked when homing is enforced.
    pub fn boot(&mut self, homing_lock: bool) {
        if self.sys.state != MachineState::Init {
            return;
        }
        self.sys.state = if homing_lock {
            MachineState::Alarm
        } else {
            MachineState::Idle
        };
        info!(state = ?self.sys.state, "machine booted");
    }

    /// Shared handle for the real-time serial path.
    pub fn flags(&self) -> Arc<ExecFlags> {
        Arc::clone(&self.flags)
    }

    pub fn state(&self) -> MachineState {
        self.sys.state
    }

    pub fn position_steps(&self) -> [i32; N_AXIS] {
        self.sys.position
    }

    pub fn is_hold_complete(&self) -> bool {
        self.hold_complete
    }

    /// Alarm text to report, if one is pending. Clears on read.
    pub fn take_alarm_message(&mut self) -> Option<&'static str> {
        self.alarm_reason.take()
    }

    /// Monotonic count of machine resets, so the protocol layer can
    /// re-announce itself after an abort.
    pub fn reset_count(&self) -> u32 {
        self.reset_count
    }

    /// Push new settings-derived tuning into the running machine.
    pub fn apply_settings(
        &mut self,
        planner_cfg: PlannerConfig,
        stepper_cfg: StepperConfig,
        auto_start: bool,
    ) {
        self.port.set_invert_mask(stepper_cfg.invert_mask);
        self.planner_cfg = planner_cfg;
        self.stepper_cfg = stepper_cfg;
        self.sys.auto_start = auto_start;
    }

    /// Queue a straight move. Parks cooperatively while the block buffer
    /// is full, servicing pending runtime commands and draining the
    /// stepper in virtual time until a slot frees.
    pub fn plan_line(
        &mut self,
        target_mm: [f32; N_AXIS],
        feed: FeedRate,
    ) -> Result<(), MachineError> {
        if self.sys.state == MachineState::Alarm {
            return Err(MachineError::AlarmLock);
        }
        loop {
            match self
                .planner
                .append_line(&mut self.buffer, &self.planner_cfg, target_mm, feed)
            {
                Ok(Appended::Planned) => {
                    self.on_block_committed();
                    return Ok(());
                }
                Ok(Appended::Dropped) => return Ok(()),
                Err(PlanError::BufferFull) => {
                    self.service_pending();
                    if self.sys.state == MachineState::Alarm {
                        return Err(MachineError::AlarmLock);
                    }
                    if !self.dispatch_some(512) {
                        // Nothing drains by itself; wait for an external
                        // runtime command (e.g. cycle start).
                        std::thread::sleep(Duration::from_micros(200));
                    }
                }
                Err(PlanError::InvalidFeedRate) => return Err(MachineError::InvalidFeedRate),
            }
        }
    }

    fn on_block_committed(&mut self) {
        if self.sys.state == MachineState::Idle {
            self.sys.state = MachineState::Queued;
            if self.sys.auto_start {
                self.start_cycle();
            }
        }
    }

    /// Consume pending runtime commands and apply the state machine.
    /// `STATUS_REPORT` is deliberately left set for the protocol layer.
    pub fn service_pending(&mut self) {
        if self.flags.take(ExecFlags::ABORT) {
            self.abort();
        }
        if self.flags.take(ExecFlags::RESET_ALARM) {
            self.unlock_alarm();
        }
        if self.flags.take(ExecFlags::FEED_HOLD) && self.sys.state == MachineState::Cycle {
            info!("feed hold");
            self.sys.state = MachineState::Hold;
            self.hold_complete = false;
        }
        if self.flags.take(ExecFlags::FEED_HOLD_COMPLETE) {
            debug!("feed hold complete");
            self.hold_complete = true;
        }
        if self.flags.take(ExecFlags::CYCLE_STOP) {
            match self.sys.state {
                MachineState::Cycle | MachineState::Queued | MachineState::Homing => {
                    if self.buffer.is_empty() && !self.stepper.is_running() {
                        debug!("cycle complete");
                        self.sys.state = MachineState::Idle;
                        // Idle lock: drop the enable line once the queue
                        // drains, unless configured to hold forever.
                        if self.stepper_cfg.idle_lock_time_ms != 255 {
                            self.port.set_enable(self.stepper_cfg.invert_step_enable);
                        }
                    }
                }
                MachineState::Hold => {
                    // Ran out of blocks while decelerating: the machine is
                    // at rest either way.
                    self.hold_complete = true;
                }
                _ => {}
            }
        }
        if self.flags.take(ExecFlags::CYCLE_START) {
            self.cycle_start();
        }
    }

    fn cycle_start(&mut self) {
        if self.sys.state == MachineState::Hold {
            if !self.hold_complete {
                // Still decelerating; the start is ignored, not queued.
                return;
            }
            self.resume_from_hold();
        }
        if self.sys.state == MachineState::Queued {
            self.start_cycle();
        }
    }

    fn start_cycle(&mut self) {
        if self.sys.state != MachineState::Queued || self.buffer.is_empty() {
            return;
        }
        debug!("cycle start");
        self.sys.state = MachineState::Cycle;
        self.wake_stepper();
    }

    fn resume_from_hold(&mut self) {
        if self.stepper.has_block() {
            let remaining = self
                .buffer
                .current()
                .map(|block| block.step_event_count - self.stepper.step_events_completed())
                .unwrap_or(0);
            self.planner.cycle_reinitialize(&mut self.buffer, remaining);
            self.stepper.restart_block();
        } else if let Some(block) = self.buffer.current() {
            // Held across a block boundary: restart the queue from rest.
            let full_count = block.step_event_count;
            self.planner.cycle_reinitialize(&mut self.buffer, full_count);
        }
        self.hold_complete = false;
        self.sys.state = if self.buffer.is_empty() && !self.stepper.has_block() {
            MachineState::Idle
        } else {
            MachineState::Queued
        };
    }

    fn wake_stepper(&mut self) {
        let was_running = self.timer.running;
        self.stepper
            .wake_up(&self.stepper_cfg, &mut self.port, &mut self.timer);
        if self.timer.running && !was_running {
            self.next_step_at = self.clock + self.timer.period as u64;
        }
    }

    /// Latched fault from the limit inputs: disarm the stepper within the
    /// current pulse period and lock the machine out.
    pub fn trigger_hard_limit(&mut self) {
        warn!("hard limit triggered");
        self.stepper.go_idle(&mut self.timer);
        self.sys.state = MachineState::Alarm;
        self.alarm_reason = Some("Hard limit");
        self.flags.set(ExecFlags::ABORT);
    }

    fn abort(&mut self) {
        let was_alarm = self.sys.state == MachineState::Alarm;
        let was_moving = self.stepper.is_running()
            || matches!(
                self.sys.state,
                MachineState::Cycle | MachineState::Hold | MachineState::Homing
            );
        warn!(was_moving, "abort: tearing down planner and stepper");

        self.stepper.go_idle(&mut self.timer);
        self.stepper.reset(&self.stepper_cfg);
        self.pulse_at = None;
        self.buffer.clear();
        self.planner.reset(self.sys.position);
        self.hold_complete = false;
        self.flags.clear_all();
        self.reset_count += 1;

        if was_moving && !was_alarm {
            // Steps were likely lost; the position is no longer trusted.
            self.alarm_reason = Some("Abort during cycle");
        }
        self.sys.state = if was_alarm || was_moving {
            MachineState::Alarm
        } else {
            MachineState::Idle
        };
    }

    fn unlock_alarm(&mut self) {
        if self.sys.state == MachineState::Alarm {
            info!("alarm cleared");
            self.sys.state = MachineState::Idle;
            self.alarm_reason = None;
        }
    }

    /// Dispatch the next due interrupt in virtual time. Returns false when
    /// nothing is armed.
    pub fn dispatch_next(&mut self) -> bool {
        let step_due = if self.timer.running {
            Some(self.next_step_at)
        } else {
            None
        };
        // The pulse channel runs at higher priority and wins ties.
        let fire_step = match (step_due, self.pulse_at) {
            (None, None) => return false,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(step_at), Some(pulse_at)) => step_at < pulse_at,
        };

        if fire_step {
            let step_at = self.next_step_at;
            self.clock = step_at;
            self.port.set_clock(step_at);
            self.stepper.step_interrupt(
                &mut self.buffer,
                &mut self.sys,
                &self.flags,
                &self.stepper_cfg,
                &mut self.port,
                &mut self.timer,
            );
            if let Some(delay) = self.timer.pulse_armed.take() {
                self.pulse_at = Some(self.clock + delay as u64);
            }
            if self.timer.running {
                self.next_step_at = self.clock + self.timer.period as u64;
            }
        } else {
            let pulse_at = self.pulse_at.take().unwrap_or(self.clock);
            self.clock = pulse_at;
            self.port.set_clock(pulse_at);
            self.stepper
                .pulse_reset_interrupt(&self.stepper_cfg, &mut self.port, &mut self.timer);
            if let Some(delay) = self.timer.pulse_armed.take() {
                self.pulse_at = Some(self.clock + delay as u64);
            }
        }
        true
    }

    /// Dispatch up to `max_events` interrupts; true if any fired.
    pub fn dispatch_some(&mut self, max_events: u64) -> bool {
        let mut fired = false;
        for _ in 0..max_events {
            if !self.dispatch_next() {
                break;
            }
            fired = true;
        }
        fired
    }

    /// Run virtual time forward until no interrupt source is armed,
    /// servicing runtime commands along the way.
    pub fn run_until_idle(&mut self, max_events: u64) -> Result<u64, MachineError> {
        let mut events = 0u64;
        loop {
            self.service_pending();
            if !self.dispatch_next() {
                self.service_pending();
                return Ok(events);
            }
            events += 1;
            if events > max_events {
                return Err(MachineError::Runaway(events));
            }
        }
    }

    /// Block the foreground until the queue drains and the stepper idles.
    /// Used before modal changes that depend on the final position.
    pub fn synchronize(&mut self) -> Result<(), MachineError> {
        loop {
            self.service_pending();
            if self.sys.state == MachineState::Alarm {
                return Err(MachineError::AlarmLock);
            }
            if self.buffer.is_empty() && !self.stepper.is_running() && self.pulse_at.is_none() {
                return Ok(());
            }
            if !self.dispatch_some(4096) {
                std::thread::sleep(Duration::from_micros(200));
            }
        }
    }

    /// Simplified homing cycle: the limit switches define machine zero;
    /// pull off by `pulloff_mm` and re-zero there. A set bit in `dir_mask`
    /// homes that axis toward positive travel, so its pull-off runs
    /// negative.
    pub fn run_homing(
        &mut self,
        pulloff_mm: f32,
        seek_rate: f32,
        dir_mask: u8,
    ) -> Result<(), MachineError> {
        if !matches!(self.sys.state, MachineState::Idle | MachineState::Alarm) {
            return Err(MachineError::NotIdle);
        }
        info!("homing cycle started");
        self.buffer.clear();
        self.stepper.reset(&self.stepper_cfg);
        self.timer.running = false;
        self.pulse_at = None;
        self.alarm_reason = None;
        self.sys.state = MachineState::Homing;
        self.sys.position = [0; N_AXIS];
        self.planner.reset([0; N_AXIS]);

        let mut target = [0.0f32; N_AXIS];
        for (i, target_mm) in target.iter_mut().enumerate() {
            *target_mm = if dir_mask & (1 << i) != 0 {
                -pulloff_mm
            } else {
                pulloff_mm
            };
        }
        self.planner
            .append_line(
                &mut self.buffer,
                &self.planner_cfg,
                target,
                FeedRate::UnitsPerMinute(seek_rate),
            )
            .map_err(|_| MachineError::InvalidFeedRate)?;
        self.wake_stepper();
        self.run_until_idle(50_000_000)?;

        self.sys.position = [0; N_AXIS];
        self.planner.reset([0; N_AXIS]);
        self.sys.state = MachineState::Idle;
        info!("homing complete");
        Ok(())
    }
}
