//! The step interrupt bodies and the trapezoid rate controller.

use motion::{
    Block, BlockBuffer, ExecFlags, MachineState, SystemState, MINIMUM_STEPS_PER_MINUTE, N_AXIS,
};

use crate::traits::{StepPort, StepTimer};
use crate::{us_to_cycles, CYCLES_PER_ACCELERATION_TICK, DIRECTION_SHIFT, F_CPU, STEP_MASK};

/// Stepper tuning derived from the persisted settings.
#[derive(Debug, Clone)]
pub struct StepperConfig {
    /// Width of each step pulse.
    pub pulse_microseconds: u8,
    /// Optional direction-to-step setup delay. Zero selects the plain
    /// pulse scheme where step and direction bits are driven together.
    pub pulse_delay_microseconds: u8,
    /// XOR pattern applied to the step/direction bits before they reach
    /// the port; encodes the idle polarity of every line.
    pub invert_mask: u8,
    /// Polarity of the stepper-enable output.
    pub invert_step_enable: bool,
    /// How long the drivers stay locked after the queue drains. 255 keeps
    /// them energized forever.
    pub idle_lock_time_ms: u8,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            pulse_microseconds: 10,
            pulse_delay_microseconds: 0,
            invert_mask: 0,
            invert_step_enable: false,
            idle_lock_time_ms: 25,
        }
    }
}

/// What the one-shot pulse channel should do when it next fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PulsePhase {
    /// Return the step lines to idle polarity.
    Reset,
    /// Delayed-pulse variant: raise the step lines, then re-arm for the
    /// reset.
    RaiseStep,
}

/// Per-block and per-step runtime state of the executor. Zeroed on reset
/// and mutated exclusively by the two interrupt bodies.
#[derive(Debug)]
pub struct Stepper {
    /// Bits computed on the previous interrupt, driven at the top of the
    /// next one (already inversion-adjusted).
    out_bits: u8,
    /// Shadow of the last value actually driven onto the port.
    driven_bits: u8,
    /// Full bit pattern held back for the delayed-pulse variant.
    pending_out_bits: u8,
    pulse_phase: PulsePhase,
    /// Bresenham accumulators.
    counter: [i32; N_AXIS],
    /// Copy of the loaded block's step_event_count; stays fixed across a
    /// feed hold so the Bresenham pattern survives the resume.
    event_count: u32,
    step_events_completed: u32,
    /// Current primary-timer reload value.
    cycles_per_step_event: u32,
    trapezoid_tick_cycle_counter: u32,
    /// Current step rate, steps/min.
    trapezoid_adjusted_rate: u32,
    /// Below this rate the decel leg halves the rate instead of
    /// subtracting, bounding acceleration near a stop.
    min_safe_rate: u32,
    block_loaded: bool,
    busy: bool,
    running: bool,
}

impl Stepper {
    pub fn new(config: &StepperConfig) -> Self {
        Self {
            out_bits: config.invert_mask,
            driven_bits: config.invert_mask,
            pending_out_bits: config.invert_mask,
            pulse_phase: PulsePhase::Reset,
            counter: [0; N_AXIS],
            event_count: 0,
            step_events_completed: 0,
            cycles_per_step_event: period_from_rate(MINIMUM_STEPS_PER_MINUTE),
            trapezoid_tick_cycle_counter: 0,
            trapezoid_adjusted_rate: MINIMUM_STEPS_PER_MINUTE,
            min_safe_rate: MINIMUM_STEPS_PER_MINUTE,
            block_loaded: false,
            busy: false,
            running: false,
        }
    }

    /// Drop all per-block state, e.g. after an abort.
    pub fn reset(&mut self, config: &StepperConfig) {
        *self = Self::new(config);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// A block is mid-flight (also true while parked in a feed hold).
    pub fn has_block(&self) -> bool {
        self.block_loaded
    }

    pub fn step_events_completed(&self) -> u32 {
        self.step_events_completed
    }

    /// Feed-hold resume: the planner has shortened the interrupted block
    /// to the remaining step events; restart the completion count while
    /// keeping the Bresenham accumulators and `event_count` untouched.
    pub fn restart_block(&mut self) {
        self.step_events_completed = 0;
    }

    /// Enable the drivers and arm the primary timer.
    pub fn wake_up<P: StepPort, T: StepTimer>(
        &mut self,
        config: &StepperConfig,
        port: &mut P,
        timer: &mut T,
    ) {
        if self.running {
            return;
        }
        port.set_enable(!config.invert_step_enable);
        timer.set_period(self.cycles_per_step_event);
        timer.start();
        self.running = true;
    }

    /// Disarm the primary timer. Per-block state is left intact so a feed
    /// hold can resume exactly where it paused.
    pub fn go_idle<T: StepTimer>(&mut self, timer: &mut T) {
        timer.stop();
        self.running = false;
        self.busy = false;
    }

    /// Primary step interrupt.
    ///
    /// The bits driven here were computed on the *previous* firing; the
    /// one-interrupt latency is deliberate, placing direction-line
    /// transitions at least one step period ahead of their pulse.
    pub fn step_interrupt<P: StepPort, T: StepTimer>(
        &mut self,
        buffer: &mut BlockBuffer,
        sys: &mut SystemState,
        flags: &ExecFlags,
        config: &StepperConfig,
        port: &mut P,
        timer: &mut T,
    ) {
        if self.busy {
            return;
        }

        if config.pulse_delay_microseconds == 0 {
            self.drive(port, self.out_bits);
            timer.arm_pulse_reset(us_to_cycles(config.pulse_microseconds as u32));
            self.pulse_phase = PulsePhase::Reset;
        } else {
            // Direction first; the pulse channel raises the step edge
            // after the configured setup delay.
            let direction_only = (self.out_bits & !STEP_MASK) | (config.invert_mask & STEP_MASK);
            self.drive(port, direction_only);
            self.pending_out_bits = self.out_bits;
            timer.arm_pulse_reset(us_to_cycles(config.pulse_delay_microseconds as u32));
            self.pulse_phase = PulsePhase::RaiseStep;
        }

        // Reentry guard: from here the body may be preempted by the pulse
        // channel but never by itself.
        self.busy = true;

        if !self.block_loaded {
            if let Some(block) = buffer.current() {
                if sys.state == MachineState::Cycle || sys.state == MachineState::Homing {
                    // Fresh start: seed the rate from the block's entry.
                    // During a feed hold neither the rate nor the tick
                    // counter reseeds, so the deceleration profile spans
                    // block boundaries naturally.
                    self.trapezoid_adjusted_rate = block.initial_rate;
                    self.set_step_rate(timer, self.trapezoid_adjusted_rate);
                    self.trapezoid_tick_cycle_counter = CYCLES_PER_ACCELERATION_TICK / 2;
                }
                self.min_safe_rate = block.rate_delta + (block.rate_delta >> 1);
                self.counter = [-((block.step_event_count >> 1) as i32); N_AXIS];
                self.event_count = block.step_event_count;
                self.step_events_completed = 0;
                self.block_loaded = true;
            } else {
                self.go_idle(timer);
                flags.set(ExecFlags::CYCLE_STOP);
                return;
            }
        }

        let current = buffer.current().copied();
        if let Some(block) = current {
            let mut out_bits = (block.direction_bits << DIRECTION_SHIFT) & !STEP_MASK;
            for i in 0..N_AXIS {
                self.counter[i] += block.steps[i] as i32;
                if self.counter[i] > 0 {
                    out_bits |= 1 << i;
                    self.counter[i] -= self.event_count as i32;
                    if block.direction_bits & (1 << i) != 0 {
                        sys.position[i] -= 1;
                    } else {
                        sys.position[i] += 1;
                    }
                }
            }
            self.step_events_completed += 1;

            if self.step_events_completed < block.step_event_count {
                self.trapezoid_update(&block, sys.state, flags, timer);
            } else {
                self.block_loaded = false;
                buffer.discard_current();
            }

            self.out_bits = out_bits ^ config.invert_mask;
        }

        self.busy = false;
    }

    /// Secondary (pulse) interrupt: end the step pulse, or raise the
    /// delayed step edge first when a setup delay is configured.
    pub fn pulse_reset_interrupt<P: StepPort, T: StepTimer>(
        &mut self,
        config: &StepperConfig,
        port: &mut P,
        timer: &mut T,
    ) {
        match self.pulse_phase {
            PulsePhase::RaiseStep => {
                self.drive(port, self.pending_out_bits);
                timer.arm_pulse_reset(us_to_cycles(config.pulse_microseconds as u32));
                self.pulse_phase = PulsePhase::Reset;
            }
            PulsePhase::Reset => {
                let bits = (self.driven_bits & !STEP_MASK) | (config.invert_mask & STEP_MASK);
                self.drive(port, bits);
            }
        }
    }

    fn drive<P: StepPort>(&mut self, port: &mut P, bits: u8) {
        port.write(bits);
        self.driven_bits = bits;
    }

    /// Once-per-step-event rate policy of the trapezoid generator.
    fn trapezoid_update<T: StepTimer>(
        &mut self,
        block: &Block,
        state: MachineState,
        flags: &ExecFlags,
        timer: &mut T,
    ) {
        if state == MachineState::Hold {
            // Decelerate unconditionally; when the rate can no longer be
            // reduced the hold is complete and the steppers park. The
            // block stays loaded so the resume retraces the same path.
            if self.trapezoid_adjusted_rate > block.rate_delta {
                if self.acceleration_tick() {
                    self.trapezoid_adjusted_rate -= block.rate_delta;
                    self.set_step_rate(timer, self.trapezoid_adjusted_rate);
                }
            } else {
                self.go_idle(timer);
                flags.set(ExecFlags::FEED_HOLD_COMPLETE);
            }
            return;
        }

        if self.step_events_completed < block.accelerate_until {
            if self.acceleration_tick() {
                self.trapezoid_adjusted_rate =
                    (self.trapezoid_adjusted_rate + block.rate_delta).min(block.nominal_rate);
                self.set_step_rate(timer, self.trapezoid_adjusted_rate);
            }
        } else if self.step_events_completed >= block.decelerate_after {
            if self.step_events_completed == block.decelerate_after {
                // Boundary step: reseed the tick counter. Entering from
                // cruise uses the midpoint rule; a triangle profile keeps
                // the phase by complementing the running counter.
                self.trapezoid_tick_cycle_counter =
                    if self.trapezoid_adjusted_rate == block.nominal_rate {
                        CYCLES_PER_ACCELERATION_TICK / 2
                    } else {
                        CYCLES_PER_ACCELERATION_TICK
                            .saturating_sub(self.trapezoid_tick_cycle_counter)
                    };
            } else if self.acceleration_tick() {
                if self.trapezoid_adjusted_rate > self.min_safe_rate {
                    self.trapezoid_adjusted_rate -= block.rate_delta;
                } else {
                    self.trapezoid_adjusted_rate >>= 1;
                }
                if self.trapezoid_adjusted_rate < block.final_rate {
                    self.trapezoid_adjusted_rate = block.final_rate;
                }
                self.set_step_rate(timer, self.trapezoid_adjusted_rate);
            }
        } else if self.trapezoid_adjusted_rate != block.nominal_rate {
            // Cruise: snap to nominal once.
            self.trapezoid_adjusted_rate = block.nominal_rate;
            self.set_step_rate(timer, self.trapezoid_adjusted_rate);
        }
    }

    /// Advance the tick accumulator by one step period; true when an
    /// acceleration tick has elapsed.
    fn acceleration_tick(&mut self) -> bool {
        self.trapezoid_tick_cycle_counter += self.cycles_per_step_event;
        if self.trapezoid_tick_cycle_counter > CYCLES_PER_ACCELERATION_TICK {
            self.trapezoid_tick_cycle_counter -= CYCLES_PER_ACCELERATION_TICK;
            // At rates slower than one tick per event the carry would grow
            // without bound; cap it at one pending tick.
            if self.trapezoid_tick_cycle_counter > CYCLES_PER_ACCELERATION_TICK {
                self.trapezoid_tick_cycle_counter = CYCLES_PER_ACCELERATION_TICK;
            }
            return true;
        }
        false
    }

    /// Program the step timer for `steps_per_minute`, clamped at the rate
    /// floor and saturated at the 32-bit reload width.
    fn set_step_rate<T: StepTimer>(&mut self, timer: &mut T, steps_per_minute: u32) {
        self.cycles_per_step_event = period_from_rate(steps_per_minute);
        timer.set_period(self.cycles_per_step_event);
    }
}

fn period_from_rate(steps_per_minute: u32) -> u32 {
    let rate = steps_per_minute.max(MINIMUM_STEPS_PER_MINUTE);
    ((F_CPU as u64 * 60) / rate as u64).min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use motion::ExecFlags;

    #[derive(Debug, Default)]
    struct MockStepPort {
        writes: Vec<u8>,
        enabled: bool,
    }

    impl StepPort for MockStepPort {
        fn write(&mut self, bits: u8) {
            self.writes.push(bits);
        }
        fn set_enable(&mut self, enabled: bool) {
            self.enabled = enabled;
        }
    }

    #[derive(Debug, Default)]
    struct MockStepTimer {
        period_log: Vec<u32>,
        pulse_armed: Option<u32>,
        running: bool,
    }

    impl StepTimer for MockStepTimer {
        fn set_period(&mut self, cycles: u32) {
            self.period_log.push(cycles);
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

    fn queue_block(buffer: &mut BlockBuffer, mut block: Block) {
        let slot = buffer.try_write_slot().unwrap();
        block.recalculate = false;
        *slot = block;
        buffer.commit_write();
    }

    fn straight_block(steps: [u32; N_AXIS], direction_bits: u8) -> Block {
        let step_event_count = steps[0].max(steps[1]).max(steps[2]);
        Block {
            steps,
            direction_bits,
            step_event_count,
            millimeters: step_event_count as f32 / 80.0,
            nominal_speed_sq: 600.0 * 600.0,
            acceleration: 36_000.0,
            nominal_rate: 48_000,
            initial_rate: 0,
            final_rate: 0,
            rate_delta: 960,
            accelerate_until: step_event_count / 2,
            decelerate_after: step_event_count / 2,
            ..Block::default()
        }
    }

    struct Rig {
        buffer: BlockBuffer,
        sys: SystemState,
        flags: ExecFlags,
        config: StepperConfig,
        port: MockStepPort,
        timer: MockStepTimer,
        stepper: Stepper,
    }

    impl Rig {
        fn new() -> Self {
            let config = StepperConfig::default();
            let stepper = Stepper::new(&config);
            let mut sys = SystemState::new();
            sys.state = MachineState::Cycle;
            Self {
                buffer: BlockBuffer::new(),
                sys,
                flags: ExecFlags::new(),
                config,
                port: MockStepPort::default(),
                timer: MockStepTimer::default(),
                stepper,
            }
        }

        fn fire_step(&mut self) {
            self.stepper.step_interrupt(
                &mut self.buffer,
                &mut self.sys,
                &self.flags,
                &self.config,
                &mut self.port,
                &mut self.timer,
            );
        }

        fn fire_pulse_reset(&mut self) {
            self.stepper.pulse_reset_interrupt(
                &self.config,
                &mut self.port,
                &mut self.timer,
            );
        }

        fn run_to_idle(&mut self, max_interrupts: usize) {
            self.stepper
                .wake_up(&self.config, &mut self.port, &mut self.timer);
            for _ in 0..max_interrupts {
                if !self.stepper.is_running() {
                    return;
                }
                self.fire_step();
                self.fire_pulse_reset();
            }
            panic!("stepper never went idle");
        }

        /// Count rising step edges per axis across the recorded writes.
        fn pulses(&self) -> [u32; N_AXIS] {
            let mut pulses = [0u32; N_AXIS];
            let mut last = self.config.invert_mask;
            for &raw in &self.port.writes {
                let logical = raw ^ self.config.invert_mask;
                let last_logical = last ^ self.config.invert_mask;
                for (i, count) in pulses.iter_mut().enumerate() {
                    let bit = 1u8 << i;
                    if logical & bit != 0 && last_logical & bit == 0 {
                        *count += 1;
                    }
                }
                last = raw;
            }
            pulses
        }
    }

    #[test]
    fn bresenham_distributes_exact_step_counts() {
        let mut rig = Rig::new();
        queue_block(&mut rig.buffer, straight_block([40, 21, 7], 0));

        rig.run_to_idle(200);

        assert_eq!(rig.pulses(), [40, 21, 7]);
        assert_eq!(rig.sys.position, [40, 21, 7]);
        assert!(rig.buffer.is_empty());
        assert!(rig.port.enabled, "wake_up must enable the drivers");
        assert!(rig.flags.take(ExecFlags::CYCLE_STOP));
    }

    #[test]
    fn direction_bits_drive_the_direction_lines_and_sign() {
        let mut rig = Rig::new();
        // Y negative.
        queue_block(&mut rig.buffer, straight_block([10, 10, 0], 0b010));

        rig.run_to_idle(100);

        assert_eq!(rig.sys.position, [10, -10, 0]);
        assert!(rig
            .port
            .writes
            .iter()
            .any(|bits| bits & (1 << (1 + DIRECTION_SHIFT)) != 0));
    }

    #[test]
    fn pulse_reset_returns_step_lines_to_idle() {
        let mut rig = Rig::new();
        rig.config.invert_mask = 0b0000_0101;
        rig.stepper.reset(&rig.config);
        queue_block(&mut rig.buffer, straight_block([4, 0, 0], 0));

        rig.run_to_idle(50);

        // After every pulse reset the step lines sit at their inverted
        // idle polarity.
        let idle = rig.config.invert_mask & STEP_MASK;
        let mut last = None;
        for (i, &bits) in rig.port.writes.iter().enumerate() {
            last = Some((i, bits));
        }
        let (_, bits) = last.unwrap();
        assert_eq!(bits & STEP_MASK, idle);
    }

    #[test]
    fn rate_ramps_up_through_the_acceleration_phase() {
        let mut rig = Rig::new();
        let mut block = straight_block([2000, 0, 0], 0);
        block.accelerate_until = 1000;
        block.decelerate_after = 1000;
        queue_block(&mut rig.buffer, block);

        rig.stepper
            .wake_up(&rig.config, &mut rig.port, &mut rig.timer);
        for _ in 0..800 {
            rig.fire_step();
        }

        // Timer periods must never increase while accelerating.
        let log = &rig.timer.period_log;
        assert!(log.len() > 2);
        assert!(log.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn feed_hold_decelerates_and_parks_without_unloading_the_block() {
        let mut rig = Rig::new();
        let mut block = straight_block([4000, 0, 0], 0);
        block.accelerate_until = 1000;
        block.decelerate_after = 3000;
        queue_block(&mut rig.buffer, block);

        rig.stepper
            .wake_up(&rig.config, &mut rig.port, &mut rig.timer);
        for _ in 0..500 {
            rig.fire_step();
        }
        assert!(rig.stepper.is_running());

        rig.sys.state = MachineState::Hold;
        let mark = rig.timer.period_log.len();
        for _ in 0..4000 {
            if !rig.stepper.is_running() {
                break;
            }
            rig.fire_step();
        }

        assert!(!rig.stepper.is_running());
        assert!(!rig.timer.running);
        assert!(rig.flags.take(ExecFlags::FEED_HOLD_COMPLETE));
        assert!(rig.stepper.has_block());
        assert!(rig.stepper.step_events_completed() < 4000);
        // Rate only ever fell during the hold.
        let hold_log = &rig.timer.period_log[mark..];
        assert!(hold_log.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn delayed_pulse_variant_separates_direction_and_step_edges() {
        let mut rig = Rig::new();
        rig.config.pulse_delay_microseconds = 5;
        rig.stepper.reset(&rig.config);
        queue_block(&mut rig.buffer, straight_block([3, 0, 0], 0));

        rig.stepper
            .wake_up(&rig.config, &mut rig.port, &mut rig.timer);
        // First interrupt loads the block and computes the first step.
        rig.fire_step();
        // Second interrupt drives direction only, deferring the step bits.
        rig.fire_step();
        let direction_write = *rig.port.writes.last().unwrap();
        assert_eq!(direction_write & STEP_MASK, 0);

        // The pulse channel raises the step edge...
        rig.fire_pulse_reset();
        let step_write = *rig.port.writes.last().unwrap();
        assert_eq!(step_write & STEP_MASK, 1);
        // ...and was re-armed for the reset.
        assert!(rig.timer.pulse_armed.is_some());
        rig.fire_pulse_reset();
        let reset_write = *rig.port.writes.last().unwrap();
        assert_eq!(reset_write & STEP_MASK, 0);
    }
}
