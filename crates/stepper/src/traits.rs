//! Hardware abstraction for the stepper executor.
//!
//! The traits are shaped so a real implementation can map them onto
//! single-register writes: one combined step/direction output port and one
//! timer block with a reload register plus a one-shot compare channel.

/// Combined step/direction output port.
pub trait StepPort {
    /// Drive the full step/direction bit pattern. Inversion has already
    /// been applied by the executor; implementations write the bits as-is.
    fn write(&mut self, bits: u8);

    /// Stepper driver enable line.
    fn set_enable(&mut self, enabled: bool);
}

/// The step timer pair: a periodic primary and a one-shot pulse channel.
pub trait StepTimer {
    /// Program the primary reload value, in timer cycles between step
    /// interrupts. Takes effect from the next reload.
    fn set_period(&mut self, cycles: u32);

    /// Arm the one-shot pulse channel to fire after `cycles`.
    fn arm_pulse_reset(&mut self, cycles: u32);

    /// Start the primary timer.
    fn start(&mut self);

    /// Disarm the primary timer. A pending pulse reset still fires.
    fn stop(&mut self);
}
