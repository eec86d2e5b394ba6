//! Shared system state: machine state, step-counted position, and the
//! runtime-command bitset raised by interrupts and real-time input.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::N_AXIS;

/// Top-level machine state. Transitions are owned by the runtime
/// coordinator; the stepper only reads this to pick its rate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Booting; no motion allowed yet.
    Init,
    /// Nothing queued, steppers idle.
    Idle,
    /// Blocks queued but the cycle has not been started.
    Queued,
    /// Executing queued blocks.
    Cycle,
    /// Feed hold: decelerating to a stop, resumable.
    Hold,
    /// Homing cycle in progress.
    Homing,
    /// Latched fault; motion locked out until explicitly cleared.
    Alarm,
    /// G-code is parsed and validated but not executed.
    CheckMode,
}

/// Singleton machine state shared between foreground and the step
/// interrupt. `position` is mutated only by the step interrupt while a
/// block executes, and by homing.
#[derive(Debug)]
pub struct SystemState {
    pub state: MachineState,
    /// Authoritative machine position, in signed steps per axis.
    pub position: [i32; N_AXIS],
    /// Start cycles automatically when a block is committed.
    pub auto_start: bool,
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            state: MachineState::Init,
            position: [0; N_AXIS],
            auto_start: false,
        }
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending runtime commands, set from interrupt context or the real-time
/// serial path and consumed by the foreground coordinator. Word-wide
/// read-modify-write keeps set/test-and-clear atomic without a lock.
#[derive(Debug, Default)]
pub struct ExecFlags(AtomicU8);

impl ExecFlags {
    pub const STATUS_REPORT: u8 = 1 << 0;
    pub const CYCLE_START: u8 = 1 << 1;
    pub const FEED_HOLD: u8 = 1 << 2;
    pub const CYCLE_STOP: u8 = 1 << 3;
    pub const FEED_HOLD_COMPLETE: u8 = 1 << 4;
    pub const RESET_ALARM: u8 = 1 << 5;
    pub const ABORT: u8 = 1 << 6;

    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Raise the given command bits.
    pub fn set(&self, bits: u8) {
        self.0.fetch_or(bits, Ordering::AcqRel);
    }

    /// Atomically test and clear the given bits. Returns true if any of
    /// them was set.
    pub fn take(&self, bits: u8) -> bool {
        self.0.fetch_and(!bits, Ordering::AcqRel) & bits != 0
    }

    /// Current snapshot, without clearing anything.
    pub fn peek(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear_all(&self) {
        self.0.store(0, Ordering::Release);
    }
}
