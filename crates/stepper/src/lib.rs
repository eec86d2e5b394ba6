//! # Stepper Executor
//!
//! Hard real-time consumer of the planned block queue. A primary periodic
//! timer drives the Bresenham multi-axis step generator and the trapezoid
//! rate controller; a secondary one-shot timer returns the step lines to
//! their idle polarity after each pulse.
//!
//! Hardware access goes through the [`StepPort`] and [`StepTimer`] traits
//! so the executor runs unchanged against real GPIO/timer peripherals or
//! the simulated devices used on the host.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod executor;
pub mod traits;

pub use executor::{Stepper, StepperConfig};
pub use traits::{StepPort, StepTimer};

/// Clock the virtual step timers are programmed against.
pub const F_CPU: u32 = 16_000_000;

/// Timer cycles per trapezoid acceleration tick.
pub const CYCLES_PER_ACCELERATION_TICK: u32 = F_CPU / motion::ACCELERATION_TICKS_PER_SECOND;

/// Step output lines occupy the low bits of the port, one per axis.
pub const STEP_MASK: u8 = 0b0000_0111;

/// Direction lines sit above the step lines.
pub const DIRECTION_SHIFT: u8 = 3;
pub const DIRECTION_MASK: u8 = 0b0011_1000;

/// Convert a microsecond interval to timer cycles.
pub const fn us_to_cycles(microseconds: u32) -> u32 {
    microseconds * (F_CPU / 1_000_000)
}
