//! # Motion Core
//!
//! The shared machine model and look-ahead planner of the CNC execution
//! core, usable on both host and MCU (`no_std`-friendly).
//!
//! Provides the pieces shared between the foreground (g-code producer) and
//! the step interrupt (consumer):
//! - Machine state and the atomic runtime-command bitset
//! - Planned motion blocks and their trapezoid derivation
//! - The fixed-capacity block ring buffer
//! - The look-ahead planner with junction-deviation cornering

#![cfg_attr(not(feature = "std"), no_std)]

pub mod block;
pub mod buffer;
pub mod errors;
pub mod planner;
pub mod state;

mod math;

// Re-export core types for easier access
pub use block::Block;
pub use buffer::BlockBuffer;
pub use errors::PlanError;
pub use planner::{Appended, FeedRate, Planner, PlannerConfig};
pub use state::{ExecFlags, MachineState, SystemState};

/// Number of controlled linear axes.
pub const N_AXIS: usize = 3;

pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;

/// Capacity of the block ring buffer. One slot is always kept free to
/// distinguish full from empty.
pub const BLOCK_BUFFER_SIZE: usize = 18;

/// Frequency of the trapezoid rate controller. Each tick adjusts the step
/// rate by one `rate_delta`.
pub const ACCELERATION_TICKS_PER_SECOND: u32 = 50;

/// Floor for any programmed step rate. The timer reload is clamped so the
/// step interrupt never stalls at a zero or negative rate.
pub const MINIMUM_STEPS_PER_MINUTE: u32 = 800;
