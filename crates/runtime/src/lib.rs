//! # Runtime Coordinator
//!
//! Glues the planner and stepper executor together into a machine: the
//! state machine for cycle start / feed hold / abort, the pending-command
//! polling that bridges interrupt and foreground context, and the
//! simulated step port, timers, and virtual clock the host binary and the
//! end-to-end tests run against.

pub mod devices;
pub mod machine;

pub use devices::{SimStepPort, SimStepTimer, TraceEntry};
pub use machine::{Machine, MachineError};
