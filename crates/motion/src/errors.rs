//! Error types for the motion planning crate.

use core::fmt;

/// Represents errors that can occur during motion planning.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PlanError {
    /// The block buffer has no free slot. The caller is expected to
    /// service pending runtime commands and retry once the stepper has
    /// discarded a block.
    BufferFull,
    /// The requested feed rate was zero or negative.
    InvalidFeedRate,
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::BufferFull => write!(f, "block buffer full"),
            PlanError::InvalidFeedRate => write!(f, "invalid feed rate"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PlanError {}
