//! A planned motion block: one constant-acceleration linear segment
//! between two waypoints, plus its derived trapezoid rate parameters.

use crate::math::{ceilf, floorf, fmaxf, fminf, sqrtf};
use crate::{ACCELERATION_TICKS_PER_SECOND, N_AXIS};

/// A planned constant-acceleration segment.
///
/// Speed fields are stored squared (mm/min)² so the planner's hot path
/// never takes a square root; rate fields are steps/min and are derived
/// from the squared speeds when the trapezoid is (re)computed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub struct Block {
    /// Step count magnitude per axis.
    pub steps: [u32; N_AXIS],
    /// Per-axis direction signs; bit set means the axis moves negative.
    pub direction_bits: u8,
    /// Number of Bresenham major-axis ticks: `max(steps)`.
    pub step_event_count: u32,
    /// Euclidean length of the move in mm, used only by replanning math.
    pub millimeters: f32,
    /// Squared requested speed, (mm/min)².
    pub nominal_speed_sq: f32,
    /// Squared speed at block start; owned by the planner.
    pub entry_speed_sq: f32,
    /// Squared junction limit with the preceding block; owned by the planner.
    pub max_entry_speed_sq: f32,
    /// Acceleration along the move, mm/min², clipped to the per-axis limits
    /// projected onto the unit vector.
    pub acceleration: f32,
    /// Cruise-phase step rate, steps/min.
    pub nominal_rate: u32,
    /// Step rate at block entry, steps/min.
    pub initial_rate: u32,
    /// Step rate at block exit, steps/min.
    pub final_rate: u32,
    /// Step-rate increment applied per acceleration tick.
    pub rate_delta: u32,
    /// Step-event count where the acceleration phase ends.
    pub accelerate_until: u32,
    /// Step-event count where the deceleration phase begins.
    pub decelerate_after: u32,
    /// The block can reach nominal speed from a standstill within its own
    /// length, so its entry speed never limits its predecessors.
    pub nominal_length: bool,
    /// The trapezoid must be recomputed before execution reaches it.
    pub recalculate: bool,
}

impl Block {
    /// Steps per millimeter along the major-axis metric of this block.
    fn rate_factor(&self) -> f32 {
        self.step_event_count as f32 / self.millimeters
    }

    /// Squared speed reachable at block entry when the block must slow to
    /// `exit_speed_sq` by its end.
    pub fn max_allowable_entry_speed_sq(&self, exit_speed_sq: f32) -> f32 {
        exit_speed_sq + 2.0 * self.acceleration * self.millimeters
    }

    /// Derive the trapezoid rate parameters from the current entry speed
    /// and the given exit speed.
    ///
    /// All distances are in step events. If the cruise region collapses the
    /// profile degenerates to a triangle with `decelerate_after ==
    /// accelerate_until`.
    pub fn calculate_trapezoid(&mut self, exit_speed_sq: f32) {
        let rate_factor = self.rate_factor();
        self.initial_rate = ceilf(sqrtf(self.entry_speed_sq) * rate_factor) as u32;
        self.final_rate = ceilf(sqrtf(exit_speed_sq) * rate_factor) as u32;
        self.nominal_rate = ceilf(sqrtf(self.nominal_speed_sq) * rate_factor) as u32;

        // Acceleration in steps/min², then per-tick rate increment.
        let acceleration_rate = self.acceleration * rate_factor;
        self.rate_delta =
            ceilf(acceleration_rate / (60.0 * ACCELERATION_TICKS_PER_SECOND as f32)) as u32;

        let initial = self.initial_rate as f32;
        let final_ = self.final_rate as f32;
        let nominal = self.nominal_rate as f32;
        let steps = self.step_event_count as f32;

        let mut accelerate_steps = ceilf(estimate_acceleration_distance(
            initial,
            nominal,
            acceleration_rate,
        ));
        let decelerate_steps = floorf(estimate_acceleration_distance(
            nominal,
            final_,
            -acceleration_rate,
        ));
        let mut plateau_steps = steps - accelerate_steps - decelerate_steps;

        // Not enough room to reach nominal speed: pure triangle.
        if plateau_steps < 0.0 {
            accelerate_steps = ceilf(intersection_distance(
                initial,
                final_,
                acceleration_rate,
                steps,
            ));
            accelerate_steps = fminf(fmaxf(accelerate_steps, 0.0), steps);
            plateau_steps = 0.0;
        }

        self.accelerate_until = accelerate_steps as u32;
        self.decelerate_after = (accelerate_steps + plateau_steps) as u32;
    }
}

/// Distance (in step events) needed to change from `initial_rate` to
/// `target_rate` under `acceleration` (steps/min²).
fn estimate_acceleration_distance(initial_rate: f32, target_rate: f32, acceleration: f32) -> f32 {
    (target_rate * target_rate - initial_rate * initial_rate) / (2.0 * acceleration)
}

/// Step event at which an acceleration ramp from `initial_rate` meets the
/// deceleration ramp into `final_rate` over `distance` step events.
fn intersection_distance(initial_rate: f32, final_rate: f32, acceleration: f32, distance: f32) -> f32 {
    (2.0 * acceleration * distance - initial_rate * initial_rate + final_rate * final_rate)
        / (4.0 * acceleration)
}
