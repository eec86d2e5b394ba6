//! # Look-Ahead Motion Planner
//!
//! Translates displacement targets into planned [`Block`]s and keeps the
//! queue's entry speeds optimal under two constraints:
//!
//! 1. **Junction deviation**: the corner between two consecutive moves is
//!    approximated by a circular arc that deviates from the exact corner by
//!    a configured distance; the centripetal-acceleration limit on that arc
//!    caps the junction speed.
//! 2. **Acceleration**: every block must be able to reach its successor's
//!    entry speed within its own length, and the newest block must always
//!    be able to stop (its exit speed is pinned to zero by a sentinel).
//!
//! After every append the reverse/forward passes rerun over the
//! still-optimizable region `[planned, head)` and the affected trapezoids
//! are rederived. All speed comparisons use squared speeds; square roots
//! only appear in the trapezoid derivation where rates are produced.

use crate::buffer::BlockBuffer;
use crate::math::{fabsf, fminf, roundf, sqrtf};
use crate::{Block, PlanError, N_AXIS};

/// Planner tuning derived from the persisted settings.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub steps_per_mm: [f32; N_AXIS],
    /// Per-axis acceleration limits, mm/min².
    pub acceleration: [f32; N_AXIS],
    /// Cornering tolerance, mm.
    pub junction_deviation: f32,
}

/// Requested feed for a move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeedRate {
    /// mm/min along the path.
    UnitsPerMinute(f32),
    /// Inverse-time convention: the whole move completes in `1/value`
    /// minutes.
    InverseTime(f32),
}

/// Outcome of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// A block was committed and the queue replanned.
    Planned,
    /// The target matched the current position on every axis; nothing was
    /// queued.
    Dropped,
}

/// The look-ahead planner. Owns its own step-count shadow of the machine
/// position (the position the queue ends at, not where the tool is now)
/// and the unit vector of the previous move for junction analysis.
#[derive(Debug)]
pub struct Planner {
    position: [i32; N_AXIS],
    previous_unit_vec: [f32; N_AXIS],
    previous_nominal_speed_sq: f32,
}

impl Planner {
    pub fn new() -> Self {
        Self {
            position: [0; N_AXIS],
            previous_unit_vec: [0.0; N_AXIS],
            previous_nominal_speed_sq: 0.0,
        }
    }

    /// Reset the position shadow and forget the previous move direction.
    /// The buffer is expected to be cleared by the caller.
    pub fn reset(&mut self, position_steps: [i32; N_AXIS]) {
        self.position = position_steps;
        self.previous_unit_vec = [0.0; N_AXIS];
        self.previous_nominal_speed_sq = 0.0;
    }

    /// Step-count position the queue currently ends at.
    pub fn position_steps(&self) -> [i32; N_AXIS] {
        self.position
    }

    /// Plan a straight move to `target_mm` and append it to the buffer.
    ///
    /// Returns [`PlanError::BufferFull`] without side effects when no slot
    /// is free; the caller parks in a cooperative wait loop and retries.
    /// Zero-length targets are dropped.
    pub fn append_line(
        &mut self,
        buffer: &mut BlockBuffer,
        config: &PlannerConfig,
        target_mm: [f32; N_AXIS],
        feed: FeedRate,
    ) -> Result<Appended, PlanError> {
        if buffer.is_full() {
            return Err(PlanError::BufferFull);
        }

        let mut target_steps = [0i32; N_AXIS];
        let mut steps = [0u32; N_AXIS];
        let mut delta_mm = [0.0f32; N_AXIS];
        let mut direction_bits = 0u8;
        for i in 0..N_AXIS {
            target_steps[i] = roundf(target_mm[i] * config.steps_per_mm[i]) as i32;
            let delta = target_steps[i] - self.position[i];
            steps[i] = delta.unsigned_abs();
            if delta < 0 {
                direction_bits |= 1 << i;
            }
            delta_mm[i] = delta as f32 / config.steps_per_mm[i];
        }
        let step_event_count = steps[0].max(steps[1]).max(steps[2]);
        if step_event_count == 0 {
            return Ok(Appended::Dropped);
        }

        let millimeters = sqrtf(
            delta_mm[0] * delta_mm[0] + delta_mm[1] * delta_mm[1] + delta_mm[2] * delta_mm[2],
        );
        let inverse_millimeters = 1.0 / millimeters;

        let nominal_speed = match feed {
            FeedRate::UnitsPerMinute(rate) if rate > 0.0 => rate,
            FeedRate::InverseTime(inverse_minutes) if inverse_minutes > 0.0 => {
                millimeters * inverse_minutes
            }
            _ => return Err(PlanError::InvalidFeedRate),
        };
        let nominal_speed_sq = nominal_speed * nominal_speed;

        let mut unit_vec = [0.0f32; N_AXIS];
        for i in 0..N_AXIS {
            unit_vec[i] = delta_mm[i] * inverse_millimeters;
        }

        // Project the per-axis acceleration limits onto the move direction.
        let mut acceleration = f32::INFINITY;
        for i in 0..N_AXIS {
            if unit_vec[i] != 0.0 {
                acceleration = fminf(acceleration, config.acceleration[i] / fabsf(unit_vec[i]));
            }
        }

        let max_entry_speed_sq =
            self.junction_speed_sq(buffer, config, &unit_vec, nominal_speed_sq, acceleration);

        // The entry speed must also allow a full stop within the block, so
        // the tail of the queue can always come to rest.
        let stop_limited_sq = 2.0 * acceleration * millimeters;
        let entry_speed_sq = fminf(max_entry_speed_sq, stop_limited_sq);

        let slot = buffer.try_write_slot().ok_or(PlanError::BufferFull)?;
        *slot = Block {
            steps,
            direction_bits,
            step_event_count,
            millimeters,
            nominal_speed_sq,
            entry_speed_sq,
            max_entry_speed_sq,
            acceleration,
            nominal_length: nominal_speed_sq <= stop_limited_sq,
            recalculate: true,
            ..Block::default()
        };
        buffer.commit_write();

        self.position = target_steps;
        self.previous_unit_vec = unit_vec;
        self.previous_nominal_speed_sq = nominal_speed_sq;

        self.recalculate(buffer);
        Ok(Appended::Planned)
    }

    /// Maximum squared cornering speed at the junction between the previous
    /// move and a move along `unit_vec`.
    fn junction_speed_sq(
        &self,
        buffer: &BlockBuffer,
        config: &PlannerConfig,
        unit_vec: &[f32; N_AXIS],
        nominal_speed_sq: f32,
        acceleration: f32,
    ) -> f32 {
        // No junction to speak of after a reset or an empty buffer: start
        // from rest.
        if buffer.is_empty() || self.previous_nominal_speed_sq <= 0.0 {
            return 0.0;
        }

        let cos_theta = self.previous_unit_vec[0] * unit_vec[0]
            + self.previous_unit_vec[1] * unit_vec[1]
            + self.previous_unit_vec[2] * unit_vec[2];

        // Near-reversal: force a stop at the corner.
        if cos_theta <= -0.95 {
            return 0.0;
        }

        let mut speed_sq = fminf(self.previous_nominal_speed_sq, nominal_speed_sq);
        // Nearly collinear joins impose no corner limit; the deviation
        // circle degenerates there.
        if cos_theta < 0.95 {
            let sin_theta_d2 = sqrtf(0.5 * (1.0 - cos_theta));
            let radius = config.junction_deviation * sin_theta_d2 / (1.0 - sin_theta_d2);
            speed_sq = fminf(speed_sq, acceleration * radius);
        }
        speed_sq
    }

    /// Rerun the two-pass entry-speed optimizer over `[planned, head)` and
    /// rederive the trapezoids of every block whose entry or exit speed
    /// changed.
    pub fn recalculate(&mut self, buffer: &mut BlockBuffer) {
        let head = buffer.head_index();
        let optimizer_start = buffer.planned_index();
        if head == optimizer_start {
            return;
        }
        let newest = BlockBuffer::prev_index(head);

        // Reverse pass: pin the newest block's exit to the zero-speed
        // sentinel, then walk toward `planned` tightening entry speeds so
        // every block can decelerate into its successor.
        {
            let block = buffer.block_mut(newest);
            let entry = fminf(
                block.max_entry_speed_sq,
                block.max_allowable_entry_speed_sq(0.0),
            );
            if block.entry_speed_sq != entry {
                block.entry_speed_sq = entry;
                block.recalculate = true;
            }
        }
        // Walk from newest-1 down to planned+1; the planned block's entry
        // is final and is never touched.
        if newest != optimizer_start {
            let mut successor_index = newest;
            let mut index = BlockBuffer::prev_index(newest);
            while index != optimizer_start {
                let successor_entry_sq = buffer.block(successor_index).entry_speed_sq;
                let block = buffer.block_mut(index);
                // A nominal-length block can decelerate to any exit speed
                // from its (already junction-capped) entry; skip it.
                if !block.nominal_length {
                    let entry = fminf(
                        block.max_entry_speed_sq,
                        block.max_allowable_entry_speed_sq(successor_entry_sq),
                    );
                    if block.entry_speed_sq != entry {
                        block.entry_speed_sq = entry;
                        block.recalculate = true;
                    }
                }
                successor_index = index;
                index = BlockBuffer::prev_index(index);
            }
        }

        // Forward pass: cap each successor's entry by what its predecessor
        // can actually accelerate to, and advance `planned` past blocks
        // whose entry speed is now final.
        let mut index = optimizer_start;
        while index != newest {
            let next_index = BlockBuffer::next_index(index);
            let current = *buffer.block(index);
            let next = buffer.block_mut(next_index);
            if !current.nominal_length && current.entry_speed_sq < next.entry_speed_sq {
                let accel_limit_sq =
                    current.entry_speed_sq + 2.0 * current.acceleration * current.millimeters;
                if accel_limit_sq < next.entry_speed_sq {
                    // Full-acceleration join: the successor's entry can
                    // never improve, it is final.
                    next.entry_speed_sq = accel_limit_sq;
                    next.recalculate = true;
                    buffer.advance_planned(next_index);
                }
            }
            if buffer.block(next_index).entry_speed_sq == buffer.block(next_index).max_entry_speed_sq
            {
                // Junction-limited entry: also final.
                buffer.advance_planned(next_index);
            }
            index = next_index;
        }

        // Trapezoid pass over the region the optimizer may have touched.
        let mut index = optimizer_start;
        while index != newest {
            let next_index = BlockBuffer::next_index(index);
            let exit_speed_sq = buffer.block(next_index).entry_speed_sq;
            if buffer.block(index).recalculate || buffer.block(next_index).recalculate {
                let block = buffer.block_mut(index);
                block.calculate_trapezoid(exit_speed_sq);
                block.recalculate = false;
            }
            index = next_index;
        }
        let block = buffer.block_mut(newest);
        block.calculate_trapezoid(0.0);
        block.recalculate = false;
    }

    /// Feed-hold resume: shorten the interrupted block to the step events
    /// that remain, restart it from rest, and replan the whole queue.
    pub fn cycle_reinitialize(&mut self, buffer: &mut BlockBuffer, step_events_remaining: u32) {
        let Some(block) = buffer.current_mut() else {
            return;
        };
        // Held exactly on a block boundary: nothing to shorten.
        if step_events_remaining == 0 {
            return;
        }
        block.millimeters *= step_events_remaining as f32 / block.step_event_count as f32;
        block.step_event_count = step_events_remaining;
        block.entry_speed_sq = 0.0;
        block.max_entry_speed_sq = 0.0;
        block.nominal_length = false;
        block.recalculate = true;

        buffer.rewind_planned();
        self.recalculate(buffer);
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}
