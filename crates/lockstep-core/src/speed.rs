//! Simulation speed multiplier and pause state.
//!
//! The speed-change law is intentionally asymmetric and discontinuous:
//! increasing from a sub-baseline speed first snaps back to exactly 1,
//! decreasing a sub-baseline speed shrinks it multiplicatively, and the
//! open interval (1, 2) collapses to 1 on decrease. UI speed menus depend
//! on these exact branches, so they are kept as a pure function separate
//! from the controller state.

/// Lower bound enforced by [`adjust_speed`] on decrease.
pub const MIN_SPEED: f32 = 0.25;

/// Upper bound enforced by [`adjust_speed`] on increase.
pub const MAX_SPEED: f32 = 200.0;

/// Direction of a stepped speed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedDirection {
    /// Raise the speed factor by a step.
    Increase,
    /// Lower the speed factor by a step.
    Decrease,
}

/// Apply one stepped speed change and return the new factor.
///
/// Increase: a factor below 1 is normalized to exactly 1 (the step is not
/// added); otherwise the step is added and the result clamped to
/// [`MAX_SPEED`].
///
/// Decrease: at or below [`MIN_SPEED`] the call is a no-op; at or below 1
/// the factor shrinks multiplicatively to `current / (2 * step)`; at or
/// above 2 the step is subtracted; anything in the open interval (1, 2)
/// snaps to exactly 1.
pub fn adjust_speed(current: f32, step: f32, direction: SpeedDirection) -> f32 {
    match direction {
        SpeedDirection::Increase => {
            if current < 1.0 {
                return 1.0;
            }
            let raised = current + step;
            if raised > MAX_SPEED { MAX_SPEED } else { raised }
        }
        SpeedDirection::Decrease => {
            if current <= MIN_SPEED {
                current
            } else if current <= 1.0 {
                current / (2.0 * step)
            } else if current >= 2.0 {
                current - step
            } else {
                1.0
            }
        }
    }
}

/// Current simulation speed multiplier and pause state.
///
/// Pure state plus transition rules; no I/O. `pause_active` is a hard stop
/// (no time advances, no batches execute). The pause countdown is a soft,
/// self-expiring stall used to resynchronize clients: wall ticks are
/// consumed without effect until it reaches zero.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedController {
    /// Current speed multiplier applied to wall-clock ticks.
    speed_factor: f32,
    /// Hard pause flag.
    pause_active: bool,
    /// Remaining soft-stall time in milliseconds.
    pause_remaining_ms: u64,
}

impl Default for SpeedController {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedController {
    /// Create a controller at baseline speed, unpaused.
    pub const fn new() -> Self {
        Self {
            speed_factor: 1.0,
            pause_active: false,
            pause_remaining_ms: 0,
        }
    }

    /// Return the current speed factor.
    pub const fn speed_factor(&self) -> f32 {
        self.speed_factor
    }

    /// Set the speed factor directly, without bounds checking.
    pub const fn set_speed_factor(&mut self, factor: f32) {
        self.speed_factor = factor;
    }

    /// Multiply the speed factor, without bounds checking.
    ///
    /// A deliberately unchecked primitive for bulk speed changes (menu
    /// "x2"/"x0.5"); callers must not pass factors that violate the bounds.
    pub const fn multiply(&mut self, factor: f32) {
        self.speed_factor *= factor;
    }

    /// Increase the speed factor per [`adjust_speed`].
    pub fn increase(&mut self, step: f32) {
        self.speed_factor = adjust_speed(self.speed_factor, step, SpeedDirection::Increase);
    }

    /// Decrease the speed factor per [`adjust_speed`].
    pub fn decrease(&mut self, step: f32) {
        self.speed_factor = adjust_speed(self.speed_factor, step, SpeedDirection::Decrease);
    }

    /// Whether the hard pause flag is set.
    pub const fn is_pause_active(&self) -> bool {
        self.pause_active
    }

    /// Set the hard pause flag.
    pub const fn set_pause_active(&mut self, pausing: bool) {
        self.pause_active = pausing;
    }

    /// Toggle the hard pause flag.
    pub const fn invert_pausing(&mut self) {
        self.pause_active = !self.pause_active;
    }

    /// Start a soft stall for the given duration.
    ///
    /// Does not alter the hard pause flag.
    pub const fn pause_for(&mut self, duration_ms: u64) {
        self.pause_remaining_ms = duration_ms;
    }

    /// Remaining soft-stall time in milliseconds.
    pub const fn pause_remaining_ms(&self) -> u64 {
        self.pause_remaining_ms
    }

    /// Consume one wall tick of a running soft stall.
    ///
    /// Returns `true` if this tick was swallowed by the stall (the caller
    /// must not advance the simulation), `false` if no stall is active.
    pub const fn consume_stall(&mut self, wall_tick_ms: u64) -> bool {
        if self.pause_remaining_ms == 0 {
            return false;
        }
        self.pause_remaining_ms = self.pause_remaining_ms.saturating_sub(wall_tick_ms);
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn increase_then_decrease_walks_the_exact_sequence() {
        // 1 -> 2 -> 3 -> 4 -> 5 -> 4 -> 3 -> 2 -> 1
        let mut controller = SpeedController::new();
        let mut observed = vec![controller.speed_factor()];
        for _ in 0..4 {
            controller.increase(1.0);
            observed.push(controller.speed_factor());
        }
        for _ in 0..4 {
            controller.decrease(1.0);
            observed.push(controller.speed_factor());
        }
        assert_eq!(observed, vec![1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0, 2.0, 1.0]);
    }

    #[test]
    fn increase_normalizes_sub_baseline_speed_to_one() {
        let mut controller = SpeedController::new();
        controller.set_speed_factor(0.5);
        controller.increase(3.0);
        assert_eq!(controller.speed_factor(), 1.0);
    }

    #[test]
    fn increase_clamps_to_upper_bound() {
        let mut controller = SpeedController::new();
        controller.set_speed_factor(199.5);
        controller.increase(5.0);
        assert_eq!(controller.speed_factor(), MAX_SPEED);
    }

    #[test]
    fn decrease_shrinks_sub_baseline_speed_multiplicatively() {
        let mut controller = SpeedController::new();
        controller.decrease(1.0);
        // 1 / (2 * 1) = 0.5
        assert_eq!(controller.speed_factor(), 0.5);
        controller.decrease(1.0);
        // 0.5 / 2 = 0.25
        assert_eq!(controller.speed_factor(), 0.25);
    }

    #[test]
    fn decrease_at_floor_is_an_idempotent_no_op() {
        let mut controller = SpeedController::new();
        controller.set_speed_factor(MIN_SPEED);
        for _ in 0..10 {
            controller.decrease(1.0);
            assert_eq!(controller.speed_factor(), MIN_SPEED);
        }
    }

    #[test]
    fn decrease_snaps_open_interval_to_one() {
        let mut controller = SpeedController::new();
        controller.set_speed_factor(1.5);
        controller.decrease(1.0);
        assert_eq!(controller.speed_factor(), 1.0);
    }

    #[test]
    fn multiply_is_unchecked() {
        let mut controller = SpeedController::new();
        controller.multiply(500.0);
        assert_eq!(controller.speed_factor(), 500.0);
        controller.multiply(0.001);
        assert_eq!(controller.speed_factor(), 0.5);
    }

    #[test]
    fn pause_flag_flips() {
        let mut controller = SpeedController::new();
        assert!(!controller.is_pause_active());
        controller.invert_pausing();
        assert!(controller.is_pause_active());
        controller.set_pause_active(false);
        assert!(!controller.is_pause_active());
    }

    #[test]
    fn soft_stall_consumes_wall_ticks_then_expires() {
        let mut controller = SpeedController::new();
        controller.pause_for(120);
        assert!(controller.consume_stall(50));
        assert!(controller.consume_stall(50));
        assert!(controller.consume_stall(50));
        // Countdown exhausted; the next tick runs normally.
        assert!(!controller.consume_stall(50));
        assert!(!controller.is_pause_active());
    }

    #[test]
    fn pause_for_does_not_touch_the_hard_flag() {
        let mut controller = SpeedController::new();
        controller.pause_for(1_000);
        assert!(!controller.is_pause_active());
    }
}
