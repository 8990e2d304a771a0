//! Milestone pacing.
//!
//! Each wall-clock second is split into `fps_target` evenly spaced phase points.
//! A reader sleeps until the next phase point instead of chaining fixed sleeps,
//! so read times stay anchored to the same phase (and therefore line up across
//! cameras sharing a clock) rather than accumulating drift.

use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct Pacer {
    fps_target: u32,
    milestones: Vec<f64>,
}

impl Pacer {
    /// `fps_target` must be at least 1; callers validate before constructing.
    pub fn new(fps_target: u32) -> Self {
        let milestones = (0..fps_target)
            .map(|i| f64::from(i) / f64::from(fps_target))
            .collect();
        Self {
            fps_target,
            milestones,
        }
    }

    pub fn fps_target(&self) -> u32 {
        self.fps_target
    }

    pub fn milestones(&self) -> &[f64] {
        &self.milestones
    }

    /// Time to wait from `now_secs` (fractional seconds on the pacing clock)
    /// until the next milestone strictly in the future.
    pub fn wait_from(&self, now_secs: f64) -> Duration {
        let fractional = now_secs.rem_euclid(1.0);
        let wait = self
            .milestones
            .iter()
            .map(|milestone| milestone - fractional)
            .find(|wait| *wait > 0.0)
            .unwrap_or(1.0 - fractional);
        Duration::from_secs_f64(wait.max(0.0))
    }
}
