//! Greedy per-axis coordinate scan.
//!
//! One outer iteration sweeps every axis in ascending index order: trial
//! positions span `[best - margin, best + margin]` at a fixed step while the
//! other axes hold the running best. The margin shrinks geometrically across
//! outer iterations, so early passes cover ground and later passes polish.
//!
//! Two stopping rules, both configurable per phase:
//! - inside a sweep, after `no_update_threshold` consecutive non-improving
//!   trials once the signal is already reasonable (coarse phases only);
//! - between outer iterations, when the best failed to grow by the plateau
//!   ratio.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::ScanPhaseSettings;
use crate::error::AlignResult;
use crate::objective::Objective;
use crate::search::{CancelToken, SearchState, SearchStrategy};

/// Coordinate scan over all axes with an annealing sweep margin.
pub struct CoordinateScan {
    name: &'static str,
    settings: ScanPhaseSettings,
    reasonable_value: f64,
    no_update_threshold: u32,
}

impl CoordinateScan {
    /// Build a scan phase.
    ///
    /// `name` distinguishes the coarse and fine instances in logs.
    pub fn new(
        name: &'static str,
        settings: ScanPhaseSettings,
        reasonable_value: f64,
        no_update_threshold: u32,
    ) -> Self {
        Self {
            name,
            settings,
            reasonable_value,
            no_update_threshold,
        }
    }

    /// Sweep one axis across `[center - margin, center + margin]`.
    async fn sweep_axis(
        &self,
        objective: &dyn Objective,
        state: &mut SearchState,
        cancel: &CancelToken,
        axis: usize,
        margin: f64,
    ) -> AlignResult<()> {
        let center = state.best_position[axis];
        state.reset_stagnation();

        let mut offset = -margin;
        while offset < margin {
            let mut trial = state.best_position.clone();
            trial[axis] = center + offset;

            match cancel.guard(objective.evaluate(&trial)).await? {
                Some(value) => {
                    if state.observe(&trial, value) {
                        debug!(axis, position = trial[axis], value, "scan improved best");
                    }
                }
                None => state.record_miss(),
            }

            if self.settings.allow_early_exit
                && state.stagnation_count >= self.no_update_threshold
                && state.best_value > self.reasonable_value
            {
                debug!(axis, "sweep early exit, signal already reasonable");
                break;
            }

            offset += self.settings.step;
        }

        // Park the rig back on the running best so the next sweep starts
        // from it physically, not just numerically.
        let best = state.best_position.clone();
        if let Some(value) = cancel.guard(objective.evaluate(&best)).await? {
            state.observe(&best, value);
        }
        Ok(())
    }
}

#[async_trait]
impl SearchStrategy for CoordinateScan {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(
        &self,
        objective: &dyn Objective,
        state: &mut SearchState,
        cancel: &CancelToken,
    ) -> AlignResult<()> {
        for outer in 0..self.settings.iterations {
            let margin = self.settings.margin / self.settings.growth.powi(outer as i32);
            let previous = state.best_value;

            for axis in 0..objective.axis_count() {
                self.sweep_axis(objective, state, cancel, axis, margin)
                    .await?;
            }

            state.iteration += 1;
            info!(
                phase = self.name,
                outer,
                margin,
                best = state.best_value,
                "scan iteration complete"
            );

            if state.best_value < previous * self.settings.plateau_ratio {
                debug!(phase = self.name, "scan plateaued, stopping phase");
                break;
            }
        }
        Ok(())
    }
}
