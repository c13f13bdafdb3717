//! Gradient ascent over one or two coupled axes.
//!
//! Central finite differences around the current position give a gradient
//! estimate, normalized to a unit ascent direction. The strategy then walks
//! fixed-length steps along that direction, re-estimating it at a configured
//! interval, until trials stop improving.
//!
//! Axis pairs come from configuration; the two mirror mounts steer the beam
//! together, so the useful knob pairs couple one axis from each mount.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::GradientSettings;
use crate::error::AlignResult;
use crate::objective::Objective;
use crate::search::{CancelToken, SearchState, SearchStrategy};

/// Finite-difference ascent along configured axis groups.
pub struct GradientAscent {
    settings: GradientSettings,
    no_update_threshold: u32,
}

impl GradientAscent {
    /// Build the phase from its settings and the shared stagnation limit.
    pub fn new(settings: GradientSettings, no_update_threshold: u32) -> Self {
        Self {
            settings,
            no_update_threshold,
        }
    }

    /// Axis index groups to ascend, in order.
    ///
    /// A single-axis objective collapses to one group regardless of the
    /// configured pairs; pairs that reference missing axes are skipped.
    fn axis_groups(&self, axis_count: usize) -> Vec<Vec<usize>> {
        if axis_count == 1 {
            return vec![vec![0]];
        }
        self.settings
            .axis_pairs
            .iter()
            .filter(|(a, b)| {
                let valid = *a < axis_count && *b < axis_count;
                if !valid {
                    warn!(pair = ?(a, b), axis_count, "axis pair out of range, skipped");
                }
                valid
            })
            .map(|&(a, b)| vec![a, b])
            .collect()
    }

    /// Estimate a unit ascent direction at `position` via `±step` probes.
    ///
    /// Probe values feed the running best like any other trial. Returns
    /// `None` when the neighborhood is flat or both probes of every axis
    /// were dropped.
    async fn estimate_direction(
        &self,
        objective: &dyn Objective,
        state: &mut SearchState,
        cancel: &CancelToken,
        axes: &[usize],
        position: &[f64],
    ) -> AlignResult<Option<Vec<f64>>> {
        let mut gradient = vec![0.0; axes.len()];
        for (k, &axis) in axes.iter().enumerate() {
            let mut plus = position.to_vec();
            plus[axis] += self.settings.step;
            let mut minus = position.to_vec();
            minus[axis] -= self.settings.step;

            let up = cancel.guard(objective.evaluate(&plus)).await?;
            let down = cancel.guard(objective.evaluate(&minus)).await?;
            if let Some(value) = up {
                state.observe(&plus, value);
            }
            if let Some(value) = down {
                state.observe(&minus, value);
            }
            if let (Some(up), Some(down)) = (up, down) {
                gradient[k] = (up - down) / (2.0 * self.settings.step);
            }
        }

        let norm = gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
        if norm <= f64::EPSILON {
            debug!(?axes, "gradient vanished, no ascent direction");
            return Ok(None);
        }
        Ok(Some(gradient.iter().map(|g| g / norm).collect()))
    }

    /// Walk one axis group until trials stop improving.
    async fn ascend(
        &self,
        objective: &dyn Objective,
        state: &mut SearchState,
        cancel: &CancelToken,
        axes: &[usize],
    ) -> AlignResult<()> {
        let mut position = objective.current_positions().await?;
        state.reset_stagnation();

        let Some(mut direction) = self
            .estimate_direction(objective, state, cancel, axes, &position)
            .await?
        else {
            return Ok(());
        };

        let mut steps_since_refresh = 0u32;
        while state.stagnation_count < self.no_update_threshold {
            if self.settings.direction_update_interval > 0
                && steps_since_refresh >= self.settings.direction_update_interval
            {
                match self
                    .estimate_direction(objective, state, cancel, axes, &position)
                    .await?
                {
                    Some(refreshed) => direction = refreshed,
                    None => break,
                }
                steps_since_refresh = 0;
                if state.stagnation_count >= self.no_update_threshold {
                    break;
                }
            }

            for (k, &axis) in axes.iter().enumerate() {
                position[axis] += self.settings.step * direction[k];
            }
            match cancel.guard(objective.evaluate(&position)).await? {
                Some(value) => {
                    if state.observe(&position, value) {
                        debug!(?axes, value, "ascent improved best");
                    }
                }
                None => state.record_miss(),
            }
            steps_since_refresh += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl SearchStrategy for GradientAscent {
    fn name(&self) -> &'static str {
        "gradient"
    }

    async fn run(
        &self,
        objective: &dyn Objective,
        state: &mut SearchState,
        cancel: &CancelToken,
    ) -> AlignResult<()> {
        let groups = self.axis_groups(objective.axis_count());
        for outer in 0..self.settings.iterations {
            let previous = state.best_value;

            for group in &groups {
                self.ascend(objective, state, cancel, group).await?;
            }

            state.iteration += 1;
            info!(outer, best = state.best_value, "gradient iteration complete");

            if state.best_value < previous * self.settings.plateau_ratio {
                debug!("gradient plateaued, stopping phase");
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::testkit::FunctionObjective;

    fn settings(pairs: Vec<(usize, usize)>) -> GradientSettings {
        GradientSettings {
            iterations: 2,
            step: 10.0,
            direction_update_interval: 5,
            axis_pairs: pairs,
            plateau_ratio: 1.03,
        }
    }

    #[tokio::test]
    async fn one_axis_quadratic_lands_within_one_step() {
        let objective =
            FunctionObjective::new(vec![1500.0], 0.0, 4000.0, |p| 1.0 - (p[0] - 2000.0).powi(2) / 1e6);
        let mut state = SearchState::seeded(vec![1500.0], 0.75);

        GradientAscent::new(settings(vec![]), 3)
            .run(&objective, &mut state, &CancelToken::never())
            .await
            .unwrap();

        assert!((state.best_position[0] - 2000.0).abs() <= 10.0);
    }

    #[tokio::test]
    async fn two_axis_pair_walks_the_diagonal() {
        let objective = FunctionObjective::new(vec![1800.0, 2300.0], 0.0, 4000.0, |p| {
            1.0 - ((p[0] - 2000.0).powi(2) + (p[1] - 2500.0).powi(2)) / 1e6
        });
        let seed = 1.0 - (200.0f64.powi(2) * 2.0) / 1e6;
        let mut state = SearchState::seeded(vec![1800.0, 2300.0], seed);

        GradientAscent::new(settings(vec![(0, 1)]), 3)
            .run(&objective, &mut state, &CancelToken::never())
            .await
            .unwrap();

        let d = ((state.best_position[0] - 2000.0).powi(2)
            + (state.best_position[1] - 2500.0).powi(2))
        .sqrt();
        assert!(d <= 50.0, "stopped {d} counts from the optimum");
        assert!(state.best_value > seed);
    }

    #[tokio::test]
    async fn flat_function_gives_no_direction() {
        let objective = FunctionObjective::new(vec![2000.0], 0.0, 4000.0, |_| 1.0);
        let mut state = SearchState::seeded(vec![2000.0], 1.0);

        GradientAscent::new(settings(vec![]), 3)
            .run(&objective, &mut state, &CancelToken::never())
            .await
            .unwrap();

        // Two probes per outer iteration, never a walk step. The first
        // iteration plateaus the phase.
        assert_eq!(objective.evaluations(), 2);
        assert_eq!(state.best_position, vec![2000.0]);
    }

    #[tokio::test]
    async fn bound_drops_count_as_stagnation() {
        // Monotone increasing metric, so the walk marches into the upper
        // bound and the dropped trials beyond it end the phase.
        let objective = FunctionObjective::new(vec![3980.0], 0.0, 4000.0, |p| p[0] / 4000.0);
        let mut state = SearchState::seeded(vec![3980.0], 3980.0 / 4000.0);

        GradientAscent::new(settings(vec![]), 3)
            .run(&objective, &mut state, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(state.best_position, vec![4000.0]);
    }

    #[tokio::test]
    async fn out_of_range_pairs_are_skipped() {
        let objective = FunctionObjective::new(vec![2000.0, 2000.0], 0.0, 4000.0, |_| 1.0);
        let mut state = SearchState::seeded(vec![2000.0, 2000.0], 1.0);

        // Both configured pairs reference axes 2 and 3 of a 2-axis rig.
        GradientAscent::new(settings(vec![(0, 3), (1, 2)]), 3)
            .run(&objective, &mut state, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(objective.evaluations(), 0);
    }

    #[tokio::test]
    async fn cancellation_aborts_mid_phase() {
        let objective = FunctionObjective::new(vec![1500.0], 0.0, 4000.0, |p| p[0]);
        let mut state = SearchState::seeded(vec![1500.0], 1500.0);

        let (tx, cancel) = CancelToken::channel();
        tx.send(true).unwrap();
        let err = GradientAscent::new(settings(vec![]), 3)
            .run(&objective, &mut state, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::AlignError::Interrupted(_)));
    }
}
