//! Surrogate-model search (Bayesian optimization).
//!
//! A Gaussian-process surrogate learns the metric surface from completed
//! trials, and an acquisition function picks the next trial by balancing
//! exploitation of the predicted optimum against exploration of uncertain
//! regions. The model side hides behind [`SurrogateModel`] so the strategy
//! never commits to one regression backend.
//!
//! [`GpSurrogate`] is a *minimizer*: callers hand it negated metric values.

use async_trait::async_trait;
use nalgebra::{DMatrix, DVector, Dyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::function::erf::erf;
use std::f64::consts::{PI, SQRT_2};
use tracing::{debug, info};

use crate::config::{AcquisitionKind, SurrogateSettings};
use crate::error::{AlignError, AlignResult};
use crate::objective::Objective;
use crate::search::{CancelToken, SearchState, SearchStrategy};

// Full cartesian candidate grids are only tractable in low dimension; past
// this many points the proposal falls back to seeded random candidates.
const GRID_LIMIT: usize = 4096;

/// Regression backend for the surrogate search.
///
/// All values are in the minimizer's frame; the strategy negates metrics
/// before telling the model.
pub trait SurrogateModel: Send + Sync {
    /// Replace the training set and refit.
    fn fit(&mut self, samples: &[(Vec<f64>, f64)]) -> AlignResult<()>;

    /// Pick the next trial inside the per-axis windows.
    fn propose(&mut self, windows: &[(f64, f64)]) -> AlignResult<Vec<f64>>;

    /// Append one observation and refit.
    fn update(&mut self, position: &[f64], value: f64) -> AlignResult<()>;
}

/// Zero-mean Gaussian process with a squared-exponential kernel.
pub struct GpSurrogate {
    length_scale: f64,
    signal_variance: f64,
    noise_variance: f64,
    acquisition: AcquisitionKind,
    candidates_per_axis: usize,
    rng: StdRng,
    train_x: Vec<Vec<f64>>,
    train_y: Vec<f64>,
    chol: Option<nalgebra::Cholesky<f64, Dyn>>,
    alpha: Option<DVector<f64>>,
}

impl GpSurrogate {
    /// Build a model from the phase settings.
    pub fn from_settings(settings: &SurrogateSettings) -> Self {
        Self {
            length_scale: settings.length_scale,
            signal_variance: settings.signal_variance,
            noise_variance: settings.noise_variance,
            acquisition: settings.acquisition,
            candidates_per_axis: settings.candidates_per_axis.max(2),
            rng: StdRng::seed_from_u64(settings.seed),
            train_x: Vec::new(),
            train_y: Vec::new(),
            chol: None,
            alpha: None,
        }
    }

    fn kernel(&self, a: &[f64], b: &[f64]) -> f64 {
        let d2: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
        self.signal_variance * (-d2 / (2.0 * self.length_scale * self.length_scale)).exp()
    }

    fn refit(&mut self) -> AlignResult<()> {
        let n = self.train_x.len();
        if n == 0 {
            self.chol = None;
            self.alpha = None;
            return Ok(());
        }

        let k = DMatrix::from_fn(n, n, |i, j| {
            let mut v = self.kernel(&self.train_x[i], &self.train_x[j]);
            if i == j {
                v += self.noise_variance;
            }
            v
        });
        let chol = k.cholesky().ok_or_else(|| {
            AlignError::Validation("surrogate kernel matrix is not positive definite".into())
        })?;
        let y = DVector::from_iterator(n, self.train_y.iter().copied());
        self.alpha = Some(chol.solve(&y));
        self.chol = Some(chol);
        Ok(())
    }

    /// Posterior mean and variance at `x`.
    pub fn predict(&self, x: &[f64]) -> AlignResult<(f64, f64)> {
        let (chol, alpha) = match (&self.chol, &self.alpha) {
            (Some(c), Some(a)) => (c, a),
            _ => {
                return Err(AlignError::Validation(
                    "surrogate queried before any observation".into(),
                ))
            }
        };

        let n = self.train_x.len();
        let k_star = DVector::from_iterator(n, self.train_x.iter().map(|xi| self.kernel(x, xi)));
        let mean = k_star.dot(alpha);
        let v = chol.solve(&k_star);
        let variance = (self.signal_variance - k_star.dot(&v)).max(1e-12);
        Ok((mean, variance))
    }

    /// Acquisition score for a predicted `(mean, variance)` against the
    /// incumbent minimum. Higher is better.
    fn score(&self, mean: f64, variance: f64, incumbent: f64) -> f64 {
        let sigma = variance.sqrt();
        let improvement = incumbent - mean;
        if sigma < 1e-9 {
            return improvement.max(0.0);
        }
        let z = improvement / sigma;
        match self.acquisition {
            AcquisitionKind::ExpectedImprovement => {
                improvement * standard_normal_cdf(z) + sigma * standard_normal_pdf(z)
            }
            AcquisitionKind::ProbabilityOfImprovement => standard_normal_cdf(z),
        }
    }

    fn random_candidate(&mut self, windows: &[(f64, f64)]) -> Vec<f64> {
        windows
            .iter()
            .map(|&(lo, hi)| self.rng.gen_range(lo..=hi))
            .collect()
    }

    /// Candidate set over the window box: a full cartesian grid while it
    /// stays small, seeded random draws otherwise.
    fn candidates(&mut self, windows: &[(f64, f64)]) -> Vec<Vec<f64>> {
        let per_axis = self.candidates_per_axis;
        let total = per_axis.checked_pow(windows.len() as u32);
        if let Some(total) = total.filter(|t| *t <= GRID_LIMIT) {
            let mut grid: Vec<Vec<f64>> = vec![Vec::new()];
            for &(lo, hi) in windows {
                let span = hi - lo;
                let points: Vec<f64> = (0..per_axis)
                    .map(|k| lo + span * k as f64 / (per_axis - 1) as f64)
                    .collect();
                let expanded: Vec<Vec<f64>> = grid
                    .iter()
                    .flat_map(|prefix| {
                        points.iter().map(move |p| {
                            let mut next = prefix.clone();
                            next.push(*p);
                            next
                        })
                    })
                    .collect();
                grid = expanded;
            }
            debug_assert_eq!(grid.len(), total);
            grid
        } else {
            (0..GRID_LIMIT).map(|_| self.random_candidate(windows)).collect()
        }
    }
}

impl SurrogateModel for GpSurrogate {
    fn fit(&mut self, samples: &[(Vec<f64>, f64)]) -> AlignResult<()> {
        self.train_x = samples.iter().map(|(x, _)| x.clone()).collect();
        self.train_y = samples.iter().map(|(_, y)| *y).collect();
        self.refit()
    }

    fn propose(&mut self, windows: &[(f64, f64)]) -> AlignResult<Vec<f64>> {
        if self.train_y.is_empty() {
            return Ok(self.random_candidate(windows));
        }

        let incumbent = self.train_y.iter().copied().fold(f64::INFINITY, f64::min);
        let candidates = self.candidates(windows);

        let mut best: Option<(f64, Vec<f64>)> = None;
        for candidate in candidates {
            let (mean, variance) = self.predict(&candidate)?;
            let score = self.score(mean, variance, incumbent);
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, candidate));
            }
        }
        best.map(|(_, c)| c)
            .ok_or_else(|| AlignError::Validation("empty candidate set".into()))
    }

    fn update(&mut self, position: &[f64], value: f64) -> AlignResult<()> {
        self.train_x.push(position.to_vec());
        self.train_y.push(value);
        self.refit()
    }
}

fn standard_normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * PI).sqrt()
}

fn standard_normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / SQRT_2))
}

/// Acquisition-driven search around the phase's starting position.
pub struct SurrogateSearch {
    settings: SurrogateSettings,
}

impl SurrogateSearch {
    /// Build the phase from its settings.
    pub fn new(settings: SurrogateSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SearchStrategy for SurrogateSearch {
    fn name(&self) -> &'static str {
        "surrogate"
    }

    async fn run(
        &self,
        objective: &dyn Objective,
        state: &mut SearchState,
        cancel: &CancelToken,
    ) -> AlignResult<()> {
        let windows: Vec<(f64, f64)> = state
            .best_position
            .iter()
            .map(|&c| (c - self.settings.window, c + self.settings.window))
            .collect();

        let mut model = GpSurrogate::from_settings(&self.settings);
        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        let block = self.settings.initial_samples.max(1);
        let mut checkpoint = state.best_value;

        let mut warmup: Vec<(Vec<f64>, f64)> = Vec::new();
        for round in 0..self.settings.iterations {
            let trial: Vec<f64> = if round < self.settings.initial_samples {
                windows
                    .iter()
                    .map(|&(lo, hi)| rng.gen_range(lo..=hi))
                    .collect()
            } else {
                if round == self.settings.initial_samples {
                    model.fit(&warmup)?;
                }
                model.propose(&windows)?
            };

            match cancel.guard(objective.evaluate(&trial)).await? {
                Some(value) => {
                    // The model minimizes, the metric is maximized.
                    if round < self.settings.initial_samples {
                        warmup.push((trial.clone(), -value));
                    } else {
                        model.update(&trial, -value)?;
                    }
                    state.observe(&trial, value);
                }
                None => state.record_miss(),
            }
            state.iteration += 1;

            let past_warmup = round + 1 > self.settings.initial_samples;
            if past_warmup && (round + 1 - self.settings.initial_samples) % block == 0 {
                if state.best_value < checkpoint * self.settings.plateau_ratio {
                    debug!(round, best = state.best_value, "surrogate plateaued");
                    break;
                }
                checkpoint = state.best_value;
            }
        }

        info!(best = state.best_value, "surrogate phase complete");
        // The last trial is rarely the best one; leave the rig on the best.
        cancel
            .guard(objective.commit(&state.best_position))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::testkit::FunctionObjective;

    fn settings(seed: u64) -> SurrogateSettings {
        SurrogateSettings {
            iterations: 60,
            initial_samples: 10,
            window: 100.0,
            candidates_per_axis: 25,
            length_scale: 50.0,
            signal_variance: 1.0,
            noise_variance: 1e-4,
            acquisition: AcquisitionKind::ExpectedImprovement,
            seed,
            plateau_ratio: 1.01,
        }
    }

    #[test]
    fn gp_interpolates_training_points() {
        let mut gp = GpSurrogate::from_settings(&settings(1));
        let samples: Vec<(Vec<f64>, f64)> = (0..9)
            .map(|k| {
                let x = 1800.0 + 50.0 * k as f64;
                (vec![x], (x - 2000.0).powi(2) / 1e4)
            })
            .collect();
        gp.fit(&samples).unwrap();

        let (mean, variance) = gp.predict(&[2000.0]).unwrap();
        assert!((mean - 0.0).abs() < 0.05, "mean {mean}");
        assert!(variance < 0.01, "variance {variance}");
    }

    #[test]
    fn gp_is_uncertain_far_from_data() {
        let mut gp = GpSurrogate::from_settings(&settings(1));
        gp.fit(&[(vec![2000.0], 1.0)]).unwrap();

        let (_, near) = gp.predict(&[2001.0]).unwrap();
        let (_, far) = gp.predict(&[2500.0]).unwrap();
        assert!(far > near * 100.0);
    }

    #[test]
    fn propose_stays_inside_the_windows() {
        let mut gp = GpSurrogate::from_settings(&settings(1));
        gp.fit(&[
            (vec![1950.0, 2450.0], -0.9),
            (vec![2050.0, 2550.0], -0.8),
            (vec![2000.0, 2500.0], -1.0),
        ])
        .unwrap();

        let windows = [(1900.0, 2100.0), (2400.0, 2600.0)];
        let proposal = gp.propose(&windows).unwrap();
        for (p, (lo, hi)) in proposal.iter().zip(windows) {
            assert!(*p >= lo && *p <= hi);
        }
    }

    #[test]
    fn high_dimensional_proposals_fall_back_to_random_candidates() {
        // 25^4 exceeds the grid limit; proposals must still stay in the box.
        let mut gp = GpSurrogate::from_settings(&settings(1));
        gp.fit(&[
            (vec![10.0, 10.0, 10.0, 10.0], -1.0),
            (vec![90.0, 90.0, 90.0, 90.0], -0.5),
        ])
        .unwrap();

        let windows = [(0.0, 100.0); 4];
        let proposal = gp.propose(&windows).unwrap();
        assert_eq!(proposal.len(), 4);
        for (p, (lo, hi)) in proposal.iter().zip(windows) {
            assert!(*p >= lo && *p <= hi);
        }
    }

    #[tokio::test]
    async fn concave_two_axis_surface_is_located() {
        for seed in [1, 7, 42] {
            let objective = FunctionObjective::new(vec![1950.0, 2450.0], 0.0, 4000.0, |p| {
                -((p[0] - 2000.0).powi(2) + (p[1] - 2500.0).powi(2)) / 1e6
            });
            let start = vec![1950.0, 2450.0];
            let seed_value = -(2500.0 + 2500.0) / 1e6;
            let mut state = SearchState::seeded(start, seed_value);

            SurrogateSearch::new(settings(seed))
                .run(&objective, &mut state, &CancelToken::never())
                .await
                .unwrap();

            let d = ((state.best_position[0] - 2000.0).powi(2)
                + (state.best_position[1] - 2500.0).powi(2))
            .sqrt();
            assert!(d <= 50.0, "seed {seed} stopped {d} counts out");
        }
    }

    #[tokio::test]
    async fn flat_surface_plateaus_after_one_block() {
        let objective = FunctionObjective::new(vec![2000.0], 0.0, 4000.0, |_| 1.0);
        let mut state = SearchState::seeded(vec![2000.0], 1.0);

        SurrogateSearch::new(settings(1))
            .run(&objective, &mut state, &CancelToken::never())
            .await
            .unwrap();

        // 10 warmup rounds plus one acquisition block, then the plateau
        // rule stops the phase.
        assert_eq!(state.iteration, 20);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_phase() {
        let objective = FunctionObjective::new(vec![2000.0], 0.0, 4000.0, |_| 1.0);
        let mut state = SearchState::seeded(vec![2000.0], 1.0);

        let (tx, cancel) = CancelToken::channel();
        tx.send(true).unwrap();
        let err = SurrogateSearch::new(settings(1))
            .run(&objective, &mut state, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AlignError::Interrupted(_)));
    }
}
