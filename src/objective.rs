//! Alignment objective: move, settle, measure.
//!
//! The search strategies never touch hardware types. They see one trait,
//! [`Objective`], whose single interesting method turns a trial position
//! vector into a scalar metric. [`BeamObjective`] is the rig-backed
//! implementation wiring [`ServoController`] and [`ScopeSampler`] together
//! with the metric calibration from configuration.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{ActuatorSettings, AlignConfig, InstrumentSettings, MetricSettings};
use crate::error::{AlignError, AlignResult};
use crate::hardware::{ScopeSampler, ServoController};

/// What to do when a trial position falls outside the commandable bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundsPolicy {
    /// Skip the trial entirely: no motion, no sampling, no metric.
    #[default]
    Drop,
    /// Clip the offending axes to the nearest bound and proceed.
    Clip,
    /// Fail the evaluation with `AlignError::OutOfRange`.
    Raise,
}

/// One completed trial: where the rig was told to go and what it measured.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveSample {
    /// Commanded position vector, after any clipping
    pub positions: Vec<f64>,
    /// Scaled metric value
    pub metric: f64,
    /// False when the trial was dropped by the bounds policy
    pub valid: bool,
}

/// A scalar figure of merit over an axis position vector.
///
/// `evaluate` returns `Ok(None)` for trials the bounds policy dropped;
/// strategies count those as non-improving and move on.
#[async_trait]
pub trait Objective: Send + Sync {
    /// Number of axes the position vectors must carry.
    fn axis_count(&self) -> usize;

    /// Evaluate the metric at `positions`.
    async fn evaluate(&self, positions: &[f64]) -> AlignResult<Option<f64>>;

    /// Read the actuator's present position vector.
    async fn current_positions(&self) -> AlignResult<Vec<f64>>;

    /// Drive the actuator to `positions` and leave it there.
    async fn commit(&self, positions: &[f64]) -> AlignResult<()>;
}

/// Hardware-backed objective: grouped servo move, settle, averaged capture.
pub struct BeamObjective {
    servo: Arc<ServoController>,
    scope: Arc<ScopeSampler>,
    actuator: ActuatorSettings,
    instrument: InstrumentSettings,
    metric: MetricSettings,
}

impl BeamObjective {
    /// Build an objective over connected, configured hardware handles.
    pub fn new(servo: Arc<ServoController>, scope: Arc<ScopeSampler>, config: &AlignConfig) -> Self {
        Self {
            servo,
            scope,
            actuator: config.actuator.clone(),
            instrument: config.instrument.clone(),
            metric: config.metric.clone(),
        }
    }

    /// Evaluate `positions` and package the outcome as an [`ObjectiveSample`].
    ///
    /// Dropped trials come back with `valid: false` and a metric of zero;
    /// errors propagate unchanged.
    pub async fn sample_at(&self, positions: &[f64]) -> AlignResult<ObjectiveSample> {
        match self.evaluate(positions).await? {
            Some(metric) => Ok(ObjectiveSample {
                positions: positions.to_vec(),
                metric,
                valid: true,
            }),
            None => Ok(ObjectiveSample {
                positions: positions.to_vec(),
                metric: 0.0,
                valid: false,
            }),
        }
    }

    /// Apply the bounds policy to a trial vector.
    ///
    /// `Ok(None)` means the trial was dropped; `Ok(Some(v))` is the vector
    /// to actually command, clipped when the policy says so.
    fn apply_bounds(&self, positions: &[f64]) -> AlignResult<Option<Vec<f64>>> {
        let (min, max) = (self.actuator.position_min, self.actuator.position_max);
        let offender = positions.iter().position(|p| *p < min || *p > max);

        let Some(axis) = offender else {
            return Ok(Some(positions.to_vec()));
        };

        match self.metric.bounds_policy {
            BoundsPolicy::Drop => {
                debug!(
                    axis,
                    value = positions[axis],
                    "trial outside bounds, dropped"
                );
                Ok(None)
            }
            BoundsPolicy::Clip => Ok(Some(
                positions.iter().map(|p| p.clamp(min, max)).collect(),
            )),
            BoundsPolicy::Raise => Err(AlignError::OutOfRange {
                axis,
                value: positions[axis],
                min,
                max,
            }),
        }
    }
}

#[async_trait]
impl Objective for BeamObjective {
    fn axis_count(&self) -> usize {
        self.servo.axis_count()
    }

    async fn evaluate(&self, positions: &[f64]) -> AlignResult<Option<f64>> {
        if positions.len() != self.axis_count() {
            return Err(AlignError::Validation(format!(
                "expected {} positions, got {}",
                self.axis_count(),
                positions.len()
            )));
        }

        let Some(target) = self.apply_bounds(positions)? else {
            return Ok(None);
        };

        self.servo.set_goal_positions(&target).await?;
        let converged = self
            .servo
            .wait_for_positions(
                &target,
                self.actuator.convergence_threshold,
                self.actuator.move_timeout,
            )
            .await?;
        if !converged {
            warn!(?target, "move did not converge, sampling anyway");
        }

        let raw = self
            .scope
            .sample(
                self.instrument.channel.as_deref(),
                self.instrument.min_samples,
                self.instrument.settle_delay,
            )
            .await?;

        let metric = (raw - self.metric.offset) / self.metric.scale;
        if metric < self.metric.noise_floor {
            return Err(AlignError::SignalNotDetected {
                metric,
                noise_floor: self.metric.noise_floor,
            });
        }

        debug!(metric, ?target, "trial evaluated");
        Ok(Some(metric))
    }

    async fn current_positions(&self) -> AlignResult<Vec<f64>> {
        let states = self.servo.read_positions().await?;
        Ok(states.iter().map(|s| s.position).collect())
    }

    async fn commit(&self, positions: &[f64]) -> AlignResult<()> {
        self.servo.set_goal_positions(positions).await?;
        let converged = self
            .servo
            .wait_for_positions(
                positions,
                self.actuator.convergence_threshold,
                self.actuator.move_timeout,
            )
            .await?;
        if !converged {
            warn!(?positions, "commit move did not converge");
        }
        Ok(())
    }
}
