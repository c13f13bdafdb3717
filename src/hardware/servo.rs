//! Multi-axis servo controller.
//!
//! Drives a chain of bus servos (mirror mount actuators) through the
//! [`ActuatorBus`] transport trait. All multi-axis operations use grouped
//! transactions so every axis sees the command in the same bus cycle.
//!
//! Axis order is fixed at construction: position vectors are indexed the
//! same way as the id list handed to [`ServoController::new`], everywhere.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{AlignError, AlignResult};
use crate::hardware::bus::ActuatorBus;

// Servo control table
const REG_TORQUE_ENABLE: u8 = 40;
const REG_GOAL_ACCELERATION: u8 = 41;
const REG_GOAL_POSITION: u8 = 42;
const REG_GOAL_SPEED: u8 = 46;
const REG_PRESENT_STATUS: u8 = 56;

/// One servo channel's last-read status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisState {
    /// Bus id of the servo
    pub id: u8,
    /// Present position, logical counts
    pub position: f64,
    /// Present speed, sign-magnitude decoded
    pub speed: i32,
}

/// Controller for a fixed set of servo axes on one bus.
pub struct ServoController {
    bus: Arc<dyn ActuatorBus>,
    axis_ids: Vec<u8>,
    poll_interval: Duration,
}

impl ServoController {
    /// Create a controller over `bus` for the given axis ids.
    ///
    /// `poll_interval` spaces the reads inside [`Self::wait_for_positions`].
    pub fn new(bus: Arc<dyn ActuatorBus>, axis_ids: Vec<u8>, poll_interval: Duration) -> Self {
        Self {
            bus,
            axis_ids,
            poll_interval,
        }
    }

    /// Number of controlled axes.
    pub fn axis_count(&self) -> usize {
        self.axis_ids.len()
    }

    /// Open the bus. Fatal on failure; nothing has moved yet.
    pub async fn connect(&self) -> AlignResult<()> {
        self.bus
            .open()
            .await
            .map_err(|e| AlignError::Connection(format!("actuator bus open failed: {e}")))?;
        info!(axes = self.axis_ids.len(), "actuator bus connected");
        Ok(())
    }

    /// Write goal acceleration and speed to every axis.
    pub async fn configure(&self, acceleration: u32, speed: u32) -> AlignResult<()> {
        for &id in &self.axis_ids {
            self.bus
                .single_write(id, REG_GOAL_ACCELERATION, 1, acceleration)
                .await?;
            self.bus.single_write(id, REG_GOAL_SPEED, 2, speed).await?;
        }
        debug!(acceleration, speed, "servos configured");
        Ok(())
    }

    /// Command all axes to `positions` in one grouped write.
    ///
    /// The vector length must match the axis count. Every frame is staged
    /// before anything is transmitted, so a failure here means zero motion.
    pub async fn set_goal_positions(&self, positions: &[f64]) -> AlignResult<()> {
        if positions.len() != self.axis_ids.len() {
            return Err(AlignError::Validation(format!(
                "expected {} positions, got {}",
                self.axis_ids.len(),
                positions.len()
            )));
        }

        let frames: Vec<(u8, Vec<u8>)> = self
            .axis_ids
            .iter()
            .zip(positions)
            .map(|(&id, &pos)| {
                let wire = codec::encode(pos.round() as i32);
                (id, wire.to_le_bytes().to_vec())
            })
            .collect();

        self.bus.grouped_write(REG_GOAL_POSITION, 2, &frames).await
    }

    /// Read present position and speed from every axis in one grouped read.
    pub async fn read_positions(&self) -> AlignResult<Vec<AxisState>> {
        let raw = self
            .bus
            .grouped_read(REG_PRESENT_STATUS, 4, &self.axis_ids)
            .await?;

        let mut states = Vec::with_capacity(self.axis_ids.len());
        for &id in &self.axis_ids {
            let data = raw
                .get(&id)
                .ok_or_else(|| AlignError::Transport(format!("axis {id} missing from sync read")))?;
            if data.len() < 4 {
                return Err(AlignError::Transport(format!(
                    "axis {id} returned {} status bytes, expected 4",
                    data.len()
                )));
            }
            let position_word = u16::from_le_bytes([data[0], data[1]]);
            let speed_word = u16::from_le_bytes([data[2], data[3]]);
            states.push(AxisState {
                id,
                position: f64::from(codec::decode(position_word)),
                speed: codec::decode_speed(speed_word),
            });
        }
        Ok(states)
    }

    /// Poll until every axis is within `threshold` counts of its target.
    ///
    /// Returns `Ok(false)` on timeout; the caller decides whether a late
    /// actuator matters. Transport faults still propagate as errors.
    pub async fn wait_for_positions(
        &self,
        targets: &[f64],
        threshold: f64,
        timeout: Duration,
    ) -> AlignResult<bool> {
        if targets.len() != self.axis_ids.len() {
            return Err(AlignError::Validation(format!(
                "expected {} targets, got {}",
                self.axis_ids.len(),
                targets.len()
            )));
        }

        let start = tokio::time::Instant::now();
        loop {
            let states = self.read_positions().await?;
            let reached = states
                .iter()
                .zip(targets)
                .all(|(state, &target)| (target - state.position).abs() <= threshold);
            if reached {
                return Ok(true);
            }

            if start.elapsed() > timeout {
                let residual: f64 = states
                    .iter()
                    .zip(targets)
                    .map(|(state, &target)| (target - state.position).abs())
                    .fold(0.0, f64::max);
                debug!(?timeout, residual, "convergence wait timed out");
                return Ok(false);
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Enable or disable torque on one axis.
    pub async fn set_torque(&self, id: u8, enable: bool) -> AlignResult<()> {
        self.bus
            .single_write(id, REG_TORQUE_ENABLE, 1, u32::from(enable))
            .await
    }

    /// Best-effort torque-off on every axis, then close the bus.
    ///
    /// Torque failures are logged and suppressed; the mirrors must be left
    /// free-moving even if one servo stops answering.
    pub async fn disconnect(&self) -> AlignResult<()> {
        for &id in &self.axis_ids {
            if let Err(e) = self.set_torque(id, false).await {
                warn!(axis = id, error = %e, "torque-off failed during disconnect");
            }
        }
        self.bus.close().await?;
        info!("actuator bus disconnected");
        Ok(())
    }
}
