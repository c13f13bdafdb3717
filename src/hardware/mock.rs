//! Mock Hardware Implementations
//!
//! Provides simulated hardware for exercising the alignment loop without a
//! bench. All mocks are async-safe (tokio primitives, no std::thread::sleep)
//! and deterministic unless noise is explicitly requested.
//!
//! # Available Mocks
//!
//! - `MockBus` - simulated servo chain with per-read slewing toward goals
//! - `MockScopeIo` - simulated instrument session whose waveform derives
//!   from a metric function of the current axis positions
//! - `SimulatedRig` - the two wired together, the test bench in software

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::codec;
use crate::error::{AlignError, AlignResult};
use crate::hardware::bus::{ActuatorBus, InstrumentIo};

// =============================================================================
// MockBus - Simulated Servo Chain
// =============================================================================

#[derive(Debug, Clone)]
struct MockAxis {
    goal: u16,
    position: f64,
    speed: i32,
    torque: bool,
    acceleration: u32,
    speed_setting: u32,
}

/// Mock servo bus.
///
/// Axes slew toward their goal by a fixed number of counts per grouped
/// read, which lets convergence tests control exactly how the rig behaves:
/// infinite slew snaps instantly, zero slew freezes the rig.
pub struct MockBus {
    axes: RwLock<HashMap<u8, MockAxis>>,
    order: Vec<u8>,
    open: AtomicBool,
    transmit_count: AtomicU32,
    slew_per_read: RwLock<f64>,
    staging_failure: RwLock<Option<u8>>,
    fail_single_writes: AtomicBool,
    fail_grouped_reads: AtomicBool,
}

impl MockBus {
    /// Create a bus with the given `(id, initial position)` axes.
    pub fn new(axes: &[(u8, i32)]) -> Self {
        let map = axes
            .iter()
            .map(|&(id, pos)| {
                (
                    id,
                    MockAxis {
                        goal: codec::encode(pos),
                        position: f64::from(pos),
                        speed: 0,
                        torque: false,
                        acceleration: 0,
                        speed_setting: 0,
                    },
                )
            })
            .collect();
        Self {
            axes: RwLock::new(map),
            order: axes.iter().map(|&(id, _)| id).collect(),
            open: AtomicBool::new(false),
            transmit_count: AtomicU32::new(0),
            slew_per_read: RwLock::new(f64::INFINITY),
            staging_failure: RwLock::new(None),
            fail_single_writes: AtomicBool::new(false),
            fail_grouped_reads: AtomicBool::new(false),
        }
    }

    /// Counts an axis moves per grouped read; INFINITY snaps, 0.0 freezes.
    pub async fn set_slew_per_read(&self, counts: f64) {
        *self.slew_per_read.write().await = counts;
    }

    /// Make staging fail for `id` on the next grouped writes.
    pub async fn fail_staging_for(&self, id: u8) {
        *self.staging_failure.write().await = Some(id);
    }

    /// Make every single-register write fail.
    pub fn fail_single_writes(&self) {
        self.fail_single_writes.store(true, Ordering::SeqCst);
    }

    /// Make every grouped read fail.
    pub fn fail_grouped_reads(&self) {
        self.fail_grouped_reads.store(true, Ordering::SeqCst);
    }

    /// Number of grouped writes that reached the simulated wire.
    pub fn transmit_count(&self) -> u32 {
        self.transmit_count.load(Ordering::SeqCst)
    }

    /// Whether the port is open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Last transmitted goal word for `id`.
    pub async fn goal(&self, id: u8) -> u16 {
        self.axes.read().await[&id].goal
    }

    /// Whether torque is enabled on `id`.
    pub async fn torque(&self, id: u8) -> bool {
        self.axes.read().await[&id].torque
    }

    /// Configured acceleration and speed for `id`.
    pub async fn drive_settings(&self, id: u8) -> (u32, u32) {
        let axes = self.axes.read().await;
        (axes[&id].acceleration, axes[&id].speed_setting)
    }

    /// Current simulated positions, in construction order.
    pub async fn positions(&self) -> Vec<f64> {
        let axes = self.axes.read().await;
        self.order.iter().map(|id| axes[id].position).collect()
    }

    fn advance(axis: &mut MockAxis, slew: f64) {
        let target = f64::from(codec::decode(axis.goal));
        let delta = target - axis.position;
        if delta == 0.0 {
            axis.speed = 0;
            return;
        }
        let step = if slew.is_infinite() {
            delta
        } else {
            delta.signum() * slew.min(delta.abs())
        };
        axis.position += step;
        axis.speed = step.round() as i32;
    }
}

#[async_trait]
impl ActuatorBus for MockBus {
    async fn open(&self) -> AlignResult<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> AlignResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn grouped_write(
        &self,
        _reg: u8,
        width: u8,
        frames: &[(u8, Vec<u8>)],
    ) -> AlignResult<()> {
        // Staging pass: everything is checked before anything is applied.
        {
            let axes = self.axes.read().await;
            let failure = *self.staging_failure.read().await;
            for (id, data) in frames {
                if Some(*id) == failure {
                    return Err(AlignError::Transport(format!(
                        "axis {id} sync write addparam failed"
                    )));
                }
                if !axes.contains_key(id) {
                    return Err(AlignError::Transport(format!("axis {id} not on bus")));
                }
                if data.len() != usize::from(width) {
                    return Err(AlignError::Transport(format!(
                        "axis {id} frame is {} bytes, expected {width}",
                        data.len()
                    )));
                }
            }
        }

        self.transmit_count.fetch_add(1, Ordering::SeqCst);

        let mut axes = self.axes.write().await;
        for (id, data) in frames {
            if let Some(axis) = axes.get_mut(id) {
                axis.goal = u16::from_le_bytes([data[0], data[1]]);
            }
        }
        Ok(())
    }

    async fn grouped_read(
        &self,
        _reg: u8,
        _width: u8,
        ids: &[u8],
    ) -> AlignResult<HashMap<u8, Vec<u8>>> {
        if self.fail_grouped_reads.load(Ordering::SeqCst) {
            return Err(AlignError::Transport("sync read txRx failed".into()));
        }

        let slew = *self.slew_per_read.read().await;
        let mut axes = self.axes.write().await;
        let mut result = HashMap::with_capacity(ids.len());
        for id in ids {
            let axis = axes
                .get_mut(id)
                .ok_or_else(|| AlignError::Transport(format!("axis {id} not on bus")))?;
            Self::advance(axis, slew);

            let position_word = codec::encode(axis.position.round() as i32);
            let speed_word = if axis.speed < 0 {
                0x8000 | (axis.speed.unsigned_abs() as u16 & 0x7FFF)
            } else {
                axis.speed as u16 & 0x7FFF
            };
            let mut data = position_word.to_le_bytes().to_vec();
            data.extend_from_slice(&speed_word.to_le_bytes());
            result.insert(*id, data);
        }
        Ok(result)
    }

    async fn single_write(&self, id: u8, reg: u8, _width: u8, value: u32) -> AlignResult<()> {
        if self.fail_single_writes.load(Ordering::SeqCst) {
            return Err(AlignError::Transport(format!(
                "axis {id} single write failed"
            )));
        }
        let mut axes = self.axes.write().await;
        let axis = axes
            .get_mut(&id)
            .ok_or_else(|| AlignError::Transport(format!("axis {id} not on bus")))?;
        match reg {
            40 => axis.torque = value != 0,
            41 => axis.acceleration = value,
            46 => axis.speed_setting = value,
            other => {
                return Err(AlignError::Transport(format!(
                    "unknown register {other} on axis {id}"
                )))
            }
        }
        Ok(())
    }
}

// =============================================================================
// MockScopeIo - Simulated Instrument Session
// =============================================================================

type MetricFn = dyn Fn(&[f64]) -> f64 + Send + Sync;

/// Mock instrument session.
///
/// `query_binary` synthesizes a capture buffer whose level is
/// `offset + scale * metric(positions)`, with the positions taken live from
/// an attached [`MockBus`]. Without a bus the metric sees an empty slice.
pub struct MockScopeIo {
    bus: Option<Arc<MockBus>>,
    metric: Arc<MetricFn>,
    offset: f64,
    scale: f64,
    buffer_len: AtomicUsize,
    commands: Mutex<Vec<String>>,
    connected: AtomicBool,
    noise: Mutex<Option<(f64, StdRng)>>,
}

impl MockScopeIo {
    /// Session whose buffer always reads `value`, positions ignored.
    pub fn constant(value: f64) -> Self {
        Self {
            bus: None,
            metric: Arc::new(move |_| value),
            offset: 0.0,
            scale: 1.0,
            buffer_len: AtomicUsize::new(100),
            commands: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            noise: Mutex::new(None),
        }
    }

    /// Session coupled to `bus`: buffer level follows
    /// `offset + scale * metric(positions)`.
    pub fn with_rig(
        bus: Arc<MockBus>,
        metric: impl Fn(&[f64]) -> f64 + Send + Sync + 'static,
        offset: f64,
        scale: f64,
    ) -> Self {
        Self {
            bus: Some(bus),
            metric: Arc::new(metric),
            offset,
            scale,
            buffer_len: AtomicUsize::new(100),
            commands: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            noise: Mutex::new(None),
        }
    }

    /// Shrink or grow the synthesized capture buffer.
    pub fn set_buffer_len(&self, len: usize) {
        self.buffer_len.store(len, Ordering::SeqCst);
    }

    /// Add uniform noise of the given amplitude, seeded for repeatability.
    pub async fn set_noise(&self, amplitude: f64, seed: u64) {
        *self.noise.lock().await = Some((amplitude, StdRng::seed_from_u64(seed)));
    }

    /// Every command and query sent so far.
    pub async fn command_log(&self) -> Vec<String> {
        self.commands.lock().await.clone()
    }

    async fn level(&self) -> f64 {
        let positions = match self.bus.as_ref() {
            Some(bus) => bus.positions().await,
            None => Vec::new(),
        };
        let mut raw = self.offset + self.scale * (self.metric)(&positions);
        if let Some((amplitude, rng)) = self.noise.lock().await.as_mut() {
            raw += rng.gen_range(-*amplitude..=*amplitude);
        }
        raw
    }

    async fn log(&self, command: &str) {
        self.commands.lock().await.push(command.to_string());
    }
}

#[async_trait]
impl InstrumentIo for MockScopeIo {
    async fn connect(&self) -> AlignResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> AlignResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, command: &str) -> AlignResult<()> {
        self.log(command).await;
        Ok(())
    }

    async fn query(&self, command: &str) -> AlignResult<String> {
        self.log(command).await;
        match command {
            "*IDN?" => Ok("MOCK,SCOPE,00000001,0.1.0".to_string()),
            "ACQ:SRAT?" => Ok("1000000000".to_string()),
            _ => Ok(String::new()),
        }
    }

    async fn query_binary(&self, command: &str) -> AlignResult<Vec<f64>> {
        self.log(command).await;
        let len = self.buffer_len.load(Ordering::SeqCst);
        let level = self.level().await;
        Ok(vec![level; len])
    }
}

// =============================================================================
// SimulatedRig - Bus and Scope Wired Together
// =============================================================================

/// A complete software bench: servo chain plus an instrument whose signal
/// tracks the simulated mirror positions.
pub struct SimulatedRig {
    /// The simulated servo chain
    pub bus: Arc<MockBus>,
    /// The simulated instrument session
    pub scope: Arc<MockScopeIo>,
}

impl SimulatedRig {
    /// Build a rig from `(id, initial position)` axes and a metric of the
    /// axis positions. The instrument reports
    /// `offset + scale * metric(positions)`.
    pub fn new(
        axes: &[(u8, i32)],
        metric: impl Fn(&[f64]) -> f64 + Send + Sync + 'static,
        offset: f64,
        scale: f64,
    ) -> Self {
        let bus = Arc::new(MockBus::new(axes));
        let scope = Arc::new(MockScopeIo::with_rig(
            Arc::clone(&bus),
            metric,
            offset,
            scale,
        ));
        Self { bus, scope }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
