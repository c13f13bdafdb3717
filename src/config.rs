//! Configuration system using Figment.
//!
//! This module provides strongly-typed configuration loading for an
//! alignment run. Configuration is loaded from:
//! 1. beam_align.toml file (base configuration)
//! 2. Environment variables (prefixed with BEAM_ALIGN_)
//!
//! Every field carries a default taken from the reference bench setup, so a
//! missing file or an empty table yields a runnable configuration for the
//! simulated rig.
//!
//! # Example
//! ```no_run
//! use beam_align::config::AlignConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AlignConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::objective::BoundsPolicy;

/// Top-level configuration for an alignment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Servo actuator array settings
    #[serde(default)]
    pub actuator: ActuatorSettings,
    /// Oscilloscope acquisition settings
    #[serde(default)]
    pub instrument: InstrumentSettings,
    /// Metric normalization and bounds handling
    #[serde(default)]
    pub metric: MetricSettings,
    /// Search phase schedule and hyperparameters
    #[serde(default)]
    pub search: SearchSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Servo actuator array configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorSettings {
    /// Servo bus ids, one per axis; vector index is the axis index everywhere
    #[serde(default = "default_axis_ids")]
    pub axis_ids: Vec<u8>,
    /// Goal acceleration written to each servo at configure time
    #[serde(default = "default_acceleration")]
    pub acceleration: u32,
    /// Goal speed written to each servo at configure time
    #[serde(default = "default_speed")]
    pub speed: u32,
    /// Lower commandable bound, servo counts
    #[serde(default = "default_position_min")]
    pub position_min: f64,
    /// Upper commandable bound, servo counts
    #[serde(default = "default_position_max")]
    pub position_max: f64,
    /// Convergence tolerance per axis, servo counts
    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold: f64,
    /// Budget for one convergence wait
    #[serde(with = "humantime_serde", default = "default_move_timeout")]
    pub move_timeout: Duration,
    /// Poll spacing inside the convergence wait
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

/// Oscilloscope acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSettings {
    /// Waveform source channel, e.g. "CHAN1"; None keeps the scope's current source
    #[serde(default)]
    pub channel: Option<String>,
    /// Acquisition memory depth in points
    #[serde(default = "default_memory_depth")]
    pub memory_depth: u32,
    /// Waveform readout mode
    #[serde(default = "default_waveform_mode")]
    pub waveform_mode: String,
    /// Waveform transfer format
    #[serde(default = "default_waveform_format")]
    pub waveform_format: String,
    /// Timebase mode
    #[serde(default = "default_timebase_mode")]
    pub timebase_mode: String,
    /// Points averaged into one sample
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Dwell after motion before sampling
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,
    /// Budget for the capture buffer to reach min_samples
    #[serde(with = "humantime_serde", default = "default_fill_timeout")]
    pub fill_timeout: Duration,
}

/// Metric normalization and out-of-range handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSettings {
    /// Raw reading offset, subtracted before scaling
    #[serde(default = "default_metric_offset")]
    pub offset: f64,
    /// Raw reading scale divisor
    #[serde(default = "default_metric_scale")]
    pub scale: f64,
    /// Metric values below this are treated as no signal
    #[serde(default = "default_noise_floor")]
    pub noise_floor: f64,
    /// What to do with an out-of-bounds trial position
    #[serde(default)]
    pub bounds_policy: BoundsPolicy,
}

/// Search phase schedule and shared thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    /// Metric value above which a scan may early-exit an axis sweep
    #[serde(default = "default_reasonable_value")]
    pub reasonable_value: f64,
    /// Consecutive non-improving trials before a strategy gives up
    #[serde(default = "default_no_update_threshold")]
    pub no_update_threshold: u32,
    /// Coarse coordinate scan phase
    #[serde(default = "default_coarse_scan")]
    pub coarse: ScanPhaseSettings,
    /// Gradient ascent phase
    #[serde(default)]
    pub gradient: GradientSettings,
    /// Surrogate model phase
    #[serde(default)]
    pub surrogate: SurrogateSettings,
    /// Fine coordinate scan phase
    #[serde(default = "default_fine_scan")]
    pub fine: ScanPhaseSettings,
}

/// One coordinate scan phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanPhaseSettings {
    /// Outer iterations; 0 skips the phase
    pub iterations: u32,
    /// Half-width of the sweep around the running best, servo counts
    pub margin: f64,
    /// Trial spacing inside a sweep, servo counts
    pub step: f64,
    /// Margin divisor applied per outer iteration
    pub growth: f64,
    /// Stop the phase when best < previous * ratio between outer iterations
    pub plateau_ratio: f64,
    /// Allow the sweep early-exit once the signal is reasonable
    pub allow_early_exit: bool,
}

/// Gradient ascent phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientSettings {
    /// Outer iterations; 0 skips the phase
    #[serde(default = "default_gradient_iterations")]
    pub iterations: u32,
    /// Probe and step distance, servo counts
    #[serde(default = "default_gradient_step")]
    pub step: f64,
    /// Re-estimate the ascent direction every N steps; 0 never refreshes
    #[serde(default = "default_direction_update_interval")]
    pub direction_update_interval: u32,
    /// Axis index pairs walked together in the two-knob passes
    #[serde(default = "default_axis_pairs")]
    pub axis_pairs: Vec<(usize, usize)>,
    /// Stop the phase when best < previous * ratio between outer iterations
    #[serde(default = "default_gradient_plateau")]
    pub plateau_ratio: f64,
}

/// Acquisition function for the surrogate phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionKind {
    /// Expected improvement
    ExpectedImprovement,
    /// Probability of improvement
    ProbabilityOfImprovement,
}

/// Surrogate model phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurrogateSettings {
    /// Total evaluation budget; 0 skips the phase
    #[serde(default = "default_surrogate_iterations")]
    pub iterations: u32,
    /// Purely random evaluations before the model drives
    #[serde(default = "default_initial_samples")]
    pub initial_samples: u32,
    /// Half-width of the search window around the seed position, servo counts
    #[serde(default = "default_surrogate_window")]
    pub window: f64,
    /// Candidate grid resolution per axis when scoring the acquisition
    #[serde(default = "default_candidates_per_axis")]
    pub candidates_per_axis: usize,
    /// Squared-exponential kernel length scale, servo counts
    #[serde(default = "default_length_scale")]
    pub length_scale: f64,
    /// Kernel signal variance
    #[serde(default = "default_signal_variance")]
    pub signal_variance: f64,
    /// Observation noise variance added to the kernel diagonal
    #[serde(default = "default_noise_variance")]
    pub noise_variance: f64,
    /// Acquisition function
    #[serde(default = "default_acquisition")]
    pub acquisition: AcquisitionKind,
    /// RNG seed for the random warmup
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Stop the phase when best < previous * ratio between outer iterations
    #[serde(default = "default_surrogate_plateau")]
    pub plateau_ratio: f64,
}

// Default value functions

fn default_app_name() -> String {
    "beam_align".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_axis_ids() -> Vec<u8> {
    vec![30, 31, 80, 81]
}

fn default_acceleration() -> u32 {
    20
}

fn default_speed() -> u32 {
    100
}

fn default_position_min() -> f64 {
    500.0
}

fn default_position_max() -> f64 {
    3500.0
}

fn default_convergence_threshold() -> f64 {
    2.0
}

fn default_move_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_memory_depth() -> u32 {
    12000
}

fn default_waveform_mode() -> String {
    "NORM".to_string()
}

fn default_waveform_format() -> String {
    "WORD".to_string()
}

fn default_timebase_mode() -> String {
    "YT".to_string()
}

fn default_min_samples() -> usize {
    10
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_fill_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_metric_offset() -> f64 {
    8_000_000.0
}

fn default_metric_scale() -> f64 {
    10_000_000.0
}

fn default_noise_floor() -> f64 {
    0.032
}

fn default_reasonable_value() -> f64 {
    0.035
}

fn default_no_update_threshold() -> u32 {
    3
}

fn default_coarse_scan() -> ScanPhaseSettings {
    ScanPhaseSettings {
        iterations: 3,
        margin: 500.0,
        step: 10.0,
        growth: 2.0,
        plateau_ratio: 1.01,
        allow_early_exit: true,
    }
}

fn default_fine_scan() -> ScanPhaseSettings {
    ScanPhaseSettings {
        iterations: 2,
        margin: 40.0,
        step: 2.0,
        growth: 2.0,
        plateau_ratio: 1.01,
        allow_early_exit: false,
    }
}

fn default_gradient_iterations() -> u32 {
    2
}

fn default_gradient_step() -> f64 {
    10.0
}

fn default_direction_update_interval() -> u32 {
    5
}

fn default_axis_pairs() -> Vec<(usize, usize)> {
    vec![(0, 3), (1, 2)]
}

fn default_gradient_plateau() -> f64 {
    1.03
}

fn default_surrogate_iterations() -> u32 {
    60
}

fn default_initial_samples() -> u32 {
    10
}

fn default_surrogate_window() -> f64 {
    100.0
}

fn default_candidates_per_axis() -> usize {
    25
}

fn default_length_scale() -> f64 {
    50.0
}

fn default_signal_variance() -> f64 {
    1.0
}

fn default_noise_variance() -> f64 {
    1e-4
}

fn default_acquisition() -> AcquisitionKind {
    AcquisitionKind::ExpectedImprovement
}

fn default_seed() -> u64 {
    42
}

fn default_surrogate_plateau() -> f64 {
    1.01
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ActuatorSettings {
    fn default() -> Self {
        Self {
            axis_ids: default_axis_ids(),
            acceleration: default_acceleration(),
            speed: default_speed(),
            position_min: default_position_min(),
            position_max: default_position_max(),
            convergence_threshold: default_convergence_threshold(),
            move_timeout: default_move_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            channel: None,
            memory_depth: default_memory_depth(),
            waveform_mode: default_waveform_mode(),
            waveform_format: default_waveform_format(),
            timebase_mode: default_timebase_mode(),
            min_samples: default_min_samples(),
            settle_delay: default_settle_delay(),
            fill_timeout: default_fill_timeout(),
        }
    }
}

impl Default for MetricSettings {
    fn default() -> Self {
        Self {
            offset: default_metric_offset(),
            scale: default_metric_scale(),
            noise_floor: default_noise_floor(),
            bounds_policy: BoundsPolicy::default(),
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            reasonable_value: default_reasonable_value(),
            no_update_threshold: default_no_update_threshold(),
            coarse: default_coarse_scan(),
            gradient: GradientSettings::default(),
            surrogate: SurrogateSettings::default(),
            fine: default_fine_scan(),
        }
    }
}

impl Default for GradientSettings {
    fn default() -> Self {
        Self {
            iterations: default_gradient_iterations(),
            step: default_gradient_step(),
            direction_update_interval: default_direction_update_interval(),
            axis_pairs: default_axis_pairs(),
            plateau_ratio: default_gradient_plateau(),
        }
    }
}

impl Default for SurrogateSettings {
    fn default() -> Self {
        Self {
            iterations: default_surrogate_iterations(),
            initial_samples: default_initial_samples(),
            window: default_surrogate_window(),
            candidates_per_axis: default_candidates_per_axis(),
            length_scale: default_length_scale(),
            signal_variance: default_signal_variance(),
            noise_variance: default_noise_variance(),
            acquisition: default_acquisition(),
            seed: default_seed(),
            plateau_ratio: default_surrogate_plateau(),
        }
    }
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            application: ApplicationSettings::default(),
            actuator: ActuatorSettings::default(),
            instrument: InstrumentSettings::default(),
            metric: MetricSettings::default(),
            search: SearchSettings::default(),
        }
    }
}

impl AlignConfig {
    /// Load configuration from beam_align.toml and environment variables
    ///
    /// Environment variables can override configuration with prefix BEAM_ALIGN_
    /// Example: BEAM_ALIGN_ACTUATOR_SPEED=200
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/beam_align.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BEAM_ALIGN_").split("_"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.actuator.axis_ids.is_empty() {
            return Err("At least one axis id is required".to_string());
        }

        // Validate axis ids are unique
        let mut ids = std::collections::HashSet::new();
        for id in &self.actuator.axis_ids {
            if !ids.insert(id) {
                return Err(format!("Duplicate axis id: {id}"));
            }
        }

        if self.actuator.position_min >= self.actuator.position_max {
            return Err(format!(
                "position_min {} must be below position_max {}",
                self.actuator.position_min, self.actuator.position_max
            ));
        }

        if self.actuator.convergence_threshold <= 0.0 {
            return Err(format!(
                "convergence_threshold {} must be positive",
                self.actuator.convergence_threshold
            ));
        }

        if self.instrument.min_samples == 0 {
            return Err("min_samples must be at least 1".to_string());
        }

        if self.metric.scale == 0.0 {
            return Err("Metric scale must be nonzero".to_string());
        }

        if self.search.no_update_threshold == 0 {
            return Err("no_update_threshold must be at least 1".to_string());
        }

        for (name, scan) in [("coarse", &self.search.coarse), ("fine", &self.search.fine)] {
            if scan.iterations > 0 {
                if scan.margin <= 0.0 || scan.step <= 0.0 {
                    return Err(format!("{name} scan margin and step must be positive"));
                }
                if scan.growth < 1.0 {
                    return Err(format!(
                        "{name} scan growth {} must be at least 1.0",
                        scan.growth
                    ));
                }
            }
        }

        if self.search.gradient.iterations > 0 {
            if self.search.gradient.step <= 0.0 {
                return Err("Gradient step must be positive".to_string());
            }
            let axis_count = self.actuator.axis_ids.len();
            for &(a, b) in &self.search.gradient.axis_pairs {
                if a >= axis_count || b >= axis_count {
                    return Err(format!(
                        "Gradient axis pair ({a}, {b}) references an axis outside 0..{axis_count}"
                    ));
                }
            }
        }

        if self.search.surrogate.iterations > 0 {
            let s = &self.search.surrogate;
            if s.window <= 0.0 {
                return Err("Surrogate window must be positive".to_string());
            }
            if s.candidates_per_axis < 2 {
                return Err("Surrogate candidates_per_axis must be at least 2".to_string());
            }
            if s.length_scale <= 0.0 || s.signal_variance <= 0.0 || s.noise_variance <= 0.0 {
                return Err("Surrogate kernel hyperparameters must be positive".to_string());
            }
            if s.initial_samples == 0 {
                return Err("Surrogate initial_samples must be at least 1".to_string());
            }
        }

        Ok(())
    }

    /// Number of controlled axes.
    pub fn axis_count(&self) -> usize {
        self.actuator.axis_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn defaults_validate() {
        let config = AlignConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.axis_count(), 4);
        assert_eq!(config.actuator.axis_ids, vec![30, 31, 80, 81]);
    }

    #[test]
    fn load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[application]
name = "bench-a"
log_level = "debug"

[actuator]
axis_ids = [10, 11]
position_min = 0.0
position_max = 4000.0
move_timeout = "2s"

[metric]
noise_floor = 0.05
bounds_policy = "clip"

[search.coarse]
iterations = 1
margin = 200.0
step = 5.0
growth = 2.0
plateau_ratio = 1.01
allow_early_exit = true
"#
        )
        .expect("write config");

        let config = AlignConfig::load_from(file.path()).expect("load");
        assert_eq!(config.application.name, "bench-a");
        assert_eq!(config.actuator.axis_ids, vec![10, 11]);
        assert_eq!(config.actuator.move_timeout, Duration::from_secs(2));
        assert_eq!(config.metric.bounds_policy, BoundsPolicy::Clip);
        assert_eq!(config.search.coarse.iterations, 1);
        // Untouched sections keep their defaults.
        assert_eq!(config.instrument.memory_depth, 12000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut config = AlignConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_axis_ids_rejected() {
        let mut config = AlignConfig::default();
        config.actuator.axis_ids = vec![30, 30];
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_bounds_rejected() {
        let mut config = AlignConfig::default();
        config.actuator.position_min = 3500.0;
        config.actuator.position_max = 500.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn gradient_pair_outside_axis_range_rejected() {
        let mut config = AlignConfig::default();
        config.actuator.axis_ids = vec![30, 31];
        config.search.gradient.axis_pairs = vec![(0, 3)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_iteration_phases_skip_phase_validation() {
        let mut config = AlignConfig::default();
        config.search.coarse.iterations = 0;
        config.search.coarse.margin = -1.0;
        assert!(config.validate().is_ok());
    }
}
