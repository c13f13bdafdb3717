//! Custom error types for the application.
//!
//! This module defines the primary error type, `AlignError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes of a closed-loop
//! alignment run.
//!
//! ## Error Hierarchy
//!
//! `AlignError` consolidates the failure classes an alignment run can hit:
//!
//! - **`Connection`**: Opening the actuator bus or instrument session failed.
//!   Always fatal and always occurs before the optimization loop starts.
//! - **`Transport`**: A grouped write/read transaction failed mid-run. The
//!   actuator state is no longer trustworthy, so the run aborts.
//! - **`Validation`**: A caller handed a component data of the wrong shape,
//!   such as a position vector whose length does not match the axis count.
//! - **`OutOfRange`**: A requested position falls outside the configured
//!   bounds and the bounds policy is set to raise.
//! - **`SignalNotDetected`**: The measured metric fell below the noise floor.
//!   Per-trial failure; the orchestrator treats it as a failed phase, not a
//!   failed run.
//! - **`Acquisition`**: The instrument capture buffer never reached the
//!   requested sample count within the fill timeout.
//! - **`Interrupted`**: A cancellation request stopped the current phase.
//! - **`Config`**: Figment extraction or semantic validation of the
//!   configuration failed.
//! - **`Io`**: Wraps `std::io::Error` from file and session handling.
//!
//! Convergence timeouts are deliberately NOT an error: `wait_for_positions`
//! returns `bool` and callers decide what to do with a late actuator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AlignResult<T> = std::result::Result<T, AlignError>;

#[derive(Error, Debug)]
pub enum AlignError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Position out of range: axis {axis} value {value} outside [{min}, {max}]")]
    OutOfRange {
        axis: usize,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Signal not detected: metric {metric} below noise floor {noise_floor}")]
    SignalNotDetected { metric: f64, noise_floor: f64 },

    #[error("Acquisition error: {0}")]
    Acquisition(String),

    #[error("Run interrupted: {0}")]
    Interrupted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for AlignError {
    fn from(err: figment::Error) -> Self {
        AlignError::Config(err.to_string())
    }
}

impl AlignError {
    /// Whether this error must abort the whole run rather than just the
    /// current phase.
    ///
    /// `Connection` and `Transport` mean the hardware link itself is broken;
    /// everything else is scoped to a single trial or phase and the
    /// orchestrator can carry on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AlignError::Connection(_) | AlignError::Transport(_))
    }
}
