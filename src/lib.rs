//! # Beam Align Core Library
//!
//! This crate is the core library for the `beam_align` application: a
//! closed-loop optimizer that steers a pair of mirror mounts through a servo
//! chain and maximizes a photodiode signal sampled by an oscilloscope. The
//! binary (`main.rs`) wires configuration, hardware and the optimization
//! pipeline together; everything reusable lives here.
//!
//! ## Crate Structure
//!
//! The library is organized into several modules, each with a distinct
//! responsibility:
//!
//! - **`codec`**: Position-word encoding shared with the servo firmware,
//!   including the sign-magnitude folding of negative counts.
//! - **`config`**: Structures for loading and validating application
//!   configuration from TOML files and the environment. See
//!   `config::AlignConfig`.
//! - **`error`**: The central `AlignError` enum and the fatal/retryable
//!   split that drives run-level error policy.
//! - **`hardware`**: Transport traits (`ActuatorBus`, `InstrumentIo`), the
//!   servo-chain controller, the oscilloscope sampler and the simulated rig
//!   used by tests and dry runs.
//! - **`objective`**: The `Objective` trait and `BeamObjective`, which turns
//!   "evaluate this position vector" into servo motion plus a normalized
//!   scope reading.
//! - **`orchestrator`**: Phase sequencing over the search strategies and the
//!   end-of-run `AlignmentReport`.
//! - **`search`**: The search strategies themselves (coordinate scan,
//!   gradient ascent, surrogate model) and the shared `SearchState` /
//!   `CancelToken` plumbing.
//! - **`telemetry`**: `tracing` subscriber setup driven by configuration.

pub mod codec;
pub mod config;
pub mod error;
pub mod hardware;
pub mod objective;
pub mod orchestrator;
pub mod search;
pub mod telemetry;
