//! CLI entry point for beam-align.
//!
//! Provides a command-line interface for:
//! - Running a full alignment sequence against the simulated rig
//! - Checking a configuration file without touching any hardware
//!
//! # Usage
//!
//! Run an alignment:
//! ```bash
//! beam-align run --config config/beam_align.toml
//! ```
//!
//! Validate a configuration file:
//! ```bash
//! beam-align check --config config/beam_align.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use beam_align::config::AlignConfig;
use beam_align::hardware::{ActuatorBus, InstrumentIo, ScopeSampler, ServoController, SimulatedRig};
use beam_align::objective::{BeamObjective, Objective};
use beam_align::orchestrator::Orchestrator;
use beam_align::search::CancelToken;
use beam_align::telemetry;

#[derive(Parser)]
#[command(name = "beam-align")]
#[command(about = "Closed-loop beam alignment over a servo-steered mirror pair", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full alignment sequence
    Run {
        /// Configuration file
        #[arg(long, default_value = "config/beam_align.toml")]
        config: PathBuf,
    },

    /// Load and validate a configuration file, then exit
    Check {
        /// Configuration file
        #[arg(long, default_value = "config/beam_align.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_alignment(config).await,
        Commands::Check { config } => check_config(config),
    }
}

fn load_config(path: &PathBuf) -> Result<AlignConfig> {
    let config = AlignConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    Ok(config)
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    println!(
        "{}: ok ({} axes, ids {:?})",
        path.display(),
        config.axis_count(),
        config.actuator.axis_ids
    );
    // Effective configuration after file, environment and defaults merge.
    let rendered = toml::to_string_pretty(&config).context("rendering effective configuration")?;
    println!("\n{rendered}");
    Ok(())
}

async fn run_alignment(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    telemetry::init_from_config(&config).map_err(anyhow::Error::msg)?;

    info!(
        config = %path.display(),
        axes = config.axis_count(),
        "starting alignment run"
    );

    // The bench transports are simulated: a servo chain whose axes slew
    // toward their goals and an instrument whose reading peaks when every
    // axis sits at the midpoint of its commandable range. Swapping in real
    // serial and SCPI sessions is a matter of providing other `ActuatorBus`
    // and `InstrumentIo` implementations here.
    let mid = (config.actuator.position_min + config.actuator.position_max) / 2.0;
    let width = (config.actuator.position_max - config.actuator.position_min) / 2.0;
    let axes: Vec<(u8, i32)> = config
        .actuator
        .axis_ids
        .iter()
        .map(|&id| (id, (mid - width / 3.0).round() as i32))
        .collect();
    let rig = SimulatedRig::new(
        &axes,
        move |positions| {
            let d2: f64 = positions.iter().map(|p| ((p - mid) / width).powi(2)).sum();
            (-d2).exp()
        },
        config.metric.offset,
        config.metric.scale,
    );

    let servo = Arc::new(ServoController::new(
        Arc::clone(&rig.bus) as Arc<dyn ActuatorBus>,
        config.actuator.axis_ids.clone(),
        config.actuator.poll_interval,
    ));
    let scope = Arc::new(ScopeSampler::new(
        Arc::clone(&rig.scope) as Arc<dyn InstrumentIo>,
        config.instrument.fill_timeout,
    ));

    servo.connect().await.context("connecting servo chain")?;
    servo
        .configure(config.actuator.acceleration, config.actuator.speed)
        .await
        .context("configuring servo chain")?;
    scope.connect().await.context("connecting instrument")?;
    scope
        .configure(&config.instrument)
        .await
        .context("configuring instrument")?;
    scope.start_acquisition().await?;

    let objective = Arc::new(BeamObjective::new(
        Arc::clone(&servo),
        Arc::clone(&scope),
        &config,
    ));

    let (cancel_tx, cancel) = CancelToken::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current phase");
            let _ = cancel_tx.send(true);
        }
    });

    let orchestrator =
        Orchestrator::from_config(Arc::clone(&objective) as Arc<dyn Objective>, &config, cancel);
    let report = orchestrator.run().await.context("alignment run failed")?;

    println!(
        "alignment started {} finished in {:.1?}",
        report.started_at.format("%Y-%m-%d %H:%M:%S%.3f UTC"),
        report.elapsed
    );
    for phase in &report.phases {
        println!(
            "  {:<12} best {:+.4} after {} evaluations ({:?})",
            phase.name, phase.best_value, phase.evaluations, phase.outcome
        );
    }
    println!(
        "best metric {:+.4} at {:?} ({} evaluations total)",
        report.best_value, report.best_position, report.total_evaluations
    );

    scope.stop_acquisition().await?;
    scope.close().await?;
    servo.disconnect().await.context("releasing servo chain")?;
    Ok(())
}
