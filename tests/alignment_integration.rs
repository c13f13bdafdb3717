//! End-to-end alignment runs against the simulated bench.
//!
//! Each test wires the full stack the way the binary does: `SimulatedRig`
//! behind `ServoController` and `ScopeSampler`, a `BeamObjective` on top,
//! and the `Orchestrator` sequencing the configured phases. No hardware,
//! no real delays beyond the poll loops.

use std::sync::Arc;
use std::time::Duration;

use beam_align::config::{AlignConfig, GradientSettings, ScanPhaseSettings, SurrogateSettings};
use beam_align::hardware::{
    ActuatorBus, InstrumentIo, ScopeSampler, ServoController, SimulatedRig,
};
use beam_align::objective::{BeamObjective, Objective};
use beam_align::orchestrator::{Orchestrator, PhaseOutcome};
use beam_align::search::CancelToken;

const OPTIMUM: [f64; 2] = [2000.0, 2500.0];

/// Smooth positive peak at `OPTIMUM`, comfortably above the noise floor
/// everywhere the phases can wander.
fn beam_profile(positions: &[f64]) -> f64 {
    let d2: f64 = positions
        .iter()
        .zip(&OPTIMUM)
        .map(|(p, o)| (p - o) * (p - o))
        .sum();
    (-d2 / 2e6).exp()
}

/// Bench-shaped configuration with timings collapsed for tests.
fn test_config() -> AlignConfig {
    let mut config = AlignConfig::default();
    config.actuator.axis_ids = vec![30, 31];
    config.actuator.position_min = 0.0;
    config.actuator.position_max = 4000.0;
    config.actuator.move_timeout = Duration::from_millis(200);
    config.actuator.poll_interval = Duration::from_millis(1);
    config.instrument.settle_delay = Duration::ZERO;
    config.instrument.fill_timeout = Duration::from_millis(200);
    config.metric.offset = 0.8;
    config.metric.scale = 2.0;
    config.metric.noise_floor = 0.001;
    config.search.coarse = ScanPhaseSettings {
        iterations: 2,
        margin: 600.0,
        step: 20.0,
        growth: 2.0,
        plateau_ratio: 1.01,
        allow_early_exit: false,
    };
    config.search.gradient = GradientSettings {
        iterations: 2,
        step: 10.0,
        direction_update_interval: 5,
        axis_pairs: vec![(0, 1)],
        plateau_ratio: 1.03,
    };
    config.search.surrogate = SurrogateSettings {
        iterations: 40,
        initial_samples: 8,
        window: 50.0,
        candidates_per_axis: 15,
        length_scale: 25.0,
        seed: 7,
        ..SurrogateSettings::default()
    };
    config.search.fine = ScanPhaseSettings {
        iterations: 2,
        margin: 40.0,
        step: 2.0,
        growth: 2.0,
        plateau_ratio: 1.01,
        allow_early_exit: false,
    };
    config
}

/// Connect and configure the full stack over `rig`, as the binary does.
async fn bench(
    rig: &SimulatedRig,
    config: &AlignConfig,
) -> (Arc<ServoController>, Arc<ScopeSampler>, Arc<BeamObjective>) {
    let servo = Arc::new(ServoController::new(
        Arc::clone(&rig.bus) as Arc<dyn ActuatorBus>,
        config.actuator.axis_ids.clone(),
        config.actuator.poll_interval,
    ));
    let scope = Arc::new(ScopeSampler::new(
        Arc::clone(&rig.scope) as Arc<dyn InstrumentIo>,
        config.instrument.fill_timeout,
    ));
    servo.connect().await.unwrap();
    servo
        .configure(config.actuator.acceleration, config.actuator.speed)
        .await
        .unwrap();
    scope.connect().await.unwrap();
    scope.configure(&config.instrument).await.unwrap();
    scope.start_acquisition().await.unwrap();

    let objective = Arc::new(BeamObjective::new(
        Arc::clone(&servo),
        Arc::clone(&scope),
        config,
    ));
    (servo, scope, objective)
}

fn distance(p: &[f64], optimum: &[f64]) -> f64 {
    p.iter()
        .zip(optimum)
        .map(|(x, o)| (x - o) * (x - o))
        .sum::<f64>()
        .sqrt()
}

#[tokio::test]
async fn full_pipeline_converges_on_the_simulated_bench() {
    let config = test_config();
    let rig = SimulatedRig::new(
        &[(30, 1500), (31, 1500)],
        beam_profile,
        config.metric.offset,
        config.metric.scale,
    );
    let (_servo, _scope, objective) = bench(&rig, &config).await;

    let report = Orchestrator::from_config(objective as Arc<dyn Objective>, &config, CancelToken::never())
        .run()
        .await
        .unwrap();

    let after = distance(&report.best_position, &OPTIMUM);
    assert!(after <= 10.0, "stopped {after} counts from the peak");
    assert!(report.best_value >= 0.999, "best {}", report.best_value);
    for phase in &report.phases {
        assert_eq!(phase.outcome, PhaseOutcome::Completed, "{}", phase.name);
    }

    // The rig parks on the reported best, up to goal rounding.
    let parked = rig.bus.positions().await;
    for (p, b) in parked.iter().zip(&report.best_position) {
        assert!((p - b).abs() <= 0.5, "parked {p}, reported {b}");
    }
}

#[tokio::test]
async fn report_accounts_for_every_phase() {
    let config = test_config();
    let rig = SimulatedRig::new(
        &[(30, 1800), (31, 2300)],
        beam_profile,
        config.metric.offset,
        config.metric.scale,
    );
    let (_servo, _scope, objective) = bench(&rig, &config).await;

    let report = Orchestrator::from_config(objective as Arc<dyn Objective>, &config, CancelToken::never())
        .run()
        .await
        .unwrap();

    let names: Vec<&str> = report.phases.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["coarse_scan", "gradient", "surrogate", "fine_scan"]
    );
    for phase in &report.phases {
        assert!(phase.evaluations > 0, "{} spent no evaluations", phase.name);
    }
    let summed: u64 = report.phases.iter().map(|p| p.evaluations).sum();
    assert_eq!(report.total_evaluations, summed);
    assert!(report.best_value >= report.phases[0].best_value);
}

#[tokio::test]
async fn noisy_instrument_still_lands_near_the_peak() {
    let mut config = test_config();
    // Start close and polish with the fine scan only.
    config.search.coarse.iterations = 0;
    config.search.gradient.iterations = 0;
    config.search.surrogate.iterations = 0;
    config.search.fine = ScanPhaseSettings {
        iterations: 2,
        margin: 80.0,
        step: 4.0,
        growth: 2.0,
        plateau_ratio: 1.01,
        allow_early_exit: false,
    };

    let rig = SimulatedRig::new(
        &[(30, 1950), (31, 2450)],
        beam_profile,
        config.metric.offset,
        config.metric.scale,
    );
    // Uniform instrument noise worth ~1e-3 in metric units.
    rig.scope.set_noise(2e-3, 11).await;
    let (_servo, _scope, objective) = bench(&rig, &config).await;

    let report = Orchestrator::from_config(objective as Arc<dyn Objective>, &config, CancelToken::never())
        .run()
        .await
        .unwrap();

    let after = distance(&report.best_position, &OPTIMUM);
    assert!(after <= 100.0, "stopped {after} counts from the peak");
    assert!(report.best_value >= 0.995, "best {}", report.best_value);
}

#[tokio::test]
async fn signal_loss_fails_phases_but_not_the_run() {
    let config = test_config();
    // Dead photodiode: the raw level reads zero, which normalizes to a
    // metric far below the configured noise floor.
    let rig = SimulatedRig::new(
        &[(30, 1500), (31, 1500)],
        |_| -0.4,
        config.metric.offset,
        config.metric.scale,
    );
    let (_servo, _scope, objective) = bench(&rig, &config).await;

    let report = Orchestrator::from_config(objective as Arc<dyn Objective>, &config, CancelToken::never())
        .run()
        .await
        .unwrap();

    assert_eq!(report.phases.len(), 4);
    for phase in &report.phases {
        assert!(
            matches!(phase.outcome, PhaseOutcome::Failed(_)),
            "{} ended {:?}",
            phase.name,
            phase.outcome
        );
    }
    assert_eq!(report.total_evaluations, 0);
}

#[tokio::test]
async fn cancellation_before_the_first_trial_parks_on_the_seed() {
    let config = test_config();
    let rig = SimulatedRig::new(
        &[(30, 1500), (31, 1500)],
        beam_profile,
        config.metric.offset,
        config.metric.scale,
    );
    let (_servo, _scope, objective) = bench(&rig, &config).await;

    let (tx, cancel) = CancelToken::channel();
    tx.send(true).unwrap();
    let report = Orchestrator::from_config(objective as Arc<dyn Objective>, &config, cancel)
        .run()
        .await
        .unwrap();

    assert_eq!(report.phases.len(), 1);
    assert_eq!(report.phases[0].outcome, PhaseOutcome::Cancelled);
    assert_eq!(rig.bus.positions().await, vec![1500.0, 1500.0]);
}

#[tokio::test]
async fn shipped_configuration_file_is_valid() {
    let config = AlignConfig::load_from(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/config/beam_align.toml"
    ))
    .unwrap();
    config.validate().unwrap();
    assert_eq!(config.axis_count(), config.actuator.axis_ids.len());
}
