//! Phase sequencing for one alignment run.
//!
//! The orchestrator owns the phase list (coarse scan, gradient ascent,
//! surrogate search, fine scan by default) and the error policy between
//! them: a failed trial fails its phase, never the run, while transport
//! and connection faults abort everything. Whatever happens inside a
//! phase, its best position is committed to the actuator before the next
//! phase starts, so an interrupted run still leaves the rig on the best
//! point it found.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::config::AlignConfig;
use crate::error::{AlignError, AlignResult};
use crate::objective::Objective;
use crate::search::{
    CancelToken, CoordinateScan, GradientAscent, SearchState, SearchStrategy, SurrogateSearch,
};

/// How one phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The strategy ran to its own stopping rule.
    Completed,
    /// A non-fatal error stopped the phase early.
    Failed(String),
    /// Cancellation stopped the phase early.
    Cancelled,
}

/// Result of one phase, for the run report.
#[derive(Debug, Clone)]
pub struct PhaseSummary {
    /// Strategy name
    pub name: String,
    /// Best metric the phase reached
    pub best_value: f64,
    /// Position committed at phase end
    pub best_position: Vec<f64>,
    /// Outer iterations the strategy completed
    pub iterations: u32,
    /// Metric evaluations the phase spent
    pub evaluations: u64,
    /// How the phase ended
    pub outcome: PhaseOutcome,
}

/// Result of a whole alignment run.
#[derive(Debug, Clone)]
pub struct AlignmentReport {
    /// Wall-clock start of the run
    pub started_at: DateTime<Utc>,
    /// Per-phase summaries, in execution order
    pub phases: Vec<PhaseSummary>,
    /// Best metric across all phases
    pub best_value: f64,
    /// Position of the best metric
    pub best_position: Vec<f64>,
    /// Total metric evaluations
    pub total_evaluations: u64,
    /// Wall time of the run
    pub elapsed: Duration,
}

/// Delegating wrapper that counts completed metric evaluations.
struct CountingObjective {
    inner: Arc<dyn Objective>,
    evaluations: AtomicU64,
}

impl CountingObjective {
    fn new(inner: Arc<dyn Objective>) -> Self {
        Self {
            inner,
            evaluations: AtomicU64::new(0),
        }
    }

    fn count(&self) -> u64 {
        self.evaluations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Objective for CountingObjective {
    fn axis_count(&self) -> usize {
        self.inner.axis_count()
    }

    async fn evaluate(&self, positions: &[f64]) -> AlignResult<Option<f64>> {
        let result = self.inner.evaluate(positions).await;
        if matches!(result, Ok(Some(_))) {
            self.evaluations.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    async fn current_positions(&self) -> AlignResult<Vec<f64>> {
        self.inner.current_positions().await
    }

    async fn commit(&self, positions: &[f64]) -> AlignResult<()> {
        self.inner.commit(positions).await
    }
}

/// Sequences the configured search phases over one objective.
pub struct Orchestrator {
    objective: Arc<dyn Objective>,
    phases: Vec<Box<dyn SearchStrategy>>,
    cancel: CancelToken,
}

impl Orchestrator {
    /// Build with an explicit phase list.
    pub fn new(
        objective: Arc<dyn Objective>,
        phases: Vec<Box<dyn SearchStrategy>>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            objective,
            phases,
            cancel,
        }
    }

    /// Build the standard phase sequence from configuration.
    ///
    /// Phases configured with zero iterations are left out entirely.
    pub fn from_config(
        objective: Arc<dyn Objective>,
        config: &AlignConfig,
        cancel: CancelToken,
    ) -> Self {
        let search = &config.search;
        let mut phases: Vec<Box<dyn SearchStrategy>> = Vec::new();

        if search.coarse.iterations > 0 {
            phases.push(Box::new(CoordinateScan::new(
                "coarse_scan",
                search.coarse.clone(),
                search.reasonable_value,
                search.no_update_threshold,
            )));
        }
        if search.gradient.iterations > 0 {
            phases.push(Box::new(GradientAscent::new(
                search.gradient.clone(),
                search.no_update_threshold,
            )));
        }
        if search.surrogate.iterations > 0 {
            phases.push(Box::new(SurrogateSearch::new(search.surrogate.clone())));
        }
        if search.fine.iterations > 0 {
            phases.push(Box::new(CoordinateScan::new(
                "fine_scan",
                search.fine.clone(),
                search.reasonable_value,
                search.no_update_threshold,
            )));
        }

        Self::new(objective, phases, cancel)
    }

    /// Run every phase in order and report.
    ///
    /// Only fatal errors surface as `Err`; everything else is folded into
    /// the per-phase outcomes.
    pub async fn run(&self) -> AlignResult<AlignmentReport> {
        let started_at = Utc::now();
        let started = Instant::now();
        let counting = CountingObjective::new(Arc::clone(&self.objective));
        let mut summaries = Vec::with_capacity(self.phases.len());

        for phase in &self.phases {
            let summary = self.run_phase(phase.as_ref(), &counting).await?;
            let cancelled = summary.outcome == PhaseOutcome::Cancelled;
            summaries.push(summary);
            if cancelled {
                info!("run cancelled, remaining phases skipped");
                break;
            }
        }

        let (best_value, best_position) = summaries
            .iter()
            .max_by(|a, b| a.best_value.total_cmp(&b.best_value))
            .map(|s| (s.best_value, s.best_position.clone()))
            .unwrap_or((f64::NEG_INFINITY, Vec::new()));

        let report = AlignmentReport {
            started_at,
            phases: summaries,
            best_value,
            best_position,
            total_evaluations: counting.count(),
            elapsed: started.elapsed(),
        };
        info!(
            best = report.best_value,
            evaluations = report.total_evaluations,
            elapsed = ?report.elapsed,
            "alignment run complete"
        );
        Ok(report)
    }

    /// Run one phase: seed from the rig, search, commit the best.
    async fn run_phase(
        &self,
        strategy: &dyn SearchStrategy,
        objective: &CountingObjective,
    ) -> AlignResult<PhaseSummary> {
        let evaluations_before = objective.count();
        let seed_position = objective.current_positions().await?;
        info!(phase = strategy.name(), ?seed_position, "phase starting");

        let seed_value = match self
            .cancel
            .guard(objective.evaluate(&seed_position))
            .await
        {
            Ok(Some(value)) => value,
            // A dropped or failed baseline still lets the phase search;
            // any real trial will beat negative infinity.
            Ok(None) => f64::NEG_INFINITY,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(phase = strategy.name(), error = %e, "baseline evaluation failed");
                f64::NEG_INFINITY
            }
        };

        let mut state = SearchState::seeded(seed_position, seed_value);
        let outcome = match strategy.run(objective, &mut state, &self.cancel).await {
            Ok(()) => PhaseOutcome::Completed,
            Err(e) if e.is_fatal() => return Err(e),
            Err(AlignError::Interrupted(_)) => PhaseOutcome::Cancelled,
            Err(e) => {
                error!(phase = strategy.name(), error = %e, "phase failed");
                PhaseOutcome::Failed(e.to_string())
            }
        };

        // Commit unconditionally so the rig parks on the phase's best,
        // cancelled and failed phases included.
        if let Err(e) = objective.commit(&state.best_position).await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(phase = strategy.name(), error = %e, "best-position commit failed");
        }

        info!(
            phase = strategy.name(),
            best = state.best_value,
            iterations = state.iteration,
            ?outcome,
            "phase finished"
        );
        Ok(PhaseSummary {
            name: strategy.name().to_string(),
            best_value: state.best_value,
            best_position: state.best_position,
            iterations: state.iteration,
            evaluations: objective.count() - evaluations_before,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanPhaseSettings;
    use crate::search::testkit::FunctionObjective;

    struct FailingObjective {
        error: fn() -> AlignError,
    }

    #[async_trait]
    impl Objective for FailingObjective {
        fn axis_count(&self) -> usize {
            1
        }

        async fn evaluate(&self, _positions: &[f64]) -> AlignResult<Option<f64>> {
            Err((self.error)())
        }

        async fn current_positions(&self) -> AlignResult<Vec<f64>> {
            Ok(vec![2000.0])
        }

        async fn commit(&self, _positions: &[f64]) -> AlignResult<()> {
            Ok(())
        }
    }

    fn scan_phase(name: &'static str) -> Box<dyn SearchStrategy> {
        Box::new(CoordinateScan::new(
            name,
            ScanPhaseSettings {
                iterations: 2,
                margin: 500.0,
                step: 10.0,
                growth: 2.0,
                plateau_ratio: 1.01,
                allow_early_exit: false,
            },
            0.035,
            3,
        ))
    }

    #[tokio::test]
    async fn phases_run_in_order_and_park_on_the_best() {
        let objective = Arc::new(FunctionObjective::new(vec![1500.0], 0.0, 4000.0, |p| {
            -(p[0] - 2000.0).powi(2) / 1e6
        }));
        let orchestrator = Orchestrator::new(
            Arc::clone(&objective) as Arc<dyn Objective>,
            vec![scan_phase("coarse_scan"), scan_phase("fine_scan")],
            CancelToken::never(),
        );

        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.phases.len(), 2);
        assert!(report
            .phases
            .iter()
            .all(|p| p.outcome == PhaseOutcome::Completed));
        assert!((report.best_position[0] - 2000.0).abs() <= 10.0);
        assert!(report.total_evaluations > 0);

        // The rig itself sits on the best position after the final commit.
        let parked = objective.current_positions().await.unwrap();
        assert_eq!(parked, report.best_position);
    }

    #[tokio::test]
    async fn zero_iteration_phases_are_skipped() {
        let mut config = AlignConfig::default();
        config.search.coarse.iterations = 0;
        config.search.gradient.iterations = 0;
        config.search.surrogate.iterations = 0;
        config.search.fine.iterations = 1;

        let objective = Arc::new(FunctionObjective::new(vec![2000.0], 0.0, 4000.0, |_| 1.0));
        let orchestrator =
            Orchestrator::from_config(objective, &config, CancelToken::never());
        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.phases.len(), 1);
        assert_eq!(report.phases[0].name, "fine_scan");
    }

    #[tokio::test]
    async fn trial_failures_fail_the_phase_not_the_run() {
        let objective = Arc::new(FailingObjective {
            error: || AlignError::SignalNotDetected {
                metric: 0.01,
                noise_floor: 0.032,
            },
        });
        let orchestrator = Orchestrator::new(
            objective,
            vec![scan_phase("coarse_scan"), scan_phase("fine_scan")],
            CancelToken::never(),
        );

        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.phases.len(), 2);
        assert!(report
            .phases
            .iter()
            .all(|p| matches!(p.outcome, PhaseOutcome::Failed(_))));
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn run_logs_phase_boundaries_and_the_final_report() {
        let objective = Arc::new(FunctionObjective::new(vec![2000.0], 0.0, 4000.0, |_| 1.0));
        Orchestrator::new(
            objective,
            vec![scan_phase("fine_scan")],
            CancelToken::never(),
        )
        .run()
        .await
        .unwrap();

        assert!(logs_contain("phase starting"));
        assert!(logs_contain("phase finished"));
        assert!(logs_contain("alignment run complete"));
    }

    #[tokio::test]
    async fn transport_faults_abort_the_run() {
        let objective = Arc::new(FailingObjective {
            error: || AlignError::Transport("bus gone".into()),
        });
        let orchestrator = Orchestrator::new(
            objective,
            vec![scan_phase("coarse_scan")],
            CancelToken::never(),
        );

        let err = orchestrator.run().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_phases_but_still_commits() {
        let objective = Arc::new(FunctionObjective::new(vec![1500.0], 0.0, 4000.0, |p| {
            p[0] / 4000.0
        }));
        let (tx, cancel) = CancelToken::channel();
        tx.send(true).unwrap();

        let orchestrator = Orchestrator::new(
            Arc::clone(&objective) as Arc<dyn Objective>,
            vec![scan_phase("coarse_scan"), scan_phase("fine_scan")],
            cancel,
        );
        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.phases.len(), 1);
        assert_eq!(report.phases[0].outcome, PhaseOutcome::Cancelled);
        // The seed position was committed back even though nothing ran.
        let parked = objective.current_positions().await.unwrap();
        assert_eq!(parked, vec![1500.0]);
    }
}
