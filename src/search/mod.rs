//! Search strategies over the alignment objective.
//!
//! Every strategy implements [`SearchStrategy`]: given an [`Objective`], a
//! seeded [`SearchState`] and a [`CancelToken`], improve the state in place.
//! The orchestrator owns phase sequencing; strategies own their inner loops
//! and their own plateau rules.
//!
//! `SearchState::observe` is the only path that mutates the running best, so
//! `best_value` is monotonically non-decreasing for the life of a phase.

pub mod coordinate;
pub mod gradient;
pub mod surrogate;

pub use coordinate::CoordinateScan;
pub use gradient::GradientAscent;
pub use surrogate::{GpSurrogate, SurrogateModel, SurrogateSearch};

use async_trait::async_trait;
use std::future::Future;
use tokio::sync::watch;

use crate::error::{AlignError, AlignResult};
use crate::objective::Objective;

/// Running best of one search phase.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchState {
    /// Best position vector seen so far
    pub best_position: Vec<f64>,
    /// Metric at `best_position`; never decreases
    pub best_value: f64,
    /// Completed outer iterations
    pub iteration: u32,
    /// Consecutive non-improving trials since the last improvement
    pub stagnation_count: u32,
}

impl SearchState {
    /// Seed a fresh state from a baseline evaluation.
    pub fn seeded(position: Vec<f64>, value: f64) -> Self {
        Self {
            best_position: position,
            best_value: value,
            iteration: 0,
            stagnation_count: 0,
        }
    }

    /// Record a trial. Returns true when it improved the best.
    ///
    /// A non-improving trial bumps the stagnation counter; an improving one
    /// replaces the best and resets it.
    pub fn observe(&mut self, position: &[f64], value: f64) -> bool {
        if value > self.best_value {
            self.best_position = position.to_vec();
            self.best_value = value;
            self.stagnation_count = 0;
            true
        } else {
            self.stagnation_count += 1;
            false
        }
    }

    /// Record a trial that never produced a metric (dropped by the bounds
    /// policy). Counts as non-improving.
    pub fn record_miss(&mut self) {
        self.stagnation_count += 1;
    }

    /// Forget accumulated stagnation, e.g. at the start of an axis sweep.
    pub fn reset_stagnation(&mut self) {
        self.stagnation_count = 0;
    }
}

/// Cooperative cancellation flag shared between the run owner and the
/// strategies.
///
/// Strategies wrap each objective evaluation in [`CancelToken::guard`], which
/// races the future against the flag and surfaces cancellation as
/// `AlignError::Interrupted`.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// New token plus the sender that trips it.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Token that can never be cancelled, for tests and one-shot tools.
    ///
    /// The sender is dropped immediately; [`Self::guard`] treats a closed
    /// channel as "nobody left to cancel".
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Run `fut`, aborting with `AlignError::Interrupted` if the flag trips
    /// first.
    pub async fn guard<T>(&self, fut: impl Future<Output = AlignResult<T>>) -> AlignResult<T> {
        if self.is_cancelled() {
            return Err(AlignError::Interrupted("cancellation requested".into()));
        }
        let mut rx = self.rx.clone();
        tokio::select! {
            result = fut => result,
            _ = async {
                // A dropped sender means nobody can cancel any more; park
                // this branch instead of misreading it as a cancellation.
                if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                    std::future::pending().await
                }
            } => Err(AlignError::Interrupted("cancellation requested".into())),
        }
    }
}

/// One optimization phase over the objective.
#[async_trait]
pub trait SearchStrategy: Send + Sync {
    /// Short name used in logs and phase summaries.
    fn name(&self) -> &'static str;

    /// Improve `state` in place until the phase's own stopping rule fires.
    async fn run(
        &self,
        objective: &dyn Objective,
        state: &mut SearchState,
        cancel: &CancelToken,
    ) -> AlignResult<()>;
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Synthetic objective for strategy tests: a pure function over the
    //! position vector, drop-policy bounds, no hardware.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::error::AlignResult;
    use crate::objective::Objective;

    pub struct FunctionObjective {
        f: Box<dyn Fn(&[f64]) -> f64 + Send + Sync>,
        min: f64,
        max: f64,
        position: Mutex<Vec<f64>>,
        evaluations: AtomicUsize,
    }

    impl FunctionObjective {
        pub fn new(
            start: Vec<f64>,
            min: f64,
            max: f64,
            f: impl Fn(&[f64]) -> f64 + Send + Sync + 'static,
        ) -> Self {
            Self {
                f: Box::new(f),
                min,
                max,
                position: Mutex::new(start),
                evaluations: AtomicUsize::new(0),
            }
        }

        pub fn evaluations(&self) -> usize {
            self.evaluations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Objective for FunctionObjective {
        fn axis_count(&self) -> usize {
            self.position.try_lock().map(|p| p.len()).unwrap_or(0)
        }

        async fn evaluate(&self, positions: &[f64]) -> AlignResult<Option<f64>> {
            if positions.iter().any(|p| *p < self.min || *p > self.max) {
                return Ok(None);
            }
            self.evaluations.fetch_add(1, Ordering::SeqCst);
            *self.position.lock().await = positions.to_vec();
            Ok(Some((self.f)(positions)))
        }

        async fn current_positions(&self) -> AlignResult<Vec<f64>> {
            Ok(self.position.lock().await.clone())
        }

        async fn commit(&self, positions: &[f64]) -> AlignResult<()> {
            *self.position.lock().await = positions.to_vec();
            Ok(())
        }
    }
}
