//! The closed optimization loop over one session.
//!
//! Random exploration steps come first, then surrogate-guided steps. Each
//! step decodes the candidate vector into a [`ParameterSet`], evaluates it,
//! registers the outcome with the surrogate and appends it to the session
//! store. A failed evaluation that is recoverable spends one unit of the
//! retry budget instead of an iteration; the step after it samples at random.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::OptimizerConfig;
use crate::errors::{CalResult, CalibrationError};
use crate::models::OptimizationLogEntry;
use crate::optimizer::objective::Objective;
use crate::optimizer::surrogate::{surrogate_target, Surrogate};
use crate::params::ParameterSet;
use crate::store::SessionStore;

/// Cooperative stop request, checked between evaluations.
#[derive(Debug, Clone, Default)]
pub struct TerminationSignal(Arc<AtomicBool>);

impl TerminationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Completed,
    Terminated,
    RetryBudgetExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOptions {
    pub init_points: usize,
    pub n_iter: usize,
    /// Failed evaluations retried before the session gives up.
    pub retry_budget: u32,
}

impl DriverOptions {
    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self {
            init_points: config.init_points,
            n_iter: config.n_iter,
            retry_budget: config.retry_budget,
        }
    }
}

/// Mutable state of a session, owned by the driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationSession {
    /// Completed evaluations, resumed ones included. Also the batch index
    /// and log sequence number of the next evaluation.
    pub batch: u64,
    pub random_remaining: usize,
    pub guided_remaining: usize,
    pub retries_used: u32,
    pub force_random: bool,
    /// Durations of the simulation runs completed in this process.
    pub run_times: Vec<Duration>,
    pub best: Option<OptimizationLogEntry>,
}

impl OptimizationSession {
    fn observe(&mut self, entry: OptimizationLogEntry) {
        let seq = entry.seq;
        let improves = self.best.as_ref().map_or(true, |best| entry.target > best.target);
        if improves {
            self.best = Some(entry);
        }
        self.batch = self.batch.max(seq + 1);
    }

    pub fn total_run_time(&self) -> Duration {
        self.run_times.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub best: Option<OptimizationLogEntry>,
    /// Evaluations completed by this call to [`OptimizationDriver::run`].
    pub evaluations: usize,
    pub retries_used: u32,
    pub run_times: Vec<Duration>,
    /// The failure that exhausted the retry budget.
    pub last_error: Option<String>,
}

pub struct OptimizationDriver<S, O> {
    parameters: ParameterSet,
    surrogate: S,
    objective: O,
    store: Option<SessionStore>,
    options: DriverOptions,
    session: OptimizationSession,
    termination: TerminationSignal,
}

impl<S, O> OptimizationDriver<S, O>
where
    S: Surrogate,
    O: Objective,
{
    /// `parameters` fixes the encode/decode order; its values are only used
    /// as a template.
    pub fn new(
        parameters: ParameterSet,
        surrogate: S,
        objective: O,
        options: DriverOptions,
    ) -> CalResult<Self> {
        if parameters.is_empty() {
            return Err(CalibrationError::Validation(
                "cannot optimize an empty parameter set".into(),
            ));
        }
        if surrogate.dimension() != parameters.len() {
            return Err(CalibrationError::LengthMismatch {
                expected: parameters.len(),
                actual: surrogate.dimension(),
            });
        }
        let expected = parameters.bounds_export();
        if let Some(((slug, wanted), actual)) = expected
            .iter()
            .zip(surrogate.bounds())
            .find(|((_, wanted), actual)| *wanted != *actual)
        {
            return Err(CalibrationError::Config(format!(
                "surrogate bounds {actual:?} differ from {wanted:?} declared by '{slug}'"
            )));
        }
        let session = OptimizationSession {
            random_remaining: options.init_points,
            guided_remaining: options.n_iter,
            ..OptimizationSession::default()
        };
        Ok(Self {
            parameters,
            surrogate,
            objective,
            store: None,
            options,
            session,
            termination: TerminationSignal::new(),
        })
    }

    /// Append every completed evaluation (and its run record) to `store`.
    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_termination(mut self, signal: TerminationSignal) -> Self {
        self.termination = signal;
        self
    }

    pub fn termination(&self) -> TerminationSignal {
        self.termination.clone()
    }

    pub fn session(&self) -> &OptimizationSession {
        &self.session
    }

    pub fn surrogate(&self) -> &S {
        &self.surrogate
    }

    pub fn objective(&self) -> &O {
        &self.objective
    }

    /// Register previously logged observations so they count as evaluated.
    /// Each one also replaces one pending random exploration step.
    pub fn resume(&mut self, entries: &[OptimizationLogEntry]) -> CalResult<usize> {
        for entry in entries {
            let mut params = self.parameters.clone();
            let written =
                params.set_from_mapping(entry.params.iter().map(|(k, v)| (k.as_str(), *v)), true)?;
            if written != params.len() {
                return Err(CalibrationError::LengthMismatch {
                    expected: params.len(),
                    actual: written,
                });
            }
            self.surrogate
                .register(&params.to_vector(), surrogate_target(entry.target))?;
            self.session.observe(entry.clone());
        }
        self.session.random_remaining = self
            .session
            .random_remaining
            .saturating_sub(entries.len());
        info!(
            restored = entries.len(),
            random_remaining = self.session.random_remaining,
            "resumed session"
        );
        Ok(entries.len())
    }

    /// Run until every planned step completes, the termination signal
    /// fires, or the retry budget is spent. Errors that are not recoverable
    /// abort immediately.
    pub fn run(&mut self) -> CalResult<SessionOutcome> {
        let mut evaluations = 0;
        let mut last_error = None;
        let status = loop {
            if self.termination.is_triggered() {
                info!(batch = self.session.batch, "termination requested");
                break SessionStatus::Terminated;
            }
            let random_step = self.session.random_remaining > 0;
            if !random_step && self.session.guided_remaining == 0 {
                break SessionStatus::Completed;
            }

            let point = if random_step || self.session.force_random {
                self.surrogate.sample_random()
            } else {
                self.surrogate.suggest()?
            };
            let mut candidate = self.parameters.clone();
            candidate.set_from_vector(&point)?;
            let batch = self.session.batch;
            info!(batch, random = random_step || self.session.force_random, "evaluating candidate");

            let evaluated = self.objective.evaluate(&candidate, batch).and_then(|evaluation| {
                if evaluation.target.is_nan() {
                    return Err(CalibrationError::MeasurementParse(format!(
                        "objective returned NaN for batch {batch}"
                    )));
                }
                Ok(evaluation)
            });
            match evaluated {
                Ok(evaluation) => {
                    self.session.force_random = false;
                    self.surrogate
                        .register(&candidate.to_vector(), surrogate_target(evaluation.target))?;
                    let entry = OptimizationLogEntry {
                        seq: batch,
                        target: evaluation.target,
                        params: candidate.to_mapping(),
                    };
                    if let Some(store) = &self.store {
                        store.append_observation(&entry)?;
                        if let Some(run) = &evaluation.run {
                            store.record_run(run)?;
                        }
                    }
                    if let Some(run) = evaluation.run {
                        self.session.run_times.push(run.duration);
                    }
                    self.session.observe(entry);
                    if random_step {
                        self.session.random_remaining -= 1;
                    } else {
                        self.session.guided_remaining -= 1;
                    }
                    evaluations += 1;
                }
                Err(e) if e.is_recoverable() => {
                    if self.session.retries_used >= self.options.retry_budget {
                        error!(error = %e, budget = self.options.retry_budget, "retry budget exhausted");
                        last_error = Some(e.to_string());
                        break SessionStatus::RetryBudgetExhausted;
                    }
                    self.session.retries_used += 1;
                    self.session.force_random = true;
                    warn!(
                        error = %e,
                        retries_used = self.session.retries_used,
                        budget = self.options.retry_budget,
                        "evaluation failed, retrying with a random candidate"
                    );
                }
                Err(e) => return Err(e),
            }
        };

        let best = self.session.best.clone();
        info!(
            ?status,
            evaluations,
            best_target = best.as_ref().map(|b| b.target),
            run_time_secs = self.session.total_run_time().as_secs_f64(),
            "session finished"
        );
        Ok(SessionOutcome {
            status,
            best,
            evaluations,
            retries_used: self.session.retries_used,
            run_times: self.session.run_times.clone(),
            last_error,
        })
    }
}
