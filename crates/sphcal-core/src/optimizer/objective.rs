//! The black-box objective: bind a candidate into the case definition, run
//! the engine and score what it measured.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::config::{Settings, WindowConfig};
use crate::document::ConfigDocumentBinder;
use crate::errors::{CalResult, CalibrationError};
use crate::models::SimulationRunRecord;
use crate::params::{ParameterContract, ParameterSet, ScalarKind, SecondaryKey};
use crate::scoring::{Metric, ScoringEngine};
use crate::simulation::{Case, SimulationRunner};

/// Node holding the engine's execution parameters.
pub const EXECUTION_PARAMETER_NODE: &str = "./execution/parameters/parameter";

/// Result of one successful evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub target: f64,
    /// The simulation run behind the target, when there was one.
    pub run: Option<SimulationRunRecord>,
}

impl Evaluation {
    pub fn target(target: f64) -> Self {
        Self { target, run: None }
    }
}

pub trait Objective {
    /// Evaluate `params` as evaluation number `batch` of the session.
    fn evaluate(&mut self, params: &ParameterSet, batch: u64) -> CalResult<Evaluation>;
}

impl<F> Objective for F
where
    F: FnMut(&ParameterSet, u64) -> CalResult<f64>,
{
    fn evaluate(&mut self, params: &ParameterSet, batch: u64) -> CalResult<Evaluation> {
        self(params, batch).map(Evaluation::target)
    }
}

/// `TimeMax` and `TimeOut` execution parameters for the simulated window.
pub fn window_parameters(window: &WindowConfig) -> CalResult<ParameterSet> {
    let mut set = ParameterSet::new();
    for (key, value) in [
        ("TimeMax", window.duration_secs),
        ("TimeOut", window.output_interval_secs()),
    ] {
        let contract = ParameterContract::new(EXECUTION_PARAMETER_NODE, "value", value, ScalarKind::Float32)?
            .with_secondary_key(SecondaryKey::new("key", key))?;
        set.append(contract, value)?;
    }
    Ok(set)
}

/// Objective backed by a real case: the engine runs once per evaluation.
pub struct CaseObjective {
    case: Case,
    binder: ConfigDocumentBinder,
    runner: SimulationRunner,
    engine: ScoringEngine,
    window: ParameterSet,
    measurement_file: String,
    metric: Metric,
    delay: usize,
    run_id: String,
}

impl CaseObjective {
    pub fn new(
        case: Case,
        runner: SimulationRunner,
        engine: ScoringEngine,
        settings: &Settings,
        run_id: impl Into<String>,
    ) -> CalResult<Self> {
        let binder = ConfigDocumentBinder::open(&case.definition)?;
        Ok(Self {
            measurement_file: settings.simulation.measurement_file_for(&case.name),
            window: window_parameters(&settings.window)?,
            metric: settings.scoring.metric,
            delay: settings.scoring.delay_steps,
            run_id: run_id.into(),
            case,
            binder,
            runner,
            engine,
        })
    }

    pub fn case(&self) -> &Case {
        &self.case
    }

    /// Write `params` plus the simulation window into the case definition
    /// and persist it.
    pub fn bind(&mut self, params: &ParameterSet) -> CalResult<PathBuf> {
        let merged = params.merged(&self.window);
        self.binder.apply(&merged)?;
        let path = self.binder.persist()?;
        debug!(path = %path.display(), parameters = merged.len(), "bound candidate into case definition");
        Ok(path)
    }
}

impl Objective for CaseObjective {
    fn evaluate(&mut self, params: &ParameterSet, batch: u64) -> CalResult<Evaluation> {
        self.bind(params)?;
        let record = self.runner.run(&self.case, &self.run_id, batch)?;
        let measurement = record.artifact_path.join(&self.measurement_file);
        if !measurement.is_file() {
            return Err(CalibrationError::ArtifactMissing(measurement));
        }
        let target = self
            .engine
            .score_file(&measurement, self.metric, self.delay, batch)?;
        info!(batch, target, metric = %self.metric, "evaluation scored");
        Ok(Evaluation {
            target,
            run: Some(record),
        })
    }
}
