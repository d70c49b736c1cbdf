//! End-to-end calibration against a stub engine.
//!
//! The stub launch script copies a fixed measurement file into the case's
//! output directory, so every evaluation scores the same and the expected
//! targets can be worked out by hand.

use std::fs;
use std::path::{Path, PathBuf};

use approx::assert_relative_eq;

use _sphcal_core::config::Settings;
use _sphcal_core::document::ConfigDocument;
use _sphcal_core::errors::{CalResult, CalibrationError};
use _sphcal_core::models::OptimizationLogEntry;
use _sphcal_core::optimizer::{
    CaseObjective, DriverOptions, GaussianProcessSurrogate, OptimizationDriver, SessionStatus, Surrogate,
};
use _sphcal_core::params::{ParameterContract, ParameterSet, ScalarKind};
use _sphcal_core::scoring::{Metric, ScoringEngine};
use _sphcal_core::simulation::{Case, Platform, RunnerOptions, SimulationRunner};
use _sphcal_core::store::{session_path, SessionInfo, SessionStore};

const CASE: &str = "Flume";

/// Probe 0 sits 4 m upstream near the bed, probe 1 6.5 m upstream near the
/// surface. Ten steps; probe 0 reads 1.0 and probe 1 reads 0.5 throughout.
fn measurement_fixture() -> String {
    let mut text = String::from("Pos;;4.0;0.0;0.5;6.5;0.0;1.5\n");
    text.push_str("Part;Time [s];Vel_0.x [m/s];Vel_0.y [m/s];Vel_0.z [m/s];Vel_1.x [m/s];Vel_1.y [m/s];Vel_1.z [m/s]\n");
    for step in 0..10 {
        text.push_str(&format!("{step};{};1.0;0;0;0.5;0;0\n", step as f64 * 0.25));
    }
    text
}

/// Bottom band at 4 m ramps `0.0, 0.1, ...`; top band at 6 m is flat 0.25.
fn write_reference(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    let ramp: String = (0..20).map(|i| format!("{} {}\n", i as f64 * 0.25, i as f64 * 0.1)).collect();
    fs::write(dir.join("Data_Depth1000mm_Upstream4m_Bottom.txt"), ramp).unwrap();
    let flat: String = (0..20).map(|i| format!("{} 0.25\n", i as f64 * 0.25)).collect();
    fs::write(dir.join("Data_Depth1000mm_Upstream6m_Top.txt"), flat).unwrap();
}

const DEFINITION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<case>
    <constants>
        <visco value="0.1" />
        <coefh value="1.2" />
    </constants>
    <execution>
        <parameters>
            <parameter key="TimeMax" value="1" />
            <parameter key="TimeOut" value="0.1" />
        </parameters>
    </execution>
</case>
"#;

const STUB_SCRIPT: &str = "mkdir -p Flume_out/measurements\ncp fixture.csv Flume_out/measurements/Flume_Vel.csv\n";

/// Fails on its first two launches, then behaves like `STUB_SCRIPT`.
const FLAKY_SCRIPT: &str = r#"n=$(cat launches 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > launches
if [ "$n" -le 2 ]; then exit 1; fi
mkdir -p Flume_out/measurements
cp fixture.csv Flume_out/measurements/Flume_Vel.csv
"#;

struct Workspace {
    _root: tempfile::TempDir,
    settings: Settings,
    case: Case,
}

fn workspace(script: &str) -> Workspace {
    let root = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.paths.cases_dir = root.path().join("cases");
    settings.paths.contracts_dir = root.path().join("contracts");
    settings.paths.logs_dir = root.path().join("logs");
    settings.paths.measurements_dir = root.path().join("measurements");
    settings.paths.reference_dir = root.path().join("reference");
    settings.simulation.platform = Platform::Linux64;
    settings.simulation.monitor = false;
    settings.simulation.handshake_delay_secs = 0;
    settings.window.duration_secs = 2.0;
    settings.window.output_frequency_hz = 4.0;
    settings.scoring.metric = Metric::Mad;
    settings.scoring.delay_steps = 2;
    settings.optimizer.acquisition_samples = 64;

    let dir = settings.paths.cases_dir.join(CASE);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{CASE}_Def.xml")), DEFINITION).unwrap();
    fs::write(dir.join(format!("{CASE}_linux64_GPU.sh")), script).unwrap();
    fs::write(dir.join("fixture.csv"), measurement_fixture()).unwrap();
    write_reference(&settings.paths.reference_dir);

    let case = Case::open(&settings.paths.cases_dir, CASE, Platform::Linux64).unwrap();
    Workspace {
        _root: root,
        settings,
        case,
    }
}

fn parameters() -> ParameterSet {
    let visco = ParameterContract::new("./constants/visco", "value", 0.1, ScalarKind::Float64)
        .unwrap()
        .with_bounds(0.01, 0.5)
        .unwrap();
    let coefh = ParameterContract::new("./constants/coefh", "value", 1.2, ScalarKind::Float32)
        .unwrap()
        .with_bounds(0.8, 1.6)
        .unwrap();
    ParameterSet::from_defaults([visco, coefh])
}

fn objective(ws: &Workspace) -> CaseObjective {
    let runner = SimulationRunner::new(
        RunnerOptions::from_config(&ws.settings.simulation, ws.settings.paths.logs_dir.join("resources.csv")),
        ws.settings.paths.measurements_dir.join("Test-run"),
    );
    let engine = ScoringEngine::with_reference_dir(&ws.settings.paths.reference_dir, 1000);
    CaseObjective::new(ws.case.clone(), runner, engine, &ws.settings, "Test-run").unwrap()
}

fn surrogate(settings: &Settings, params: &ParameterSet) -> GaussianProcessSurrogate {
    GaussianProcessSurrogate::from_config(&settings.optimizer, params.bounds_export().into_values().collect())
        .unwrap()
}

fn store(ws: &Workspace) -> (SessionStore, PathBuf) {
    let path = session_path(&ws.settings.paths.logs_dir, "2026-01-01_00-00-00", "Test");
    let store = SessionStore::open(&path).unwrap();
    store
        .bind_session(&SessionInfo {
            name: "Test".into(),
            id: "2026-01-01_00-00-00".into(),
            case_name: CASE.into(),
            contract_digest: "digest".into(),
        })
        .unwrap();
    (store, path)
}

/// MAD after skipping two steps: probe 0 compares 1.0 with 0.0..0.7
/// (mean 0.65), probe 1 compares 0.5 with 0.25 (0.25).
const EXPECTED_MAD_TARGET: f64 = 1.0 / 0.45;

#[test]
fn test_hand_computed_scores() {
    let ws = workspace(STUB_SCRIPT);
    let path = ws.case.dir.join("fixture.csv");
    let engine = ScoringEngine::with_reference_dir(&ws.settings.paths.reference_dir, 1000);

    let mad = engine.score_file(&path, Metric::Mad, 2, 0).unwrap();
    assert_relative_eq!(mad, EXPECTED_MAD_TARGET, epsilon = 1e-9);

    // probe 0: (1.0 + 0.81 + ... + 0.09) / 8 = 0.475; probe 1: 0.0625
    let mse = engine.score_file(&path, Metric::Mse, 2, 0).unwrap();
    assert_relative_eq!(mse, 1.0 / 0.26875, epsilon = 1e-9);
}

#[test]
fn test_batch_selects_rolled_reference_window() {
    let ws = workspace(STUB_SCRIPT);
    let path = ws.case.dir.join("fixture.csv");
    let engine = ScoringEngine::with_reference_dir(&ws.settings.paths.reference_dir, 1000);

    // 8 compared samples tile the 20-sample reference twice; batch 1 shifts
    // by 8, so probe 0 compares against reference samples 12..20
    // (1.2..1.9), mean |1.0 - v| = 0.55.
    let target = engine.score_file(&path, Metric::Mad, 2, 1).unwrap();
    assert_relative_eq!(target, 1.0 / ((0.55 + 0.25) / 2.0), epsilon = 1e-9);
    let wrapped = engine.score_file(&path, Metric::Mad, 2, 3).unwrap();
    assert_relative_eq!(wrapped, target, epsilon = 1e-12);
}

#[cfg(unix)]
#[test]
fn test_calibrate_end_to_end() {
    let ws = workspace(STUB_SCRIPT);
    let params = parameters();
    let (store, path) = store(&ws);
    let options = DriverOptions {
        init_points: 2,
        n_iter: 1,
        retry_budget: 2,
    };
    let mut driver = OptimizationDriver::new(params.clone(), surrogate(&ws.settings, &params), objective(&ws), options)
        .unwrap()
        .with_store(store);
    let outcome = driver.run().unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.evaluations, 3);
    assert_eq!(outcome.retries_used, 0);
    assert_eq!(outcome.run_times.len(), 3);
    let best = outcome.best.unwrap();
    assert_relative_eq!(best.target, EXPECTED_MAD_TARGET, epsilon = 1e-9);

    let reopened = SessionStore::open_existing(&path).unwrap();
    let observations = reopened.load_observations().unwrap();
    assert_eq!(observations.iter().map(|o| o.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(reopened.run_count().unwrap(), 3);
    let visco_slug = params.contracts().next().unwrap().serialize();
    for observation in &observations {
        let visco = observation.params[&visco_slug];
        assert!((0.01..=0.5).contains(&visco), "visco {visco} outside its bounds");
    }

    // the window is forced into every bound definition
    let definition = ConfigDocument::load(&ws.case.definition).unwrap();
    let window: Vec<String> = definition
        .find_all("./execution/parameters/parameter")
        .unwrap()
        .iter()
        .map(|e| e.attribute("value").unwrap_or_default().to_string())
        .collect();
    assert_eq!(window, vec!["2", "0.25"]);
}

#[cfg(unix)]
#[test]
fn test_failed_launches_consume_retries() {
    let ws = workspace(FLAKY_SCRIPT);
    let params = parameters();
    let options = DriverOptions {
        init_points: 1,
        n_iter: 0,
        retry_budget: 3,
    };
    let mut driver =
        OptimizationDriver::new(params.clone(), surrogate(&ws.settings, &params), objective(&ws), options).unwrap();
    let outcome = driver.run().unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.retries_used, 2);
    assert_eq!(outcome.evaluations, 1);
    assert_relative_eq!(outcome.best.unwrap().target, EXPECTED_MAD_TARGET, epsilon = 1e-9);
}

#[cfg(unix)]
#[test]
fn test_retry_budget_exhaustion_keeps_best() {
    let ws = workspace(FLAKY_SCRIPT);
    let params = parameters();
    let options = DriverOptions {
        init_points: 1,
        n_iter: 0,
        retry_budget: 1,
    };
    let mut driver =
        OptimizationDriver::new(params.clone(), surrogate(&ws.settings, &params), objective(&ws), options).unwrap();
    let outcome = driver.run().unwrap();

    assert_eq!(outcome.status, SessionStatus::RetryBudgetExhausted);
    assert_eq!(outcome.retries_used, 1);
    assert!(outcome.best.is_none());
    assert!(outcome.last_error.is_some());
}

#[test]
fn test_resume_continues_batch_numbering() {
    let ws = workspace(STUB_SCRIPT);
    let params = parameters();
    let (store, path) = store(&ws);

    let first = |p: &ParameterSet, _batch: u64| -> CalResult<f64> { Ok(p.to_vector()[0]) };
    let mut driver = OptimizationDriver::new(
        params.clone(),
        surrogate(&ws.settings, &params),
        first,
        DriverOptions {
            init_points: 3,
            n_iter: 0,
            retry_budget: 0,
        },
    )
    .unwrap()
    .with_store(store);
    assert_eq!(driver.run().unwrap().evaluations, 3);

    let store = SessionStore::open_existing(&path).unwrap();
    let priors = store.load_observations().unwrap();
    assert_eq!(priors.len(), 3);

    let mut batches = Vec::new();
    let second = |p: &ParameterSet, batch: u64| -> CalResult<f64> {
        batches.push(batch);
        Ok(p.to_vector()[0])
    };
    let mut driver = OptimizationDriver::new(
        params.clone(),
        surrogate(&ws.settings, &params),
        second,
        DriverOptions {
            init_points: 4,
            n_iter: 1,
            retry_budget: 0,
        },
    )
    .unwrap()
    .with_store(store);
    driver.resume(&priors).unwrap();
    assert_eq!(driver.session().random_remaining, 1);
    let outcome = driver.run().unwrap();
    drop(driver);

    assert_eq!(outcome.evaluations, 2);
    assert_eq!(batches, vec![3, 4]);
    let store = SessionStore::open_existing(&path).unwrap();
    assert_eq!(store.observation_count().unwrap(), 5);
    let best = store.best_target().unwrap().unwrap();
    assert_relative_eq!(best, outcome.best.unwrap().target);
}

#[test]
fn test_resume_rejects_foreign_contracts() {
    let ws = workspace(STUB_SCRIPT);
    let params = parameters();
    let (store, _path) = store(&ws);
    let foreign = ParameterContract::new("./constants/other", "value", 0.3, ScalarKind::Float64).unwrap();
    store
        .append_observation(&OptimizationLogEntry {
            seq: 0,
            target: 1.0,
            params: [(foreign.serialize(), 0.3)].into_iter().collect(),
        })
        .unwrap();
    let priors = store.load_observations().unwrap();

    let objective = |_: &ParameterSet, _: u64| -> CalResult<f64> { Ok(0.0) };
    let mut driver = OptimizationDriver::new(
        params.clone(),
        surrogate(&ws.settings, &params),
        objective,
        DriverOptions::from_config(&ws.settings.optimizer),
    )
    .unwrap();
    assert!(matches!(driver.resume(&priors), Err(CalibrationError::NotFound(_))));
    assert!(driver.surrogate().is_empty());
}
