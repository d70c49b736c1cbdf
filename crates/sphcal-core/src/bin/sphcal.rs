//! sphcal: calibrate flume simulation parameters against recorded data.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use _sphcal_core::config::Settings;
use _sphcal_core::document::discovery::{discover_contracts, PathFilter, RecordAll};
use _sphcal_core::document::ConfigDocument;
use _sphcal_core::errors::{CalResult, CalibrationError};
use _sphcal_core::models::timestamp_now;
use _sphcal_core::optimizer::{
    CaseObjective, DriverOptions, GaussianProcessSurrogate, Objective, OptimizationDriver,
    SessionStatus, TerminationSignal,
};
use _sphcal_core::params::contract_file::{contract_file_name, write_contract_file, ContractFile};
use _sphcal_core::params::ParameterSet;
use _sphcal_core::scoring::{MeasurementTable, Metric, ScoringEngine};
use _sphcal_core::simulation::case::{list_cases, list_contract_files};
use _sphcal_core::simulation::{Case, RunnerOptions, SimulationRunner};
use _sphcal_core::store::{list_sessions, session_path, SessionInfo, SessionStore};

#[derive(Parser, Debug)]
#[command(name = "sphcal")]
#[command(about = "Bayesian calibration of flume simulation parameters")]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List cases and contract files
    Cases,
    /// List recorded sessions
    Sessions,
    /// Copy a session store, also while it is being written
    Export {
        /// Session store (`.sqlite3`)
        session: PathBuf,
        /// Destination file
        output: PathBuf,
    },
    /// Record the numeric attributes of a case definition as contracts
    Discover {
        #[arg(long)]
        case: String,
        /// Name of the contract set (`HyperParameter_Contract-<NAME>.txt`)
        #[arg(long)]
        name: String,
        /// Only record attributes whose node path matches this regex
        #[arg(long)]
        filter: Option<String>,
    },
    /// Bind a contract file into a case definition
    Apply {
        #[arg(long)]
        case: String,
        #[arg(long)]
        contracts: PathBuf,
        /// Also run and score the simulation once
        #[arg(long)]
        run: bool,
    },
    /// Run an optimization session
    Calibrate {
        #[arg(long)]
        case: String,
        #[arg(long)]
        contracts: PathBuf,
        /// Continue a recorded session (its `.sqlite3` file)
        #[arg(long)]
        resume: Option<PathBuf>,
    },
    /// Compare a measurement file with the reference data
    Compare {
        /// Measurement CSV produced by the engine
        file: PathBuf,
        #[arg(long, default_value_t = 0)]
        batch: u64,
        /// Steps skipped at the start; defaults to the configured delay
        #[arg(long)]
        delay: Option<usize>,
        /// Write the aligned samples here as CSV
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct AlignedRow {
    time: f64,
    vel_x_sim: f64,
    vel_x_real: f64,
    x: f64,
    y: f64,
    z: f64,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sphcal=info,_sphcal_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let result = Settings::load(cli.config.as_deref()).and_then(|settings| match cli.command {
        Commands::Cases => cmd_cases(&settings),
        Commands::Sessions => cmd_sessions(&settings),
        Commands::Export { session, output } => cmd_export(&session, &output),
        Commands::Discover { case, name, filter } => cmd_discover(&settings, &case, &name, filter.as_deref()),
        Commands::Apply {
            case,
            contracts,
            run,
        } => cmd_apply(&settings, &case, &contracts, run),
        Commands::Calibrate {
            case,
            contracts,
            resume,
        } => cmd_calibrate(&settings, &case, &contracts, resume.as_deref()),
        Commands::Compare {
            file,
            batch,
            delay,
            output,
        } => cmd_compare(&settings, &file, batch, delay, output.as_deref()),
    });

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "sphcal failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn open_case(settings: &Settings, name: &str) -> CalResult<Case> {
    Case::open(&settings.paths.cases_dir, name, settings.simulation.platform)
}

fn cmd_cases(settings: &Settings) -> CalResult<ExitCode> {
    for name in list_cases(&settings.paths.cases_dir)? {
        match open_case(settings, &name) {
            Ok(case) => println!("{name}\t{}", case.definition.display()),
            Err(e) => println!("{name}\t({e})"),
        }
    }
    if settings.paths.contracts_dir.is_dir() {
        for file in list_contract_files(&settings.paths.contracts_dir)? {
            println!("contracts\t{}", file.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_sessions(settings: &Settings) -> CalResult<ExitCode> {
    for session in list_sessions(&settings.paths.logs_dir)? {
        let (name, case) = session
            .info
            .as_ref()
            .map(|i| (i.name.as_str(), i.case_name.as_str()))
            .unwrap_or(("?", "?"));
        let best = session
            .best_target
            .map(|t| format!("{t:.6}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "{}\t{name}\t{case}\t{} observations\tbest {best}",
            session.path.display(),
            session.observations
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_export(session: &Path, output: &Path) -> CalResult<ExitCode> {
    let store = SessionStore::open_existing(session)?;
    let copy = store.backup_to(output)?;
    println!(
        "{} observations exported to {}",
        store.observation_count()?,
        copy.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_discover(settings: &Settings, case: &str, name: &str, filter: Option<&str>) -> CalResult<ExitCode> {
    let case = open_case(settings, case)?;
    let document = ConfigDocument::load(&case.definition)?;
    let parameters = match filter {
        Some(pattern) => discover_contracts(&document, &mut PathFilter::new(pattern)?)?,
        None => discover_contracts(&document, &mut RecordAll)?,
    };
    let path = settings.paths.contracts_dir.join(contract_file_name(name));
    write_contract_file(&path, &parameters)?;
    println!("{} contracts written to {}", parameters.len(), path.display());
    Ok(ExitCode::SUCCESS)
}

fn build_objective(
    settings: &Settings,
    case: Case,
    artifact_root: PathBuf,
    resource_log: PathBuf,
    run_id: &str,
) -> CalResult<CaseObjective> {
    let runner = SimulationRunner::new(
        RunnerOptions::from_config(&settings.simulation, resource_log),
        artifact_root,
    );
    let engine = ScoringEngine::with_reference_dir(
        &settings.paths.reference_dir,
        settings.scoring.reference_depth_mm,
    );
    CaseObjective::new(case, runner, engine, settings, run_id)
}

fn print_parameters(params: &ParameterSet) {
    for (contract, value) in params.iter() {
        println!("  {} = {}", contract.label(), contract.render(value));
    }
}

fn cmd_apply(settings: &Settings, case: &str, contracts: &Path, run: bool) -> CalResult<ExitCode> {
    let case = open_case(settings, case)?;
    let contract_file = ContractFile::load(contracts)?;
    let id = timestamp_now();
    let name = contract_file.session_name();
    let mut objective = build_objective(
        settings,
        case,
        settings.paths.measurements_dir.join(format!("{name}-{id}")),
        settings.paths.logs_dir.join(format!("{id}-{name}-RESOURCE_LOG.csv")),
        &format!("{name}-{id}"),
    )?;

    if run {
        let evaluation = objective.evaluate(&contract_file.parameters, 0)?;
        println!("target: {}", evaluation.target);
        if let Some(record) = evaluation.run {
            println!(
                "run: {:.1}s, artifacts in {}",
                record.duration.as_secs_f64(),
                record.artifact_path.display()
            );
        }
    } else {
        let path = objective.bind(&contract_file.parameters)?;
        println!("bound {} parameters into {}", contract_file.parameters.len(), path.display());
    }
    Ok(ExitCode::SUCCESS)
}

/// Trigger `signal` when the operator enters `q` on the terminal.
fn watch_for_quit(signal: TerminationSignal) {
    let spawned = thread::Builder::new()
        .name("quit-watcher".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) if line.trim().eq_ignore_ascii_case("q") => {
                        warn!("stop requested, finishing the current evaluation");
                        signal.trigger();
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "cannot watch the terminal for a stop request");
    }
}

fn cmd_calibrate(
    settings: &Settings,
    case: &str,
    contracts: &Path,
    resume: Option<&Path>,
) -> CalResult<ExitCode> {
    let case = open_case(settings, case)?;
    let contract_file = ContractFile::load(contracts)?;

    let id = timestamp_now();
    let name = contract_file.session_name();
    let store = match resume {
        Some(path) => SessionStore::open_existing(path)?,
        None => SessionStore::open(session_path(&settings.paths.logs_dir, &id, &name))?,
    };
    let session = store.bind_session(&SessionInfo {
        name,
        id,
        case_name: case.name.clone(),
        contract_digest: contract_file.digest.clone(),
    })?;
    if session.case_name != case.name {
        return Err(CalibrationError::Config(format!(
            "session '{}' was recorded for case '{}', not '{}'",
            session.name, session.case_name, case.name
        )));
    }
    let priors = store.load_observations()?;
    let run_id = format!("{}-{}", session.name, session.id);
    info!(session = %run_id, store = %store.path().display(), priors = priors.len(), "starting calibration");

    let objective = build_objective(
        settings,
        case,
        settings.paths.measurements_dir.join(&run_id),
        settings
            .paths
            .logs_dir
            .join(format!("{}-{}-RESOURCE_LOG.csv", session.id, session.name)),
        &run_id,
    )?;
    let bounds = contract_file.parameters.bounds_export().into_values().collect();
    let surrogate = GaussianProcessSurrogate::from_config(&settings.optimizer, bounds)?;
    let mut driver = OptimizationDriver::new(
        contract_file.parameters.clone(),
        surrogate,
        objective,
        DriverOptions::from_config(&settings.optimizer),
    )?
    .with_store(store);
    driver.resume(&priors)?;

    watch_for_quit(driver.termination());
    println!("Enter q to stop after the current evaluation.");
    let outcome = driver.run()?;

    println!("status: {:?}", outcome.status);
    println!(
        "evaluations: {} ({} retries), simulated for {:.1}s",
        outcome.evaluations,
        outcome.retries_used,
        outcome.run_times.iter().map(|d| d.as_secs_f64()).sum::<f64>()
    );
    if let Some(best) = &outcome.best {
        let mut params = contract_file.parameters.clone();
        params.set_from_mapping(best.params.iter().map(|(k, v)| (k.as_str(), *v)), false)?;
        println!("best target {} (evaluation {}):", best.target, best.seq);
        print_parameters(&params);
    }
    if let Some(e) = &outcome.last_error {
        println!("last error: {e}");
    }
    Ok(match outcome.status {
        SessionStatus::RetryBudgetExhausted => ExitCode::from(2),
        _ => ExitCode::SUCCESS,
    })
}

fn cmd_compare(
    settings: &Settings,
    file: &Path,
    batch: u64,
    delay: Option<usize>,
    output: Option<&Path>,
) -> CalResult<ExitCode> {
    let delay = delay.unwrap_or(settings.scoring.delay_steps);
    let table = MeasurementTable::load(file)?;
    let engine = ScoringEngine::with_reference_dir(
        &settings.paths.reference_dir,
        settings.scoring.reference_depth_mm,
    );
    for metric in [Metric::Mad, Metric::Mse] {
        let target = engine.score(&table, &table.probes, metric, delay, batch)?;
        println!("{metric}: {target}");
    }

    if let Some(output) = output {
        let rows = engine.aligned(&table, &table.probes, delay, batch)?;
        let mut writer = csv::Writer::from_path(output)?;
        for row in &rows {
            writer.serialize(AlignedRow {
                time: row.time,
                vel_x_sim: row.simulated,
                vel_x_real: row.real,
                x: row.probe.x,
                y: row.probe.y,
                z: row.probe.z,
            })?;
        }
        writer.flush()?;
        println!("{} aligned samples written to {}", rows.len(), output.display());
    }
    Ok(ExitCode::SUCCESS)
}
