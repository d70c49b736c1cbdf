//! Runs the external engine for one evaluation and collects its output.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::SimulationConfig;
use crate::errors::{CalResult, CalibrationError};
use crate::models::{PendingRun, SimulationRunRecord, TIMESTAMP_FORMAT};
use crate::simulation::case::{Case, Platform};
use crate::simulation::monitor::{MonitorConfig, ResourceMonitor};

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub launcher: Vec<String>,
    pub export_extra_artifacts: bool,
    pub handshake_delay: Duration,
    pub overwrite_confirmation: String,
    pub exit_keystroke: String,
    /// Resource sampling; `None` disables the monitor.
    pub monitor: Option<MonitorOptions>,
}

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub process_name: String,
    pub interval: Duration,
    pub log_path: PathBuf,
}

impl RunnerOptions {
    pub fn from_config(config: &SimulationConfig, resource_log: PathBuf) -> Self {
        Self {
            launcher: config.launcher.clone(),
            export_extra_artifacts: config.export_extra_artifacts,
            handshake_delay: Duration::from_secs(config.handshake_delay_secs),
            overwrite_confirmation: config.overwrite_confirmation.clone(),
            exit_keystroke: config.exit_keystroke.clone(),
            monitor: config.monitor.then(|| MonitorOptions {
                process_name: config.engine_process_name.clone(),
                interval: Duration::from_secs(config.monitor_interval_secs),
                log_path: resource_log,
            }),
        }
    }
}

/// Launches a case's script and copies the measurements it produces into
/// `<artifact_root>/<case>-<timestamp>-Batch<k>`.
#[derive(Debug, Clone)]
pub struct SimulationRunner {
    options: RunnerOptions,
    artifact_root: PathBuf,
}

impl SimulationRunner {
    pub fn new(options: RunnerOptions, artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            options,
            artifact_root: artifact_root.into(),
        }
    }

    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    /// Run the engine once. Blocks until the launch script exits.
    pub fn run(&self, case: &Case, run_id: &str, batch_index: u64) -> CalResult<SimulationRunRecord> {
        let script = case.launch_script();
        if !script.is_file() {
            return Err(CalibrationError::Config(format!(
                "launch script '{}' not found",
                script.display()
            )));
        }
        let pending = PendingRun::start(&case.definition, &case.name, run_id, batch_index);
        let stale_output = case.output_dir().exists();

        info!(script = %script.display(), batch = batch_index, "launching simulation");
        let started = Instant::now();
        let mut child = self.command(case, &script).spawn()?;

        if stale_output {
            thread::sleep(self.options.handshake_delay);
            send_input(&mut child, &self.options.overwrite_confirmation);
            debug!("confirmed overwrite of stale output directory");
        }

        let monitor = match &self.options.monitor {
            Some(opts) => {
                let config = MonitorConfig {
                    process_name: opts.process_name.clone(),
                    interval: opts.interval,
                    log_path: opts.log_path.clone(),
                    batch: batch_index,
                };
                match ResourceMonitor::spawn(config, Some(child.id())) {
                    Ok(m) => Some(m),
                    Err(e) => {
                        warn!(error = %e, "resource monitor could not start");
                        None
                    }
                }
            }
            None => None,
        };

        if case.platform == Platform::Linux64 {
            send_input(&mut child, &self.options.exit_keystroke);
        }
        drop(child.stdin.take());

        let status = child.wait();
        let duration = started.elapsed();
        let peak = monitor.map(ResourceMonitor::stop);
        let status = status?;
        if !status.success() {
            return Err(CalibrationError::SimulationFailure(format!(
                "'{}' exited with {status} after {:.1}s",
                script.display(),
                duration.as_secs_f64()
            )));
        }
        info!(elapsed_secs = duration.as_secs_f64(), "simulation complete");

        let measurements = case.measurement_dir();
        if !measurements.is_dir() {
            return Err(CalibrationError::ArtifactMissing(measurements));
        }
        let destination = self.artifact_root.join(format!(
            "{}-{}-Batch{}",
            case.name,
            pending.started_at().format(TIMESTAMP_FORMAT),
            batch_index
        ));
        let copied = copy_tree(&measurements, &destination)?;
        debug!(files = copied, destination = %destination.display(), "copied measurements");

        let peak_memory = peak.filter(|p| p.samples > 0).map(|p| p.memory_bytes);
        Ok(pending.finish(duration, destination, peak_memory))
    }

    fn command(&self, case: &Case, script: &Path) -> Command {
        let mut argv: Vec<String> = self.options.launcher.clone();
        if case.platform == Platform::Linux64 {
            argv.push("sh".to_string());
        }
        argv.push(script.to_string_lossy().into_owned());

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .arg(if self.options.export_extra_artifacts { "1" } else { "0" })
            .current_dir(&case.dir)
            .stdin(Stdio::piped());
        command
    }
}

/// Write `text` to the child's stdin. A script that has already exited or
/// never reads its input is not an error.
fn send_input(child: &mut Child, text: &str) {
    if text.is_empty() {
        return;
    }
    let Some(stdin) = child.stdin.as_mut() else {
        return;
    };
    let result = stdin.write_all(text.as_bytes()).and_then(|_| stdin.flush());
    match result {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("launch script closed its input before the handshake")
        }
        Err(e) => warn!(error = %e, "failed to write to launch script"),
    }
}

/// Recursively copy `src` into `dst`, returning the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> CalResult<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| CalibrationError::Io(io::Error::other(e.to_string())))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| CalibrationError::Io(io::Error::other(e.to_string())))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
