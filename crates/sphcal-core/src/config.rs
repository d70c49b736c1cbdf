//! Settings loading.
//!
//! Settings come from an optional TOML file; every field has a default so a
//! missing file yields a usable configuration. A handful of `SPHCAL_*`
//! environment variables are applied on top of the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{CalResult, CalibrationError};
use crate::scoring::engine::Metric;
use crate::simulation::case::Platform;

/// Matern smoothness values the bundled surrogate implements.
pub const SUPPORTED_NU: &[f64] = &[0.5, 1.5, 2.5];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

/// Directory layout of a calibration workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_cases_dir")]
    pub cases_dir: PathBuf,
    #[serde(default = "default_contracts_dir")]
    pub contracts_dir: PathBuf,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    #[serde(default = "default_measurements_dir")]
    pub measurements_dir: PathBuf,
    #[serde(default = "default_reference_dir")]
    pub reference_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub platform: Platform,
    /// Command prefix placed before the launch script, e.g. `["sudo"]`.
    #[serde(default)]
    pub launcher: Vec<String>,
    #[serde(default)]
    pub export_extra_artifacts: bool,
    #[serde(default = "default_handshake_delay_secs")]
    pub handshake_delay_secs: u64,
    #[serde(default = "default_overwrite_confirmation")]
    pub overwrite_confirmation: String,
    /// Sent once the engine is running; the linux launch scripts wait for a
    /// key press before they return.
    #[serde(default = "default_exit_keystroke")]
    pub exit_keystroke: String,
    #[serde(default = "default_true")]
    pub monitor: bool,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_engine_process_name")]
    pub engine_process_name: String,
    /// Measurement file name inside the measurement directory; `{case}` is
    /// replaced by the case name.
    #[serde(default = "default_measurement_file")]
    pub measurement_file: String,
}

/// Simulated time window forced into the case definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_duration_secs")]
    pub duration_secs: f64,
    #[serde(default = "default_output_frequency_hz")]
    pub output_frequency_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub metric: Metric,
    #[serde(default = "default_delay_steps")]
    pub delay_steps: usize,
    #[serde(default = "default_reference_depth_mm")]
    pub reference_depth_mm: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_init_points")]
    pub init_points: usize,
    #[serde(default = "default_n_iter")]
    pub n_iter: usize,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_kappa")]
    pub kappa: f64,
    #[serde(default = "default_kappa_decay")]
    pub kappa_decay: f64,
    #[serde(default)]
    pub kappa_decay_delay: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_true")]
    pub normalize_y: bool,
    #[serde(default = "default_length_scale")]
    pub length_scale: f64,
    #[serde(default = "default_nu")]
    pub nu: f64,
    #[serde(default = "default_random_state")]
    pub random_state: u64,
    #[serde(default = "default_acquisition_samples")]
    pub acquisition_samples: usize,
}

fn default_cases_dir() -> PathBuf {
    PathBuf::from("Cases")
}
fn default_contracts_dir() -> PathBuf {
    PathBuf::from("HyperParameters")
}
fn default_logs_dir() -> PathBuf {
    PathBuf::from("Logs")
}
fn default_measurements_dir() -> PathBuf {
    PathBuf::from("Measurements")
}
fn default_reference_dir() -> PathBuf {
    PathBuf::from("Real_Data")
}
fn default_true() -> bool {
    true
}
fn default_handshake_delay_secs() -> u64 {
    5
}
fn default_overwrite_confirmation() -> String {
    "1".to_string()
}
fn default_exit_keystroke() -> String {
    "A".to_string()
}
fn default_monitor_interval_secs() -> u64 {
    10
}
fn default_engine_process_name() -> String {
    "DualSPHysics".to_string()
}
fn default_measurement_file() -> String {
    "{case}_Vel.csv".to_string()
}
fn default_duration_secs() -> f64 {
    15.0
}
fn default_output_frequency_hz() -> f64 {
    120.0
}
fn default_delay_steps() -> usize {
    600
}
fn default_reference_depth_mm() -> u32 {
    1000
}
fn default_init_points() -> usize {
    1
}
fn default_n_iter() -> usize {
    1
}
fn default_retry_budget() -> u32 {
    crate::models::DEFAULT_RETRY_BUDGET
}
fn default_kappa() -> f64 {
    2.576
}
fn default_kappa_decay() -> f64 {
    1.0
}
fn default_alpha() -> f64 {
    1e-3
}
fn default_length_scale() -> f64 {
    0.25
}
fn default_nu() -> f64 {
    2.5
}
fn default_random_state() -> u64 {
    1
}
fn default_acquisition_samples() -> usize {
    2000
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cases_dir: default_cases_dir(),
            contracts_dir: default_contracts_dir(),
            logs_dir: default_logs_dir(),
            measurements_dir: default_measurements_dir(),
            reference_dir: default_reference_dir(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            launcher: Vec::new(),
            export_extra_artifacts: false,
            handshake_delay_secs: default_handshake_delay_secs(),
            overwrite_confirmation: default_overwrite_confirmation(),
            exit_keystroke: default_exit_keystroke(),
            monitor: true,
            monitor_interval_secs: default_monitor_interval_secs(),
            engine_process_name: default_engine_process_name(),
            measurement_file: default_measurement_file(),
        }
    }
}

impl SimulationConfig {
    pub fn measurement_file_for(&self, case_name: &str) -> String {
        self.measurement_file.replace("{case}", case_name)
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_duration_secs(),
            output_frequency_hz: default_output_frequency_hz(),
        }
    }
}

impl WindowConfig {
    /// Output interval written as `TimeOut`, rounded to 15 decimals.
    pub fn output_interval_secs(&self) -> f64 {
        let scale = 1e15;
        ((1.0 / self.output_frequency_hz) * scale).round() / scale
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            metric: Metric::default(),
            delay_steps: default_delay_steps(),
            reference_depth_mm: default_reference_depth_mm(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            init_points: default_init_points(),
            n_iter: default_n_iter(),
            retry_budget: default_retry_budget(),
            kappa: default_kappa(),
            kappa_decay: default_kappa_decay(),
            kappa_decay_delay: 0,
            alpha: default_alpha(),
            normalize_y: true,
            length_scale: default_length_scale(),
            nu: default_nu(),
            random_state: default_random_state(),
            acquisition_samples: default_acquisition_samples(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn parse_flag(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    !matches!(v.as_str(), "0" | "false" | "no" | "off")
}

impl Settings {
    /// Load settings from `path` (defaults when absent or missing), apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> CalResult<Self> {
        let mut settings = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)?;
                let parsed: Settings = toml::from_str(&content)?;
                tracing::debug!(path = %p.display(), "loaded settings file");
                parsed
            }
            Some(p) => {
                tracing::warn!(path = %p.display(), "settings file not found, using defaults");
                Settings::default()
            }
            None => Settings::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `SPHCAL_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> CalResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("SPHCAL_PLATFORM") {
            self.simulation.platform = raw.parse()?;
        }
        if let Some(raw) = lookup("SPHCAL_MONITOR") {
            self.simulation.monitor = parse_flag(&raw);
        }
        if let Some(raw) = lookup("SPHCAL_LOGS_DIR") {
            self.paths.logs_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("SPHCAL_RETRY_BUDGET") {
            self.optimizer.retry_budget = raw.trim().parse().map_err(|_| {
                CalibrationError::Config(format!("SPHCAL_RETRY_BUDGET is not a count: {raw:?}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> CalResult<()> {
        let window = &self.window;
        if !(window.duration_secs > 0.0) {
            return Err(CalibrationError::Config(format!(
                "window.duration_secs must be positive, got {}",
                window.duration_secs
            )));
        }
        if !(window.output_frequency_hz > 0.0) {
            return Err(CalibrationError::Config(format!(
                "window.output_frequency_hz must be positive, got {}",
                window.output_frequency_hz
            )));
        }
        let delay_secs = self.scoring.delay_steps as f64 / window.output_frequency_hz;
        if delay_secs > window.duration_secs {
            return Err(CalibrationError::Config(format!(
                "scoring delay of {} steps ({delay_secs}s) exceeds the {}s simulation window",
                self.scoring.delay_steps, window.duration_secs
            )));
        }
        if !SUPPORTED_NU.contains(&self.optimizer.nu) {
            return Err(CalibrationError::Config(format!(
                "optimizer.nu must be one of {SUPPORTED_NU:?}, got {}",
                self.optimizer.nu
            )));
        }
        if !(self.optimizer.alpha >= 0.0) || !(self.optimizer.length_scale > 0.0) {
            return Err(CalibrationError::Config(
                "optimizer.alpha must be non-negative and optimizer.length_scale positive"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
