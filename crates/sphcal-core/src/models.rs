//! Shared records and constants used across the params, simulation, scoring
//! and optimizer layers.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Value registered with the surrogate in place of a non-finite target.
pub const TARGET_CEILING: f64 = 1e12;

/// Failed evaluations tolerated per session before it is aborted.
pub const DEFAULT_RETRY_BUDGET: u32 = 5;

/// `chrono` format of session ids and run timestamps (`19_10_2026_14h_05m_09s`).
pub const TIMESTAMP_FORMAT: &str = "%d_%m_%Y_%Hh_%Mm_%Ss";

/// Prefix of persisted contract files (`HyperParameter_Contract-<Name>.txt`).
pub const CONTRACT_FILE_PREFIX: &str = "HyperParameter_Contract";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// SHA-256 hex digest of arbitrary bytes.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Local timestamp in [`TIMESTAMP_FORMAT`].
pub fn timestamp_now() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Fixed sampling location in the simulated domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    /// 0-based position in the measurement file's probe list.
    pub index: usize,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Probe {
    pub fn new(index: usize, x: f64, y: f64, z: f64) -> Self {
        Self { index, x, y, z }
    }
}

// ---------------------------------------------------------------------------
// SimulationRunRecord
// ---------------------------------------------------------------------------

/// A run that has been launched but has not completed yet.
///
/// Only [`PendingRun::finish`] produces a [`SimulationRunRecord`], so a
/// record is always fully populated.
#[derive(Debug, Clone)]
pub struct PendingRun {
    document_path: PathBuf,
    case_name: String,
    run_id: String,
    batch_index: u64,
    started_at: DateTime<Local>,
}

impl PendingRun {
    pub fn start(
        document_path: impl Into<PathBuf>,
        case_name: impl Into<String>,
        run_id: impl Into<String>,
        batch_index: u64,
    ) -> Self {
        Self {
            document_path: document_path.into(),
            case_name: case_name.into(),
            run_id: run_id.into(),
            batch_index,
            started_at: Local::now(),
        }
    }

    pub fn case_name(&self) -> &str {
        &self.case_name
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn batch_index(&self) -> u64 {
        self.batch_index
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn finish(
        self,
        duration: Duration,
        artifact_path: PathBuf,
        peak_memory_bytes: Option<u64>,
    ) -> SimulationRunRecord {
        SimulationRunRecord {
            document_path: self.document_path,
            case_name: self.case_name,
            run_id: self.run_id,
            batch_index: self.batch_index,
            started_at: self.started_at,
            duration,
            artifact_path,
            peak_memory_bytes,
        }
    }
}

/// One completed invocation of the external simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRunRecord {
    pub document_path: PathBuf,
    pub case_name: String,
    pub run_id: String,
    pub batch_index: u64,
    pub started_at: DateTime<Local>,
    pub duration: Duration,
    pub artifact_path: PathBuf,
    /// Highest resident memory observed by the resource monitor, if it ran.
    pub peak_memory_bytes: Option<u64>,
}

// ---------------------------------------------------------------------------
// OptimizationLogEntry
// ---------------------------------------------------------------------------

/// One completed objective evaluation, keyed by serialized contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationLogEntry {
    pub seq: u64,
    pub target: f64,
    pub params: IndexMap<String, f64>,
}

// ---------------------------------------------------------------------------
// Scoring / monitoring samples
// ---------------------------------------------------------------------------

/// One simulated sample paired with the reference sample it is compared to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignedSample {
    pub probe: Probe,
    /// Reference time in seconds.
    pub time: f64,
    pub simulated: f64,
    pub real: f64,
}

/// One row of the resource log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub batch: u64,
    pub timestamp: String,
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub virtual_memory_bytes: u64,
    pub run_time_secs: u64,
    pub cpu_frequency_mhz: u64,
    /// First GPU; left empty when no GPU can be queried.
    pub gpu_percent: Option<f32>,
    pub gpu_memory_used_mb: Option<f64>,
    pub gpu_memory_total_mb: Option<f64>,
    pub gpu_temperature_c: Option<f32>,
}
