//! Reduces one simulation run to the scalar objective the optimizer maximises.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{CalResult, CalibrationError};
use crate::models::{AlignedSample, Probe};
use crate::scoring::measurements::MeasurementTable;
use crate::scoring::reference::{ReferenceDataset, ReferenceSeries};

/// Distance between a simulated series and its reference window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Mean absolute difference.
    Mad,
    /// Mean squared error.
    #[default]
    Mse,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::Mad => "mad",
            Metric::Mse => "mse",
        }
    }

    /// Mean pointwise distance. Both sides must have the same length.
    pub fn distance(self, simulated: &[f64], real: &[f64]) -> f64 {
        if simulated.is_empty() {
            return 0.0;
        }
        let total: f64 = simulated
            .iter()
            .zip(real)
            .map(|(s, r)| match self {
                Metric::Mad => (s - r).abs(),
                Metric::Mse => (s - r).powi(2),
            })
            .sum();
        total / simulated.len() as f64
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mad" => Ok(Metric::Mad),
            "mse" => Ok(Metric::Mse),
            other => Err(CalibrationError::Config(format!(
                "unknown metric '{other}' (expected 'mad' or 'mse')"
            ))),
        }
    }
}

/// Reference indices compared against a simulated segment of
/// `sample_count` samples in evaluation `batch`.
///
/// The reference holds `reference_len / sample_count` whole windows; batch
/// `k` uses window `k mod W`, taken as a circular shift of the series by
/// `sample_count * (k mod W)` samples (sample `i` of the window is reference
/// sample `(i - shift) mod reference_len`). Trailing samples that do not
/// fill a window are never compared.
pub fn reference_window(reference_len: usize, sample_count: usize, batch: u64) -> CalResult<Vec<usize>> {
    if sample_count == 0 || sample_count > reference_len {
        return Err(CalibrationError::Reference(format!(
            "cannot take a {sample_count}-sample window from {reference_len} reference samples"
        )));
    }
    let windows = (reference_len / sample_count) as u64;
    let shift = sample_count * (batch % windows) as usize;
    Ok((0..sample_count)
        .map(|i| (i + reference_len - shift) % reference_len)
        .collect())
}

/// Simulated samples for one probe paired with their reference window.
struct ProbeWindow {
    simulated: Vec<f64>,
    reference: Arc<ReferenceSeries>,
    indices: Vec<usize>,
}

impl ProbeWindow {
    fn real(&self) -> Vec<f64> {
        self.indices.iter().map(|&i| self.reference.velocity[i]).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ScoringEngine {
    dataset: Arc<ReferenceDataset>,
}

impl ScoringEngine {
    pub fn new(dataset: Arc<ReferenceDataset>) -> Self {
        Self { dataset }
    }

    pub fn with_reference_dir(dir: impl Into<PathBuf>, depth_mm: u32) -> Self {
        Self::new(Arc::new(ReferenceDataset::new(dir, depth_mm)))
    }

    pub fn dataset(&self) -> &ReferenceDataset {
        &self.dataset
    }

    /// `1 / mean(per-probe distance)`. A perfect match yields `f64::INFINITY`.
    pub fn score(
        &self,
        table: &MeasurementTable,
        probes: &[Probe],
        metric: Metric,
        delay: usize,
        batch: u64,
    ) -> CalResult<f64> {
        if probes.is_empty() {
            return Err(CalibrationError::MeasurementParse(
                "measurement output declares no probes".into(),
            ));
        }
        let distances = probes
            .par_iter()
            .map(|probe| {
                let window = self.probe_window(table, probe, delay, batch)?;
                if let Some(pos) = window.simulated.iter().position(|v| !v.is_finite()) {
                    return Err(CalibrationError::MeasurementParse(format!(
                        "probe {} has a non-numeric sample at step {}",
                        probe.index,
                        delay + pos
                    )));
                }
                Ok(metric.distance(&window.simulated, &window.real()))
            })
            .collect::<CalResult<Vec<f64>>>()?;

        objective_from_distances(&distances, metric, batch)
    }

    /// Score the measurement file at `path` against all of its probes.
    pub fn score_file(&self, path: &Path, metric: Metric, delay: usize, batch: u64) -> CalResult<f64> {
        let table = MeasurementTable::load(path)?;
        self.score(&table, &table.probes, metric, delay, batch)
    }

    /// Every compared sample, probe by probe, stamped with the reference
    /// time. Non-numeric simulated samples are passed through as NaN.
    pub fn aligned(
        &self,
        table: &MeasurementTable,
        probes: &[Probe],
        delay: usize,
        batch: u64,
    ) -> CalResult<Vec<AlignedSample>> {
        let mut samples = Vec::new();
        for probe in probes {
            let window = self.probe_window(table, probe, delay, batch)?;
            samples.extend(window.simulated.iter().zip(&window.indices).map(|(&simulated, &i)| {
                AlignedSample {
                    probe: *probe,
                    time: window.reference.time[i],
                    simulated,
                    real: window.reference.velocity[i],
                }
            }));
        }
        Ok(samples)
    }

    fn probe_window(
        &self,
        table: &MeasurementTable,
        probe: &Probe,
        delay: usize,
        batch: u64,
    ) -> CalResult<ProbeWindow> {
        let series = table.velocity_x(probe.index)?;
        let simulated = series.get(delay..).map(<[f64]>::to_vec).unwrap_or_default();
        if simulated.is_empty() {
            return Err(CalibrationError::MeasurementParse(format!(
                "probe {} has no samples left after skipping {delay} steps",
                probe.index
            )));
        }
        let reference = self.dataset.for_probe(probe)?;
        let indices = reference_window(reference.len(), simulated.len(), batch)?;
        Ok(ProbeWindow {
            simulated,
            reference,
            indices,
        })
    }
}

/// Mean of the per-probe distances, inverted. A NaN or negative-infinite
/// mean is a parse failure rather than an objective.
fn objective_from_distances(distances: &[f64], metric: Metric, batch: u64) -> CalResult<f64> {
    let average = distances.iter().sum::<f64>() / distances.len() as f64;
    if average.is_nan() || average == f64::NEG_INFINITY {
        return Err(CalibrationError::MeasurementParse(format!(
            "{metric} distance is not a number for batch {batch}"
        )));
    }
    if average == 0.0 {
        warn!(metric = %metric, batch, "simulated series match the reference exactly");
        return Ok(f64::INFINITY);
    }
    let target = 1.0 / average;
    debug!(metric = %metric, batch, average, target, "scored measurement output");
    Ok(target)
}
