//! `_sphcal_core` Python extension module.
//!
//! Exposes the inspection side of scoring so plotting scripts can read the
//! same aligned series the optimizer scores.

use std::path::PathBuf;

use pyo3::prelude::*;
use pyo3::types::PyDict;
use pyo3::wrap_pyfunction;

use crate::models::Probe;
use crate::scoring::{MeasurementTable, Metric, ScoringEngine};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Probes from `{index: (x, y, z)}`, or every probe of the table when absent.
fn probes_arg(table: &MeasurementTable, points: Option<&Bound<'_, PyDict>>) -> PyResult<Vec<Probe>> {
    let Some(points) = points else {
        return Ok(table.probes.clone());
    };
    let mut probes = Vec::with_capacity(points.len());
    for (key, value) in points.iter() {
        let index: usize = key.extract()?;
        let (x, y, z): (f64, f64, f64) = value.extract()?;
        probes.push(Probe::new(index, x, y, z));
    }
    probes.sort_by_key(|p| p.index);
    Ok(probes)
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

/// `({index: (x, y, z)}, [column, ...])` of a measurement file.
#[pyfunction]
fn extract_points(py: Python<'_>, path: PathBuf) -> PyResult<(PyObject, Vec<String>)> {
    let (probes, columns) = crate::scoring::extract_points(&path)?;
    let points = PyDict::new(py);
    for probe in probes {
        points.set_item(probe.index, (probe.x, probe.y, probe.z))?;
    }
    Ok((points.into_any().unbind(), columns))
}

/// Column-oriented aligned samples: `Time`, `Vel_X_Sim`, `Vel_X_Real`,
/// `X`, `Y`, `Z`.
#[pyfunction]
#[pyo3(signature = (path, reference_dir, points=None, delay=0, batch=0, depth_mm=1000))]
fn aligned_series(
    py: Python<'_>,
    path: PathBuf,
    reference_dir: PathBuf,
    points: Option<&Bound<'_, PyDict>>,
    delay: usize,
    batch: u64,
    depth_mm: u32,
) -> PyResult<PyObject> {
    let table = MeasurementTable::load(&path)?;
    let probes = probes_arg(&table, points)?;
    let engine = ScoringEngine::with_reference_dir(reference_dir, depth_mm);
    let rows = engine.aligned(&table, &probes, delay, batch)?;

    let data = PyDict::new(py);
    data.set_item("Time", rows.iter().map(|r| r.time).collect::<Vec<_>>())?;
    data.set_item("Vel_X_Sim", rows.iter().map(|r| r.simulated).collect::<Vec<_>>())?;
    data.set_item("Vel_X_Real", rows.iter().map(|r| r.real).collect::<Vec<_>>())?;
    data.set_item("X", rows.iter().map(|r| r.probe.x).collect::<Vec<_>>())?;
    data.set_item("Y", rows.iter().map(|r| r.probe.y).collect::<Vec<_>>())?;
    data.set_item("Z", rows.iter().map(|r| r.probe.z).collect::<Vec<_>>())?;
    Ok(data.into_any().unbind())
}

/// Scalar objective (`1 / mean distance`) of a measurement file.
#[pyfunction]
#[pyo3(signature = (path, reference_dir, method="mse", points=None, delay=0, batch=0, depth_mm=1000))]
#[allow(clippy::too_many_arguments)]
fn score(
    path: PathBuf,
    reference_dir: PathBuf,
    method: &str,
    points: Option<&Bound<'_, PyDict>>,
    delay: usize,
    batch: u64,
    depth_mm: u32,
) -> PyResult<f64> {
    let metric: Metric = method.parse()?;
    let table = MeasurementTable::load(&path)?;
    let probes = probes_arg(&table, points)?;
    let engine = ScoringEngine::with_reference_dir(reference_dir, depth_mm);
    Ok(engine.score(&table, &probes, metric, delay, batch)?)
}

// ---------------------------------------------------------------------------
// Top-level Python module: _sphcal_core
// ---------------------------------------------------------------------------

#[pymodule]
fn _sphcal_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("TARGET_CEILING", crate::models::TARGET_CEILING)?;
    m.add_function(wrap_pyfunction!(extract_points, m)?)?;
    m.add_function(wrap_pyfunction!(aligned_series, m)?)?;
    m.add_function(wrap_pyfunction!(score, m)?)?;
    Ok(())
}
