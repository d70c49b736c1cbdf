//! Engine measurement output.
//!
//! Semicolon-delimited; the first row carries the probe coordinates as a
//! flat `x;y;z;x;y;z;...` list after two label fields, the second row is the
//! column header, and every further row is one simulated time step:
//!
//! ```text
//! Pos;;4.0;0.0;0.5;6.0;0.0;1.0
//! Part;Time [s];Vel_0.x [m/s];Vel_0.y [m/s];Vel_0.z [m/s];Vel_1.x [m/s];...
//! 0;0.0;0.12;0.0;0.01;0.31;...
//! ```

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::errors::{CalResult, CalibrationError};
use crate::models::Probe;

/// Fields before the coordinate list in the first row.
const COORDINATE_OFFSET: usize = 2;
/// Position of the simulated time column in the header.
const TIME_COLUMN: usize = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementTable {
    pub probes: Vec<Probe>,
    pub columns: Vec<String>,
    /// Row-major samples; blank or non-numeric cells are NaN.
    rows: Vec<Vec<f64>>,
}

impl MeasurementTable {
    pub fn load(path: &Path) -> CalResult<Self> {
        let file = File::open(path)?;
        Self::parse(file).map_err(|e| match e {
            CalibrationError::MeasurementParse(msg) => {
                CalibrationError::MeasurementParse(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn parse<R: Read>(reader: R) -> CalResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);
        let mut records = reader.records();

        let coordinates = records
            .next()
            .ok_or_else(|| CalibrationError::MeasurementParse("empty measurement file".into()))??;
        let flat: Vec<f64> = coordinates
            .iter()
            .skip(COORDINATE_OFFSET)
            .filter(|field| !field.trim().is_empty())
            .map(|field| {
                field.trim().parse::<f64>().map_err(|_| {
                    CalibrationError::MeasurementParse(format!("probe coordinate '{field}' is not numeric"))
                })
            })
            .collect::<CalResult<_>>()?;
        if flat.len() % 3 != 0 {
            return Err(CalibrationError::MeasurementParse(format!(
                "{} probe coordinates do not form xyz triplets",
                flat.len()
            )));
        }
        let probes = flat
            .chunks_exact(3)
            .enumerate()
            .map(|(i, xyz)| Probe::new(i, xyz[0], xyz[1], xyz[2]))
            .collect();

        let header = records
            .next()
            .ok_or_else(|| CalibrationError::MeasurementParse("missing column header row".into()))??;
        let columns: Vec<String> = header.iter().map(|c| c.trim().to_string()).collect();

        let mut rows = Vec::new();
        for record in records {
            let record = record?;
            let row = (0..columns.len())
                .map(|i| {
                    record
                        .get(i)
                        .and_then(|cell| cell.trim().parse::<f64>().ok())
                        .unwrap_or(f64::NAN)
                })
                .collect();
            rows.push(row);
        }

        Ok(Self { probes, columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, index: usize) -> Vec<f64> {
        self.rows
            .iter()
            .map(|row| row.get(index).copied().unwrap_or(f64::NAN))
            .collect()
    }

    pub fn time(&self) -> Vec<f64> {
        self.column(TIME_COLUMN)
    }

    /// Streamwise (x) velocity of probe `probe_index`, from column
    /// `Vel_<i>.x` (any unit suffix).
    pub fn velocity_x(&self, probe_index: usize) -> CalResult<Vec<f64>> {
        let prefix = format!("Vel_{probe_index}.x");
        let index = self
            .columns
            .iter()
            .position(|c| c == &prefix || c.starts_with(&format!("{prefix} ")))
            .ok_or_else(|| {
                CalibrationError::MeasurementParse(format!("no '{prefix}' column in measurement output"))
            })?;
        Ok(self.column(index))
    }
}

/// Probe coordinates and column names of a measurement file.
pub fn extract_points(path: &Path) -> CalResult<(Vec<Probe>, Vec<String>)> {
    let table = MeasurementTable::load(path)?;
    Ok((table.probes, table.columns))
}
