//! Real flume measurements used as the calibration target.
//!
//! One whitespace-separated `time velocity` file per (upstream distance,
//! depth band): `Data_Depth<depth>mm_Upstream<loc>m_<Band>.txt`.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{CalResult, CalibrationError};
use crate::models::Probe;

/// Probes below this height (m) compare against the bottom band.
pub const BOTTOM_BAND_CEILING: f64 = 0.8;
/// Probes above this height (m) compare against the top band.
pub const TOP_BAND_FLOOR: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    Bottom,
    Middle,
    Top,
}

impl Band {
    pub fn for_height(z: f64) -> Band {
        if z < BOTTOM_BAND_CEILING {
            Band::Bottom
        } else if z > TOP_BAND_FLOOR {
            Band::Top
        } else {
            Band::Middle
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Band::Bottom => "Bottom",
            Band::Middle => "Middle",
            Band::Top => "Top",
        })
    }
}

/// Identifies one reference file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceKey {
    /// Upstream distance in whole metres (probe x, truncated).
    pub location: i64,
    pub band: Band,
}

impl ReferenceKey {
    pub fn for_probe(probe: &Probe) -> Self {
        Self {
            location: probe.x.trunc() as i64,
            band: Band::for_height(probe.z),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSeries {
    pub time: Vec<f64>,
    pub velocity: Vec<f64>,
}

impl ReferenceSeries {
    pub fn parse(text: &str) -> CalResult<Self> {
        let mut time = Vec::new();
        let mut velocity = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let mut fields = line.split_whitespace();
            let (Some(t), Some(v)) = (fields.next(), fields.next()) else {
                if line.trim().is_empty() {
                    continue;
                }
                return Err(CalibrationError::Reference(format!(
                    "line {}: expected 'time velocity'",
                    line_no + 1
                )));
            };
            let parse = |s: &str| match s.parse::<f64>() {
                Ok(value) if value.is_finite() => Ok(value),
                _ => Err(CalibrationError::Reference(format!(
                    "line {}: '{s}' is not a finite number",
                    line_no + 1
                ))),
            };
            time.push(parse(t)?);
            velocity.push(parse(v)?);
        }
        if velocity.is_empty() {
            return Err(CalibrationError::Reference("reference series is empty".into()));
        }
        Ok(Self { time, velocity })
    }

    pub fn len(&self) -> usize {
        self.velocity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.velocity.is_empty()
    }
}

/// Reference files under one directory. Each file is read once and shared.
#[derive(Debug)]
pub struct ReferenceDataset {
    dir: PathBuf,
    depth_mm: u32,
    cache: Mutex<HashMap<ReferenceKey, Arc<ReferenceSeries>>>,
}

impl ReferenceDataset {
    pub fn new(dir: impl Into<PathBuf>, depth_mm: u32) -> Self {
        Self {
            dir: dir.into(),
            depth_mm,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: ReferenceKey) -> PathBuf {
        self.dir.join(format!(
            "Data_Depth{}mm_Upstream{}m_{}.txt",
            self.depth_mm, key.location, key.band
        ))
    }

    pub fn series(&self, key: ReferenceKey) -> CalResult<Arc<ReferenceSeries>> {
        if let Some(series) = self.cache.lock().get(&key) {
            return Ok(Arc::clone(series));
        }
        let path = self.path_for(key);
        let text = fs::read_to_string(&path).map_err(|e| {
            CalibrationError::Reference(format!("cannot read '{}': {e}", path.display()))
        })?;
        let series = Arc::new(ReferenceSeries::parse(&text).map_err(|e| match e {
            CalibrationError::Reference(msg) => {
                CalibrationError::Reference(format!("{}: {msg}", path.display()))
            }
            other => other,
        })?);
        debug!(path = %path.display(), samples = series.len(), "loaded reference series");
        // Another worker may have loaded the same key meanwhile; keep the first.
        let mut cache = self.cache.lock();
        Ok(Arc::clone(cache.entry(key).or_insert(series)))
    }

    pub fn for_probe(&self, probe: &Probe) -> CalResult<Arc<ReferenceSeries>> {
        self.series(ReferenceKey::for_probe(probe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_thresholds() {
        assert_eq!(Band::for_height(0.79), Band::Bottom);
        assert_eq!(Band::for_height(0.8), Band::Middle);
        assert_eq!(Band::for_height(1.2), Band::Middle);
        assert_eq!(Band::for_height(1.21), Band::Top);
    }

    #[test]
    fn test_key_truncates_location() {
        let key = ReferenceKey::for_probe(&Probe::new(0, 6.9, 0.0, 1.5));
        assert_eq!(key, ReferenceKey { location: 6, band: Band::Top });
    }

    #[test]
    fn test_parse_series() {
        let series = ReferenceSeries::parse("0.0 0.5\n0.1\t0.6\n\n0.2   0.7\n").unwrap();
        assert_eq!(series.velocity, vec![0.5, 0.6, 0.7]);
        assert_eq!(series.time, vec![0.0, 0.1, 0.2]);
        assert!(ReferenceSeries::parse("").is_err());
        assert!(ReferenceSeries::parse("0.0 abc\n").is_err());
        assert!(ReferenceSeries::parse("0.0\n").is_err());
        for bad in ["0.0 nan\n", "0.0 NaN\n", "inf 0.5\n", "0.0 -inf\n"] {
            assert!(matches!(ReferenceSeries::parse(bad), Err(CalibrationError::Reference(_))), "{bad}");
        }
    }

    #[test]
    fn test_dataset_reads_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = ReferenceDataset::new(dir.path(), 1000);
        let key = ReferenceKey { location: 4, band: Band::Bottom };
        assert_eq!(
            dataset.path_for(key),
            dir.path().join("Data_Depth1000mm_Upstream4m_Bottom.txt")
        );
        assert!(matches!(dataset.series(key), Err(CalibrationError::Reference(_))));

        fs::write(dataset.path_for(key), "0 1\n1 2\n").unwrap();
        let first = dataset.series(key).unwrap();
        fs::remove_file(dataset.path_for(key)).unwrap();
        let second = dataset.series(key).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
