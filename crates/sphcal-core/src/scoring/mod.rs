pub mod engine;
pub mod measurements;
pub mod reference;

pub use engine::{reference_window, Metric, ScoringEngine};
pub use measurements::{extract_points, MeasurementTable};
pub use reference::{Band, ReferenceDataset, ReferenceSeries};
