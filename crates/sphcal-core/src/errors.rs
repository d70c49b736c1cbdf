//! Error types for the sphcal core library.

use std::path::PathBuf;

/// Top-level error enum for the sphcal core library.
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Length mismatch: parameter set has {expected} entries, vector has {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Not found in parameter set: {0}")]
    NotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Ambiguous key: '{node_id}' index {index} requested but only {matches} node(s) match")]
    AmbiguousKey {
        node_id: String,
        index: usize,
        matches: usize,
    },

    #[error("Attribute '{attribute}' not present on node '{node_id}'")]
    AttributeNotFound { node_id: String, attribute: String },

    #[error("Invalid node path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Simulation failure: {0}")]
    SimulationFailure(String),

    #[error("Expected artifact missing: {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("Measurement parse error: {0}")]
    MeasurementParse(String),

    #[error("Reference data error: {0}")]
    Reference(String),

    #[error("Surrogate error: {0}")]
    Surrogate(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CalibrationError {
    /// Whether the optimization driver may spend a retry on this error.
    ///
    /// Only failures of a single evaluation qualify: the external run crashed,
    /// produced no artifacts, or produced unreadable output. Contract and
    /// document errors indicate configuration drift and are never retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CalibrationError::SimulationFailure(_)
                | CalibrationError::ArtifactMissing(_)
                | CalibrationError::MeasurementParse(_)
        )
    }
}

#[cfg(feature = "python")]
impl From<CalibrationError> for pyo3::PyErr {
    fn from(err: CalibrationError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyIOError, PyKeyError, PyRuntimeError, PyValueError};
        match &err {
            CalibrationError::Io(_) | CalibrationError::ArtifactMissing(_) => {
                PyIOError::new_err(err.to_string())
            }
            CalibrationError::NotFound(_)
            | CalibrationError::NodeNotFound(_)
            | CalibrationError::AttributeNotFound { .. } => PyKeyError::new_err(err.to_string()),
            CalibrationError::SimulationFailure(_)
            | CalibrationError::Surrogate(_)
            | CalibrationError::Sqlite(_) => PyRuntimeError::new_err(err.to_string()),
            _ => PyValueError::new_err(err.to_string()),
        }
    }
}

pub type CalResult<T> = Result<T, CalibrationError>;
