//! Builds a contract set from a case definition.
//!
//! Every numeric attribute of every element is offered to a
//! [`ContractSelector`], which decides whether it becomes a contract and with
//! which kind. The interactive prompt of a calibration front end is just one
//! selector; the built-ins make discovery scriptable.

use regex::Regex;
use tracing::{debug, info};

use crate::document::tree::{ConfigDocument, Element};
use crate::errors::{CalResult, CalibrationError};
use crate::params::{ParameterContract, ParameterSet, ScalarKind, SecondaryKey};

/// Elements with this tag are addressed through their `key` attribute.
const KEYED_TAG: &str = "parameter";
const KEY_ATTRIBUTE: &str = "key";

/// One numeric attribute found in the document.
#[derive(Debug)]
pub struct Candidate<'a> {
    /// `./a/b/tag` path of the element.
    pub path: &'a str,
    pub element: &'a Element,
    pub attribute: &'a str,
    pub value: &'a str,
    pub secondary_key: Option<SecondaryKey>,
}

impl Candidate<'_> {
    /// Narrowest kind that a bulk recorder would pick for the raw value.
    pub fn inferred_kind(&self) -> ScalarKind {
        infer_kind(self.value)
    }
}

pub trait ContractSelector {
    /// Kind to record the candidate with, or `None` to skip it.
    fn select(&mut self, candidate: &Candidate<'_>) -> Option<ScalarKind>;
}

impl<F> ContractSelector for F
where
    F: FnMut(&Candidate<'_>) -> Option<ScalarKind>,
{
    fn select(&mut self, candidate: &Candidate<'_>) -> Option<ScalarKind> {
        self(candidate)
    }
}

/// Records every numeric attribute with its inferred kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordAll;

impl ContractSelector for RecordAll {
    fn select(&mut self, candidate: &Candidate<'_>) -> Option<ScalarKind> {
        Some(candidate.inferred_kind())
    }
}

/// Records numeric attributes whose element path matches a regex.
#[derive(Debug, Clone)]
pub struct PathFilter {
    pattern: Regex,
}

impl PathFilter {
    pub fn new(pattern: &str) -> CalResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| CalibrationError::Validation(format!("invalid path filter: {e}")))?;
        Ok(Self { pattern })
    }
}

impl ContractSelector for PathFilter {
    fn select(&mut self, candidate: &Candidate<'_>) -> Option<ScalarKind> {
        self.pattern
            .is_match(candidate.path)
            .then(|| candidate.inferred_kind())
    }
}

fn infer_kind(value: &str) -> ScalarKind {
    let trimmed = value.trim();
    if let Ok(int) = trimmed.parse::<i64>() {
        return if i32::try_from(int).is_ok() {
            ScalarKind::Int32
        } else {
            ScalarKind::Int64
        };
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.abs() <= f32::MAX as f64 => ScalarKind::Float32,
        _ => ScalarKind::Float64,
    }
}

fn is_numeric(value: &str) -> bool {
    value.trim().parse::<f64>().map(f64::is_finite).unwrap_or(false)
}

/// Walk `document` depth-first and record the attributes `selector` accepts,
/// each at its current value. Repeated identities get increasing
/// disambiguation indices.
pub fn discover_contracts<S>(document: &ConfigDocument, selector: &mut S) -> CalResult<ParameterSet>
where
    S: ContractSelector + ?Sized,
{
    let mut set = ParameterSet::new();
    let mut failure: Option<CalibrationError> = None;

    document.walk(|path, element| {
        if failure.is_some() {
            return;
        }
        let secondary_key = (element.name == KEYED_TAG)
            .then(|| element.attribute(KEY_ATTRIBUTE))
            .flatten()
            .map(|value| SecondaryKey::new(KEY_ATTRIBUTE, value));

        for (attribute, value) in &element.attributes {
            if secondary_key.is_some() && attribute == KEY_ATTRIBUTE {
                continue;
            }
            if !is_numeric(value) {
                continue;
            }
            let candidate = Candidate {
                path,
                element,
                attribute,
                value,
                secondary_key: secondary_key.clone(),
            };
            let Some(kind) = selector.select(&candidate) else {
                continue;
            };
            let raw: f64 = value.trim().parse().unwrap_or(f64::NAN);
            let recorded = ParameterContract::new(path, attribute.as_str(), raw, kind)
                .and_then(|contract| match candidate.secondary_key.clone() {
                    Some(key) => contract.with_secondary_key(key),
                    None => Ok(contract),
                })
                .and_then(|contract| {
                    let default = contract.default_value();
                    set.insert_unique(contract, default)
                });
            match recorded {
                Ok(contract) => debug!(contract = %contract.label(), "recorded contract"),
                Err(e) => {
                    failure = Some(e);
                    return;
                }
            }
        }
    });

    if let Some(err) = failure {
        return Err(err);
    }
    info!(count = set.len(), "discovered parameter contracts");
    Ok(set)
}
