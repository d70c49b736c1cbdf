//! Ordered contract → value container.
//!
//! Insertion order is the encode/decode order for optimizer vectors and must
//! stay fixed for the lifetime of a session.

use indexmap::IndexMap;
use tracing::debug;

use crate::errors::{CalResult, CalibrationError};
use crate::params::contract::ParameterContract;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    values: IndexMap<ParameterContract, f64>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding every contract at its default value.
    pub fn from_defaults<I>(contracts: I) -> Self
    where
        I: IntoIterator<Item = ParameterContract>,
    {
        let mut set = Self::new();
        for contract in contracts {
            let value = contract.default_value();
            set.values.insert(contract, value);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParameterContract, f64)> {
        self.values.iter().map(|(c, v)| (c, *v))
    }

    pub fn contracts(&self) -> impl Iterator<Item = &ParameterContract> {
        self.values.keys()
    }

    /// Value for `contract`, or `None` when no contract with the same
    /// identity is present.
    pub fn get(&self, contract: &ParameterContract) -> Option<f64> {
        self.values.get(contract).copied()
    }

    /// Insert or overwrite. An existing identity keeps its position.
    pub fn append(&mut self, contract: ParameterContract, value: f64) -> CalResult<()> {
        let value = admit(&contract, value)?;
        self.values.insert(contract, value);
        Ok(())
    }

    /// Insert `contract`, bumping its disambiguation index past any identity
    /// already present. Returns the contract as stored.
    pub fn insert_unique(
        &mut self,
        mut contract: ParameterContract,
        value: f64,
    ) -> CalResult<ParameterContract> {
        while self.get(&contract).is_some() {
            let next = contract.index() + 1;
            contract = contract.with_index(next);
        }
        self.append(contract.clone(), value)?;
        Ok(contract)
    }

    /// Positional overwrite in insertion order.
    pub fn set_from_vector(&mut self, vector: &[f64]) -> CalResult<()> {
        if vector.len() != self.values.len() {
            return Err(CalibrationError::LengthMismatch {
                expected: self.values.len(),
                actual: vector.len(),
            });
        }
        let admitted = self
            .values
            .keys()
            .zip(vector)
            .map(|(contract, raw)| admit(contract, *raw))
            .collect::<CalResult<Vec<f64>>>()?;
        for (slot, value) in self.values.values_mut().zip(admitted) {
            *slot = value;
        }
        Ok(())
    }

    /// Update from `serialized contract → value` pairs. Unknown identities
    /// fail with `NotFound` when `strict`, otherwise they are skipped.
    /// Returns the number of values written. Nothing is written on error.
    pub fn set_from_mapping<'a, I>(&mut self, mapping: I, strict: bool) -> CalResult<usize>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut staged = Vec::new();
        for (slug, raw) in mapping {
            let lookup = ParameterContract::deserialize(slug)?;
            match self.values.get_full(&lookup) {
                Some((position, contract, _)) => staged.push((position, admit(contract, raw)?)),
                None if strict => return Err(CalibrationError::NotFound(slug.to_string())),
                None => debug!(contract = %lookup.label(), "skipping unknown contract"),
            }
        }
        let written = staged.len();
        for (position, value) in staged {
            if let Some((_, slot)) = self.values.get_index_mut(position) {
                *slot = value;
            }
        }
        Ok(written)
    }

    /// Search-space declaration: serialized contract → (lower, upper).
    pub fn bounds_export(&self) -> IndexMap<String, (f64, f64)> {
        self.values
            .keys()
            .map(|c| (c.serialize(), c.bounds()))
            .collect()
    }

    pub fn to_vector(&self) -> Vec<f64> {
        self.values.values().copied().collect()
    }

    /// Serialized contract → value, in insertion order.
    pub fn to_mapping(&self) -> IndexMap<String, f64> {
        self.values
            .iter()
            .map(|(c, v)| (c.serialize(), *v))
            .collect()
    }

    /// Concatenate, keeping `self`'s order first; values in `other` win.
    pub fn merged(&self, other: &ParameterSet) -> ParameterSet {
        let mut values = self.values.clone();
        for (contract, value) in &other.values {
            values.insert(contract.clone(), *value);
        }
        ParameterSet { values }
    }
}

/// Cast onto the contract's kind and clamp into its bounds.
fn admit(contract: &ParameterContract, raw: f64) -> CalResult<f64> {
    if raw.is_nan() {
        return Err(CalibrationError::Validation(format!(
            "NaN value for {}",
            contract.label()
        )));
    }
    let (lower, upper) = contract.bounds();
    Ok(contract.cast(raw).clamp(lower, upper))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::kind::ScalarKind;

    fn contract(node: &str, default: f64, kind: ScalarKind, lo: f64, hi: f64) -> ParameterContract {
        ParameterContract::new(node, "value", default, kind)
            .unwrap()
            .with_bounds(lo, hi)
            .unwrap()
    }

    fn sample_set() -> ParameterSet {
        ParameterSet::from_defaults([
            contract("./a", 1.0, ScalarKind::Float64, 0.0, 2.0),
            contract("./b", 5.0, ScalarKind::Int32, 0.0, 10.0),
            contract("./c", 0.0, ScalarKind::Bool, 0.0, 1.0),
        ])
    }

    #[test]
    fn test_set_from_vector_is_positional() {
        let mut set = sample_set();
        set.set_from_vector(&[1.5, 7.4, 0.8]).unwrap();
        assert_eq!(set.to_vector(), vec![1.5, 7.0, 1.0]);
    }

    #[test]
    fn test_set_from_vector_length_mismatch() {
        let mut set = sample_set();
        let err = set.set_from_vector(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::LengthMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert_eq!(set.to_vector(), vec![1.0, 5.0, 0.0]);
    }

    #[test]
    fn test_midpoints_of_exported_bounds_always_apply() {
        let mut set = ParameterSet::new();
        for (i, kind) in ScalarKind::ALL.into_iter().enumerate() {
            let c = ParameterContract::new(format!("./k{i}"), "v", 0.0, kind).unwrap();
            set.append(c, 0.0).unwrap();
        }
        set.append(contract("./n", 1.0, ScalarKind::Int8, -3.0, 4.0), 1.0)
            .unwrap();
        let midpoints: Vec<f64> = set
            .bounds_export()
            .values()
            .map(|(lo, hi)| lo / 2.0 + hi / 2.0)
            .collect();
        set.set_from_vector(&midpoints).unwrap();
        for (contract, value) in set.iter() {
            let (lo, hi) = contract.bounds();
            assert!(lo <= value && value <= hi, "{}", contract.label());
        }
    }

    #[test]
    fn test_rejected_update_leaves_set_untouched() {
        let mut set = sample_set();
        let err = set.set_from_vector(&[1.5, 7.0, f64::NAN]).unwrap_err();
        assert!(matches!(err, CalibrationError::Validation(_)));
        assert_eq!(set.to_vector(), vec![1.0, 5.0, 0.0]);

        let a = contract("./a", 1.0, ScalarKind::Float64, 0.0, 2.0).serialize();
        let c = contract("./c", 0.0, ScalarKind::Bool, 0.0, 1.0).serialize();
        let err = set
            .set_from_mapping([(a.as_str(), 0.5), (c.as_str(), f64::NAN)], true)
            .unwrap_err();
        assert!(matches!(err, CalibrationError::Validation(_)));
        assert_eq!(set.to_vector(), vec![1.0, 5.0, 0.0]);

        let unknown = contract("./zzz", 1.0, ScalarKind::Float64, 0.0, 2.0).serialize();
        assert!(set
            .set_from_mapping([(a.as_str(), 0.5), (unknown.as_str(), 1.0)], true)
            .is_err());
        assert_eq!(set.to_vector(), vec![1.0, 5.0, 0.0]);
    }

    #[test]
    fn test_set_from_mapping_strict_and_lenient() {
        let mut set = sample_set();
        let known = contract("./b", 5.0, ScalarKind::Int32, 0.0, 10.0).serialize();
        let unknown = contract("./zzz", 1.0, ScalarKind::Float64, 0.0, 2.0).serialize();

        let err = set
            .set_from_mapping([(known.as_str(), 3.0), (unknown.as_str(), 1.0)], true)
            .unwrap_err();
        assert!(matches!(err, CalibrationError::NotFound(_)));

        let written = set
            .set_from_mapping([(known.as_str(), 9.0), (unknown.as_str(), 1.0)], false)
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(set.to_vector(), vec![1.0, 9.0, 0.0]);
    }

    #[test]
    fn test_mapping_round_trip_through_slugs() {
        let mut set = sample_set();
        set.set_from_vector(&[0.25, 3.0, 1.0]).unwrap();
        let mapping = set.to_mapping();
        let mut fresh = sample_set();
        fresh
            .set_from_mapping(mapping.iter().map(|(k, v)| (k.as_str(), *v)), true)
            .unwrap();
        assert_eq!(fresh.to_vector(), set.to_vector());
    }

    #[test]
    fn test_get_and_insert_unique() {
        let mut set = ParameterSet::new();
        let base = contract("./p", 1.0, ScalarKind::Float32, 0.0, 2.0);
        assert_eq!(set.get(&base), None);
        let first = set.insert_unique(base.clone(), 1.0).unwrap();
        let second = set.insert_unique(base.clone(), 1.5).unwrap();
        let third = set.insert_unique(base, 0.5).unwrap();
        assert_eq!((first.index(), second.index(), third.index()), (0, 1, 2));
        assert_eq!(set.get(&second), Some(1.5));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_bounds_export_order() {
        let set = sample_set();
        let exported = set.bounds_export();
        let keys: Vec<_> = exported.keys().map(|k| k.split("::").next().unwrap()).collect();
        assert_eq!(keys, vec!["./a", "./b", "./c"]);
        assert_eq!(exported.values().nth(1), Some(&(0.0, 10.0)));
    }

    #[test]
    fn test_merged_keeps_order_and_overrides() {
        let set = sample_set();
        let mut extra = ParameterSet::new();
        extra
            .append(contract("./b", 5.0, ScalarKind::Int32, 0.0, 10.0), 2.0)
            .unwrap();
        extra
            .append(contract("./d", 1.0, ScalarKind::Float64, 0.0, 2.0), 1.0)
            .unwrap();
        let merged = set.merged(&extra);
        assert_eq!(merged.to_vector(), vec![1.0, 2.0, 0.0, 1.0]);
    }
}
