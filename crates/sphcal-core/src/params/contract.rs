//! `ParameterContract`: where a hyperparameter lives in the case definition
//! and which values it may take.
//!
//! Serialized form (one "slug"), fields joined by `::`:
//!
//! ```text
//! node_id::attribute::index::kind::default::(sec_attr, sec_value)::(lower, upper)
//! ./execution/parameters/parameter::value::0::float32::15::(key, TimeMax)::(0, 100)
//! ```
//!
//! An absent secondary key is written `(None, None)`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{CalResult, CalibrationError};
use crate::params::kind::ScalarKind;

const SLUG_SEPARATOR: &str = "::";
const SLUG_FIELDS: usize = 7;
const NONE_TOKEN: &str = "None";

/// `(a, b)` with optional single or double quotes around each member.
static PAIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\(\s*['"]?([^,'"]*?)['"]?\s*,\s*['"]?(.*?)['"]?\s*\)$"#).unwrap()
});

/// Attribute/value pair an element must carry to be selected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecondaryKey {
    pub attribute: String,
    pub value: String,
}

impl SecondaryKey {
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for SecondaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.attribute, self.value)
    }
}

/// Typed binding from a hyperparameter to one attribute of one document node.
///
/// Identity is `(node_id, attribute, index, secondary_key)`; kind, default
/// and bounds do not take part in equality or hashing.
#[derive(Debug, Clone)]
pub struct ParameterContract {
    node_id: String,
    attribute: String,
    index: usize,
    secondary_key: Option<SecondaryKey>,
    kind: ScalarKind,
    default: f64,
    bounds: (f64, f64),
}

impl ParameterContract {
    /// Contract with the kind's full domain as bounds.
    ///
    /// Fails with `Validation` when the cast default falls outside the
    /// domain or when the node id or attribute is empty.
    pub fn new(
        node_id: impl Into<String>,
        attribute: impl Into<String>,
        default: f64,
        kind: ScalarKind,
    ) -> CalResult<Self> {
        let node_id = node_id.into();
        let attribute = attribute.into();
        if node_id.trim().is_empty() {
            return Err(CalibrationError::Validation("node id must not be empty".into()));
        }
        if attribute.trim().is_empty() {
            return Err(CalibrationError::Validation(format!(
                "attribute must not be empty (node '{node_id}')"
            )));
        }
        let contract = Self {
            node_id,
            attribute,
            index: 0,
            secondary_key: None,
            kind,
            default: kind.cast(default),
            bounds: kind.domain(),
        };
        contract.check_default(default)?;
        Ok(contract)
    }

    /// Select the `index`-th match when the node id matches several nodes.
    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Members must survive the slug round trip: no `::` or `,`, and no
    /// quotes in the attribute.
    pub fn with_secondary_key(mut self, key: SecondaryKey) -> CalResult<Self> {
        let unsafe_attribute = key.attribute.trim().is_empty()
            || key.attribute.contains(['\'', '"']);
        let unsafe_member = |s: &str| s.contains(SLUG_SEPARATOR) || s.contains(',');
        if unsafe_attribute || unsafe_member(&key.attribute) || unsafe_member(&key.value) {
            return Err(CalibrationError::Validation(format!(
                "secondary key {key} cannot be serialized (node '{}')",
                self.node_id
            )));
        }
        self.secondary_key = Some(key);
        Ok(self)
    }

    /// Narrow the bounds. Both ends are cast onto the kind and must lie
    /// inside its domain; the default must remain inside.
    pub fn with_bounds(mut self, lower: f64, upper: f64) -> CalResult<Self> {
        let (domain_lo, domain_hi) = self.kind.domain();
        let lower_cast = self.kind.coerce(lower);
        let upper_cast = self.kind.coerce(upper);
        if lower.is_nan() || upper.is_nan() || lower_cast > upper_cast {
            return Err(CalibrationError::Validation(format!(
                "invalid bounds ({lower}, {upper}) for {}",
                self.node_id
            )));
        }
        if lower_cast < domain_lo || upper_cast > domain_hi {
            return Err(CalibrationError::Validation(format!(
                "bounds ({lower}, {upper}) exceed the {} domain",
                self.kind
            )));
        }
        self.bounds = (lower_cast, upper_cast);
        self.check_default(self.default)?;
        Ok(self)
    }

    fn check_default(&self, raw: f64) -> CalResult<()> {
        let cast = self.kind.coerce(raw);
        let (lower, upper) = self.bounds;
        if raw.is_nan() || !(lower <= cast && cast <= upper) {
            return Err(CalibrationError::Validation(format!(
                "default value ({raw}) is not within bounds ({}, {}) of {}::{}",
                self.kind.render(lower),
                self.kind.render(upper),
                self.node_id,
                self.attribute
            )));
        }
        Ok(())
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn secondary_key(&self) -> Option<&SecondaryKey> {
        self.secondary_key.as_ref()
    }

    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    pub fn default_value(&self) -> f64 {
        self.default
    }

    pub fn bounds(&self) -> (f64, f64) {
        self.bounds
    }

    /// Cast a value onto this contract's kind.
    pub fn cast(&self, value: f64) -> f64 {
        self.kind.cast(value)
    }

    /// Text written into the document for `value`.
    pub fn render(&self, value: f64) -> String {
        self.kind.render(value)
    }

    /// Identity-only label, used in log lines.
    pub fn label(&self) -> String {
        match &self.secondary_key {
            Some(key) => format!("{}[{}={}]@{}", self.node_id, key.attribute, key.value, self.attribute),
            None if self.index > 0 => format!("{}[{}]@{}", self.node_id, self.index, self.attribute),
            None => format!("{}@{}", self.node_id, self.attribute),
        }
    }

    pub fn serialize(&self) -> String {
        let secondary = match &self.secondary_key {
            Some(key) => key.to_string(),
            None => format!("({NONE_TOKEN}, {NONE_TOKEN})"),
        };
        [
            self.node_id.clone(),
            self.attribute.clone(),
            self.index.to_string(),
            self.kind.name().to_string(),
            self.kind.render(self.default),
            secondary,
            format!(
                "({}, {})",
                self.kind.render(self.bounds.0),
                self.kind.render(self.bounds.1)
            ),
        ]
        .join(SLUG_SEPARATOR)
    }

    pub fn deserialize(slug: &str) -> CalResult<Self> {
        let invalid = |reason: &str| {
            CalibrationError::Validation(format!("malformed contract slug '{slug}': {reason}"))
        };
        let parts: Vec<&str> = slug.trim().split(SLUG_SEPARATOR).collect();
        if parts.len() != SLUG_FIELDS {
            return Err(invalid(&format!(
                "expected {SLUG_FIELDS} fields, found {}",
                parts.len()
            )));
        }
        let index: usize = parts[2]
            .trim()
            .parse()
            .map_err(|_| invalid("index is not a non-negative integer"))?;
        let kind = ScalarKind::from_name(parts[3]).ok_or_else(|| invalid("unsupported kind"))?;
        let default = kind
            .parse(parts[4])
            .ok_or_else(|| invalid("default is not numeric"))?;

        let secondary_key = match parse_pair(parts[5]) {
            Some((attr, value)) if attr == NONE_TOKEN && value == NONE_TOKEN => None,
            Some((attr, value)) if !attr.is_empty() => Some(SecondaryKey::new(attr, value)),
            _ => return Err(invalid("secondary key is not a pair")),
        };
        let (lower, upper) = parse_pair(parts[6]).ok_or_else(|| invalid("bounds are not a pair"))?;
        let lower = kind.parse(&lower).ok_or_else(|| invalid("lower bound is not numeric"))?;
        let upper = kind.parse(&upper).ok_or_else(|| invalid("upper bound is not numeric"))?;

        let mut contract = Self::new(parts[0], parts[1], default, kind)?.with_index(index);
        if let Some(key) = secondary_key {
            contract = contract.with_secondary_key(key)?;
        }
        contract.with_bounds(lower, upper)
    }

    fn identity(&self) -> (&str, &str, usize, Option<&SecondaryKey>) {
        (
            &self.node_id,
            &self.attribute,
            self.index,
            self.secondary_key.as_ref(),
        )
    }
}

fn parse_pair(text: &str) -> Option<(String, String)> {
    let caps = PAIR_RE.captures(text.trim())?;
    Some((caps[1].trim().to_string(), caps[2].trim().to_string()))
}

impl PartialEq for ParameterContract {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for ParameterContract {}

impl Hash for ParameterContract {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Display for ParameterContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl FromStr for ParameterContract {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::deserialize(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn time_max() -> ParameterContract {
        ParameterContract::new("./execution/parameters/parameter", "value", 15.0, ScalarKind::Float32)
            .unwrap()
            .with_secondary_key(SecondaryKey::new("key", "TimeMax"))
            .unwrap()
    }

    #[test]
    fn test_construction_checks_default_against_kind() {
        assert!(ParameterContract::new("./a", "v", 127.0, ScalarKind::Int8).is_ok());
        assert!(matches!(
            ParameterContract::new("./a", "v", 300.0, ScalarKind::Int8),
            Err(CalibrationError::Validation(_))
        ));
        assert!(ParameterContract::new("./a", "v", -1.0, ScalarKind::UInt32).is_err());
        assert!(ParameterContract::new("./a", "v", 2.0, ScalarKind::Bool).is_err());
        assert!(ParameterContract::new("./a", "v", f64::NAN, ScalarKind::Float64).is_err());
        assert!(ParameterContract::new("", "v", 1.0, ScalarKind::Float64).is_err());
    }

    #[test]
    fn test_construction_checks_default_against_narrowed_bounds() {
        let base = ParameterContract::new("./a", "v", 5.0, ScalarKind::Int32).unwrap();
        assert!(base.clone().with_bounds(0.0, 10.0).is_ok());
        assert!(base.clone().with_bounds(6.0, 10.0).is_err());
        assert!(base.clone().with_bounds(10.0, 0.0).is_err());
        assert!(base.with_bounds(0.0, 1e12).is_err());
    }

    #[test]
    fn test_default_is_cast() {
        let c = ParameterContract::new("./a", "v", 2.6, ScalarKind::Int16).unwrap();
        assert_eq!(c.default_value(), 3.0);
        assert_eq!(c.bounds(), (-32768.0, 32767.0));
    }

    #[test]
    fn test_equality_ignores_default_and_bounds() {
        let a = ParameterContract::new("./a", "v", 1.0, ScalarKind::Float32).unwrap();
        let b = ParameterContract::new("./a", "v", 2.0, ScalarKind::Float64)
            .unwrap()
            .with_bounds(0.0, 3.0)
            .unwrap();
        assert_eq!(a, b);
        let set: HashSet<_> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_ne!(a.clone(), a.clone().with_index(1));
        assert_ne!(a.clone(), a.with_secondary_key(SecondaryKey::new("key", "x")).unwrap());
    }

    #[test]
    fn test_serialize_format() {
        let c = time_max().with_bounds(0.0, 100.0).unwrap();
        assert_eq!(
            c.serialize(),
            "./execution/parameters/parameter::value::0::float32::15::(key, TimeMax)::(0, 100)"
        );
        let plain = ParameterContract::new("./a/b", "x", 3.0, ScalarKind::Int8).unwrap().with_index(2);
        assert_eq!(plain.serialize(), "./a/b::x::2::int8::3::(None, None)::(-128, 127)");
    }

    #[test]
    fn test_round_trip_preserves_everything() {
        let mut contracts = vec![
            time_max(),
            time_max().with_bounds(1.0, 20.0).unwrap(),
            ParameterContract::new("./a", "v", 0.0, ScalarKind::Bool).unwrap(),
        ];
        for kind in ScalarKind::ALL {
            contracts.push(ParameterContract::new("./k", "v", 1.0, kind).unwrap().with_index(4));
        }
        for contract in contracts {
            let back = ParameterContract::deserialize(&contract.serialize()).unwrap();
            assert_eq!(back, contract);
            assert_eq!(back.kind(), contract.kind());
            assert_eq!(back.default_value(), contract.default_value());
            assert_eq!(back.bounds(), contract.bounds());
        }
    }

    #[test]
    fn test_deserialize_accepts_legacy_spelling() {
        let slug = "./execution/parameters/parameter::value::0::numpy.float32::15.0::('key', 'TimeOut')::(-3.4028235e+38, 3.4028235e+38)";
        let c: ParameterContract = slug.parse().unwrap();
        assert_eq!(c.kind(), ScalarKind::Float32);
        assert_eq!(c.secondary_key(), Some(&SecondaryKey::new("key", "TimeOut")));
        assert_eq!(c.bounds(), ScalarKind::Float32.domain());
    }

    #[test]
    fn test_secondary_key_must_survive_serialization() {
        let base = ParameterContract::new("./execution/parameters/parameter", "value", 1.0, ScalarKind::Float64)
            .unwrap();
        for key in [
            SecondaryKey::new("key", "Time::Max"),
            SecondaryKey::new("key", "a,b"),
            SecondaryKey::new("k,ey", "TimeMax"),
            SecondaryKey::new("'key'", "TimeMax"),
            SecondaryKey::new(" ", "TimeMax"),
        ] {
            assert!(
                matches!(base.clone().with_secondary_key(key.clone()), Err(CalibrationError::Validation(_))),
                "{key}"
            );
        }

        let keyed = base.with_secondary_key(SecondaryKey::new("key", "Visco-2")).unwrap();
        assert_eq!(ParameterContract::deserialize(&keyed.serialize()).unwrap(), keyed);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        for slug in [
            "",
            "./a::v::0::float32::1::(None, None)",
            "./a::v::x::float32::1::(None, None)::(0, 2)",
            "./a::v::0::__import__::1::(None, None)::(0, 2)",
            "./a::v::0::float32::one::(None, None)::(0, 2)",
            "./a::v::0::float32::1::None::(0, 2)",
            "./a::v::0::float32::5::(None, None)::(0, 2)",
        ] {
            assert!(
                matches!(ParameterContract::deserialize(slug), Err(CalibrationError::Validation(_))),
                "{slug}"
            );
        }
    }
}
