//! Closed table of scalar kinds a hyperparameter can take.
//!
//! A kind fixes two things for a parameter: its numeric domain (the default
//! bounds) and the cast applied to every value read from a contract file or
//! proposed by the optimizer. Kind names are resolved through [`KIND_TABLE`]
//! only; nothing is evaluated from the serialized text.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KindClass {
    Signed,
    Unsigned,
    Float,
    Boolean,
}

struct KindInfo {
    kind: ScalarKind,
    name: &'static str,
    class: KindClass,
    lower: f64,
    upper: f64,
}

const KIND_TABLE: &[KindInfo] = &[
    KindInfo { kind: ScalarKind::Int8, name: "int8", class: KindClass::Signed, lower: i8::MIN as f64, upper: i8::MAX as f64 },
    KindInfo { kind: ScalarKind::Int16, name: "int16", class: KindClass::Signed, lower: i16::MIN as f64, upper: i16::MAX as f64 },
    KindInfo { kind: ScalarKind::Int32, name: "int32", class: KindClass::Signed, lower: i32::MIN as f64, upper: i32::MAX as f64 },
    KindInfo { kind: ScalarKind::Int64, name: "int64", class: KindClass::Signed, lower: i64::MIN as f64, upper: i64::MAX as f64 },
    KindInfo { kind: ScalarKind::UInt8, name: "uint8", class: KindClass::Unsigned, lower: 0.0, upper: u8::MAX as f64 },
    KindInfo { kind: ScalarKind::UInt16, name: "uint16", class: KindClass::Unsigned, lower: 0.0, upper: u16::MAX as f64 },
    KindInfo { kind: ScalarKind::UInt32, name: "uint32", class: KindClass::Unsigned, lower: 0.0, upper: u32::MAX as f64 },
    KindInfo { kind: ScalarKind::UInt64, name: "uint64", class: KindClass::Unsigned, lower: 0.0, upper: u64::MAX as f64 },
    KindInfo { kind: ScalarKind::Float32, name: "float32", class: KindClass::Float, lower: f32::MIN as f64, upper: f32::MAX as f64 },
    KindInfo { kind: ScalarKind::Float64, name: "float64", class: KindClass::Float, lower: f64::MIN, upper: f64::MAX },
    KindInfo { kind: ScalarKind::Bool, name: "bool", class: KindClass::Boolean, lower: 0.0, upper: 1.0 },
];

/// Accepted spellings that are not canonical table names.
const KIND_ALIASES: &[(&str, ScalarKind)] = &[
    ("bool_", ScalarKind::Bool),
    ("boolean", ScalarKind::Bool),
    ("float", ScalarKind::Float64),
    ("double", ScalarKind::Float64),
    ("single", ScalarKind::Float32),
    ("int", ScalarKind::Int64),
    ("uint", ScalarKind::UInt64),
];

impl ScalarKind {
    pub const ALL: [ScalarKind; 11] = [
        ScalarKind::Int8,
        ScalarKind::Int16,
        ScalarKind::Int32,
        ScalarKind::Int64,
        ScalarKind::UInt8,
        ScalarKind::UInt16,
        ScalarKind::UInt32,
        ScalarKind::UInt64,
        ScalarKind::Float32,
        ScalarKind::Float64,
        ScalarKind::Bool,
    ];

    fn info(self) -> &'static KindInfo {
        // Every variant has exactly one row.
        KIND_TABLE
            .iter()
            .find(|info| info.kind == self)
            .unwrap_or(&KIND_TABLE[KIND_TABLE.len() - 1])
    }

    /// Canonical name, as written into serialized contracts.
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Resolve a kind name. A leading `numpy.`/`np.` module prefix is
    /// tolerated so contract files written by older tooling still load.
    pub fn from_name(name: &str) -> Option<ScalarKind> {
        let trimmed = name.trim();
        let bare = trimmed
            .strip_prefix("numpy.")
            .or_else(|| trimmed.strip_prefix("np."))
            .unwrap_or(trimmed)
            .to_ascii_lowercase();
        KIND_TABLE
            .iter()
            .find(|info| info.name == bare)
            .map(|info| info.kind)
            .or_else(|| {
                KIND_ALIASES
                    .iter()
                    .find(|(alias, _)| *alias == bare)
                    .map(|(_, kind)| *kind)
            })
    }

    /// Full representable domain of the kind.
    pub fn domain(self) -> (f64, f64) {
        let info = self.info();
        (info.lower, info.upper)
    }

    pub fn is_discrete(self) -> bool {
        self.info().class != KindClass::Float
    }

    /// Cast an arbitrary real onto the kind.
    ///
    /// Discrete kinds round to nearest and saturate at the domain; float32
    /// goes through single precision so the stored value is exactly what the
    /// document will receive.
    pub fn cast(self, value: f64) -> f64 {
        let (lower, upper) = self.domain();
        match self.info().class {
            KindClass::Signed | KindClass::Unsigned | KindClass::Boolean => {
                value.round().clamp(lower, upper)
            }
            KindClass::Float => match self {
                ScalarKind::Float32 => value.clamp(lower, upper) as f32 as f64,
                _ => value,
            },
        }
    }

    /// Round or narrow a value onto the kind without saturating, so that
    /// out-of-domain inputs stay detectable.
    pub fn coerce(self, value: f64) -> f64 {
        match self.info().class {
            KindClass::Signed | KindClass::Unsigned | KindClass::Boolean => value.round(),
            KindClass::Float => match self {
                ScalarKind::Float32 => value as f32 as f64,
                _ => value,
            },
        }
    }

    /// Parse a textual value (contract file, document attribute) and cast it.
    pub fn parse(self, text: &str) -> Option<f64> {
        let trimmed = text.trim();
        if self == ScalarKind::Bool {
            match trimmed.to_ascii_lowercase().as_str() {
                "true" => return Some(1.0),
                "false" => return Some(0.0),
                _ => {}
            }
        }
        let parsed: f64 = trimmed.parse().ok()?;
        if parsed.is_nan() {
            return None;
        }
        Some(self.cast(parsed))
    }

    /// Render a value the way it is written into the configuration document.
    pub fn render(self, value: f64) -> String {
        let value = self.cast(value);
        match self.info().class {
            KindClass::Signed => format!("{}", value as i64),
            KindClass::Unsigned => format!("{}", value as u64),
            KindClass::Boolean => if value >= 1.0 { "1" } else { "0" }.to_string(),
            KindClass::Float => {
                let magnitude = value.abs();
                let exponent = magnitude >= 1e16 || (magnitude != 0.0 && magnitude < 1e-6);
                match (self, exponent) {
                    (ScalarKind::Float32, true) => format!("{:e}", value as f32),
                    (ScalarKind::Float32, false) => format!("{}", value as f32),
                    (_, true) => format!("{value:e}"),
                    (_, false) => format!("{value}"),
                }
            }
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_a_row() {
        for kind in ScalarKind::ALL {
            assert_eq!(ScalarKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(KIND_TABLE.len(), ScalarKind::ALL.len());
    }

    #[test]
    fn test_numpy_prefix_and_aliases() {
        assert_eq!(ScalarKind::from_name("numpy.float32"), Some(ScalarKind::Float32));
        assert_eq!(ScalarKind::from_name("np.int8"), Some(ScalarKind::Int8));
        assert_eq!(ScalarKind::from_name("numpy.bool_"), Some(ScalarKind::Bool));
        assert_eq!(ScalarKind::from_name("builtins.eval"), None);
        assert_eq!(ScalarKind::from_name("complex128"), None);
    }

    #[test]
    fn test_domains() {
        assert_eq!(ScalarKind::Int8.domain(), (-128.0, 127.0));
        assert_eq!(ScalarKind::UInt16.domain(), (0.0, 65535.0));
        assert_eq!(ScalarKind::Bool.domain(), (0.0, 1.0));
        assert_eq!(ScalarKind::Float32.domain().1, f32::MAX as f64);
    }

    #[test]
    fn test_cast_discrete_rounds_and_saturates() {
        assert_eq!(ScalarKind::Int8.cast(2.6), 3.0);
        assert_eq!(ScalarKind::Int8.cast(500.0), 127.0);
        assert_eq!(ScalarKind::UInt8.cast(-4.0), 0.0);
        assert_eq!(ScalarKind::Bool.cast(0.49), 0.0);
        assert_eq!(ScalarKind::Bool.cast(0.51), 1.0);
    }

    #[test]
    fn test_render_extremes_parse_back() {
        for kind in ScalarKind::ALL {
            let (lower, upper) = kind.domain();
            assert_eq!(kind.parse(&kind.render(lower)), Some(lower), "{kind}");
            assert_eq!(kind.parse(&kind.render(upper)), Some(upper), "{kind}");
        }
    }

    #[test]
    fn test_coerce_does_not_saturate() {
        assert_eq!(ScalarKind::Int8.coerce(300.4), 300.0);
        assert_eq!(ScalarKind::Bool.coerce(2.0), 2.0);
        assert!(ScalarKind::Float32.coerce(1e39).is_infinite());
    }

    #[test]
    fn test_cast_float32_goes_through_single_precision() {
        let cast = ScalarKind::Float32.cast(0.1);
        assert_eq!(cast, 0.1f32 as f64);
        assert_eq!(ScalarKind::Float64.cast(0.1), 0.1);
    }

    #[test]
    fn test_parse_and_render() {
        assert_eq!(ScalarKind::Bool.parse("True"), Some(1.0));
        assert_eq!(ScalarKind::Int32.parse(" 42 "), Some(42.0));
        assert_eq!(ScalarKind::Float32.parse("abc"), None);
        assert_eq!(ScalarKind::Float32.parse("nan"), None);
        assert_eq!(ScalarKind::Int32.render(7.0), "7");
        assert_eq!(ScalarKind::Bool.render(1.0), "1");
        assert_eq!(ScalarKind::Float32.render(0.1), "0.1");
        assert_eq!(ScalarKind::Float64.render(1.5e-7), "1.5e-7");
        assert_eq!(ScalarKind::Float64.render(f64::MAX), "1.7976931348623157e308");
    }
}
