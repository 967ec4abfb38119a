//! Feature vocabulary and feature vectors.
//!
//! The vocabulary is the single contract between the external feature
//! extractor and detection-rule authors: a versioned, explicit list of named
//! features with a declared type and bounded range. A [`FeatureVector`] holds
//! one slot per declared feature. Slots are either set to a conforming value
//! or explicitly unset; there are no implicit defaults.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StratumError};

/// Version of the standard vocabulary shipped with this crate.
pub const STANDARD_VOCABULARY_VERSION: u32 = 1;

/// Declared type of a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureType {
    /// One of a fixed set of string values.
    Enum { values: Vec<String> },
    /// Integer in an inclusive range.
    Int { min: i64, max: i64 },
    /// Float in an inclusive range.
    Float { min: f64, max: f64 },
    /// Boolean flag.
    Bool,
}

impl FeatureType {
    /// Whether ordering operators (`>=`, `<`, ...) make sense for this type.
    pub fn is_ordered(&self) -> bool {
        matches!(self, FeatureType::Int { .. } | FeatureType::Float { .. })
    }

    /// Check that a value conforms to this type.
    ///
    /// Returns a human-readable reason on mismatch.
    pub fn check(&self, value: &FeatureValue) -> std::result::Result<(), String> {
        match (self, value) {
            (FeatureType::Enum { values }, FeatureValue::Text(s)) => {
                if values.iter().any(|v| v == s) {
                    Ok(())
                } else {
                    Err(format!("'{}' is not one of {:?}", s, values))
                }
            }
            (FeatureType::Int { min, max }, FeatureValue::Int(n)) => {
                if (*min..=*max).contains(n) {
                    Ok(())
                } else {
                    Err(format!("{} is outside [{}, {}]", n, min, max))
                }
            }
            (FeatureType::Float { min, max }, v @ (FeatureValue::Int(_) | FeatureValue::Float(_))) => {
                let x = v.as_f64().unwrap_or(f64::NAN);
                if x.is_finite() && x >= *min && x <= *max {
                    Ok(())
                } else {
                    Err(format!("{} is outside [{}, {}]", x, min, max))
                }
            }
            (FeatureType::Bool, FeatureValue::Bool(_)) => Ok(()),
            (expected, got) => Err(format!(
                "expected {} value, got {}",
                expected.kind_name(),
                got.kind_name()
            )),
        }
    }

    /// Short name of the type for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            FeatureType::Enum { .. } => "enum",
            FeatureType::Int { .. } => "int",
            FeatureType::Float { .. } => "float",
            FeatureType::Bool => "bool",
        }
    }
}

/// A concrete feature value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FeatureValue {
    /// Numeric view of the value, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Int(n) => Some(*n as f64),
            FeatureValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// Short name of the value's kind for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            FeatureValue::Bool(_) => "bool",
            FeatureValue::Int(_) => "int",
            FeatureValue::Float(_) => "float",
            FeatureValue::Text(_) => "string",
        }
    }

    /// Equality that treats `Int(3)` and `Float(3.0)` as equal.
    pub fn loosely_equals(&self, other: &FeatureValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self {
        FeatureValue::Bool(v)
    }
}

impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self {
        FeatureValue::Int(v)
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Float(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::Text(v.to_string())
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Bool(b) => write!(f, "{}", b),
            FeatureValue::Int(n) => write!(f, "{}", n),
            FeatureValue::Float(x) => write!(f, "{}", x),
            FeatureValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Versioned list of named, typed features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVocabulary {
    /// Vocabulary version. Bumped whenever a feature is added.
    pub version: u32,
    /// Declared features by name.
    pub features: BTreeMap<String, FeatureType>,
}

impl FeatureVocabulary {
    /// Create an empty vocabulary with the given version.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            features: BTreeMap::new(),
        }
    }

    /// Declare a feature. Returns self for chaining.
    pub fn with_feature(mut self, name: impl Into<String>, ty: FeatureType) -> Self {
        self.features.insert(name.into(), ty);
        self
    }

    /// The standard query-structure vocabulary.
    pub fn standard() -> Self {
        fn enumeration(values: &[&str]) -> FeatureType {
            FeatureType::Enum {
                values: values.iter().map(|v| v.to_string()).collect(),
            }
        }
        fn int(min: i64, max: i64) -> FeatureType {
            FeatureType::Int { min, max }
        }

        Self::new(STANDARD_VOCABULARY_VERSION)
            .with_feature("join_style", enumeration(&["explicit", "implicit_comma", "mixed"]))
            .with_feature("table_count", int(0, 256))
            .with_feature("dimension_table_count", int(0, 256))
            .with_feature("fact_table_count", int(0, 64))
            .with_feature("where_filters_on_dimension_tables", int(0, 256))
            .with_feature("is_star_schema", FeatureType::Bool)
            .with_feature(
                "archetype",
                enumeration(&[
                    "star_join",
                    "snowflake",
                    "aggregation",
                    "window_analytics",
                    "correlated_subquery",
                    "set_operation",
                    "point_lookup",
                    "etl",
                    "other",
                ]),
            )
            .with_feature("cte_count", int(0, 64))
            .with_feature("has_recursive_cte", FeatureType::Bool)
            .with_feature("subquery_depth", int(0, 32))
            .with_feature("has_correlated_subquery", FeatureType::Bool)
            .with_feature("has_exists", FeatureType::Bool)
            .with_feature("has_window_functions", FeatureType::Bool)
            .with_feature("has_group_by", FeatureType::Bool)
            .with_feature("aggregate_count", int(0, 256))
            .with_feature("has_having", FeatureType::Bool)
            .with_feature("has_distinct", FeatureType::Bool)
            .with_feature("has_union", FeatureType::Bool)
            .with_feature("has_order_by", FeatureType::Bool)
            .with_feature("has_limit", FeatureType::Bool)
            .with_feature("or_predicate_count", int(0, 1024))
            .with_feature("in_list_max_size", int(0, 100_000))
            .with_feature("self_join_count", int(0, 64))
            .with_feature("has_like_prefix", FeatureType::Bool)
            .with_feature(
                "estimated_selectivity",
                FeatureType::Float { min: 0.0, max: 1.0 },
            )
    }

    /// Number of declared features.
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether the vocabulary declares no features.
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Check whether a feature is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.features.contains_key(name)
    }

    /// Get the declared type of a feature.
    pub fn feature_type(&self, name: &str) -> Option<&FeatureType> {
        self.features.get(name)
    }

    /// Start building a vector with every declared slot unset.
    pub fn builder(&self) -> FeatureVectorBuilder<'_> {
        FeatureVectorBuilder {
            vocabulary: self,
            values: self.features.keys().map(|k| (k.clone(), None)).collect(),
        }
    }

    /// Bring an externally produced vector into conformance.
    ///
    /// Unknown names and type mismatches are rejected. Declared features the
    /// vector does not mention become explicit unset slots.
    pub fn normalize(&self, vector: &FeatureVector) -> Result<FeatureVector> {
        let mut builder = self.builder();
        for (name, value) in &vector.values {
            match value {
                Some(v) => builder = builder.set(name, v.clone())?,
                None => {
                    if !self.contains(name) {
                        return Err(StratumError::vocabulary(format!(
                            "unknown feature '{}'",
                            name
                        )));
                    }
                }
            }
        }
        Ok(builder.build())
    }
}

/// Builder for a [`FeatureVector`] that checks every value against the vocabulary.
#[derive(Debug)]
pub struct FeatureVectorBuilder<'a> {
    vocabulary: &'a FeatureVocabulary,
    values: BTreeMap<String, Option<FeatureValue>>,
}

impl FeatureVectorBuilder<'_> {
    /// Set a feature value.
    pub fn set(mut self, name: &str, value: impl Into<FeatureValue>) -> Result<Self> {
        let value = value.into();
        let ty = self
            .vocabulary
            .feature_type(name)
            .ok_or_else(|| StratumError::vocabulary(format!("unknown feature '{}'", name)))?;
        ty.check(&value)
            .map_err(|reason| StratumError::vocabulary(format!("feature '{}': {}", name, reason)))?;
        self.values.insert(name.to_string(), Some(value));
        Ok(self)
    }

    /// Finish the vector.
    pub fn build(self) -> FeatureVector {
        FeatureVector {
            values: self.values,
        }
    }
}

/// Fixed-arity map from feature name to value or explicit unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    values: BTreeMap<String, Option<FeatureValue>>,
}

impl FeatureVector {
    /// Get a set value. Unset and unknown features both return `None`.
    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values.get(name).and_then(|v| v.as_ref())
    }

    /// Whether the vector has a slot for this name.
    pub fn has_slot(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Get a numeric value.
    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FeatureValue::as_f64)
    }

    /// Get a string value.
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(FeatureValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Get a boolean value.
    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(FeatureValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Number of slots (set or unset).
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the vector has no slots.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of slots holding a value.
    pub fn set_count(&self) -> usize {
        self.values.values().filter(|v| v.is_some()).count()
    }
}
