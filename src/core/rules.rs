//! Detection rules and the predicate evaluator.
//!
//! Rules arrive from the promotion stage as raw JSON ([`RawDetectionRule`]),
//! are validated against the [`FeatureVocabulary`], and only then compiled
//! into a [`DetectionRule`] with typed operators and operands. Evaluation is
//! a pure function over a compiled rule and a [`FeatureVector`]: no I/O, no
//! shared state, no allocation beyond the returned match.
//!
//! Evaluation order:
//! 1. `skip`: if any leaf inside it is true, the rule does not fire.
//! 2. `match`: `ALL` needs every child, `ANY` needs one; nesting is unbounded.
//! 3. `confidence`: `high_when`, then `low_when`, else medium.
//!
//! A leaf whose feature is unset evaluates to false, for every operator.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::features::{FeatureType, FeatureValue, FeatureVector, FeatureVocabulary};

/// Operators accepted in rule leaves, in their wire spelling.
pub const VALID_OPERATORS: &[&str] = &["==", "!=", ">=", "<=", ">", "<", "in"];

// =============================================================================
// Priority and confidence
// =============================================================================

/// Priority of a gap. Batch evaluation sorts by [`Priority::rank`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[serde(alias = "CRITICAL")]
    Critical,
    #[serde(alias = "HIGH")]
    High,
    #[default]
    #[serde(alias = "MEDIUM")]
    Medium,
    #[serde(alias = "LOW")]
    Low,
}

impl Priority {
    /// Sort rank: CRITICAL=0, HIGH=1, MEDIUM=2, LOW=3.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    /// Uppercase display label.
    pub fn label(self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }
}

/// Three-level confidence used for rule matches and outcome validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    #[default]
    Medium,
    Low,
}

// =============================================================================
// Raw (authored) form
// =============================================================================

/// A predicate tree as authored: combinators over leaves with string operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawPredicate {
    All {
        #[serde(rename = "ALL")]
        all: Vec<RawPredicate>,
    },
    Any {
        #[serde(rename = "ANY")]
        any: Vec<RawPredicate>,
    },
    Leaf {
        feature: String,
        op: String,
        value: Value,
    },
}

impl RawPredicate {
    /// Convenience constructor for a leaf.
    pub fn leaf(feature: impl Into<String>, op: impl Into<String>, value: Value) -> Self {
        RawPredicate::Leaf {
            feature: feature.into(),
            op: op.into(),
            value,
        }
    }
}

/// Optional confidence sub-trees as authored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawConfidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_when: Option<RawPredicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_when: Option<RawPredicate>,
}

/// A detection rule as authored by the promotion stage or an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetectionRule {
    /// Gap this rule flags.
    pub gap_id: String,
    /// Priority of the gap.
    #[serde(default)]
    pub priority: Priority,
    /// Tree that must hold for the rule to fire.
    #[serde(rename = "match")]
    pub match_tree: RawPredicate,
    /// Tree whose leaves veto the rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<RawPredicate>,
    /// Confidence refinement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<RawConfidence>,
}

// =============================================================================
// Compiled form
// =============================================================================

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    In,
}

impl Operator {
    /// Parse the wire spelling of an operator.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "==" => Some(Operator::Eq),
            "!=" => Some(Operator::Ne),
            ">=" => Some(Operator::Ge),
            "<=" => Some(Operator::Le),
            ">" => Some(Operator::Gt),
            "<" => Some(Operator::Lt),
            "in" => Some(Operator::In),
            _ => None,
        }
    }

    /// Whether this operator compares by order.
    pub fn is_ordering(self) -> bool {
        matches!(self, Operator::Ge | Operator::Le | Operator::Gt | Operator::Lt)
    }
}

/// Right-hand side of a leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(FeatureValue),
    Set(Vec<FeatureValue>),
}

/// A compiled leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub feature: String,
    pub op: Operator,
    pub operand: Operand,
}

/// A compiled predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Leaf(Leaf),
}

/// Compiled confidence refinement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfidenceRule {
    pub high_when: Option<Predicate>,
    pub low_when: Option<Predicate>,
}

/// A validated, compiled detection rule.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRule {
    pub gap_id: String,
    pub priority: Priority,
    pub match_tree: Predicate,
    pub skip: Option<Predicate>,
    pub confidence: ConfidenceRule,
}

/// Result of a rule firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapMatch {
    pub gap_id: String,
    pub confidence: Confidence,
    pub priority: Priority,
}

// =============================================================================
// Validation
// =============================================================================

/// A single validation problem, tagged with the path to the offending node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleError {
    /// Path such as `match.ALL[2]` or `skip.ANY[0]`.
    pub path: String,
    /// What is wrong at that path.
    pub message: String,
}

impl RuleError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for RuleError {}

/// Validate a raw rule against the vocabulary and compile it.
///
/// All problems are collected; a rule with any error is rejected as a whole.
pub fn validate(
    rule: &RawDetectionRule,
    vocabulary: &FeatureVocabulary,
) -> Result<DetectionRule, Vec<RuleError>> {
    let mut errors = Vec::new();

    if rule.gap_id.trim().is_empty() {
        errors.push(RuleError::new("gap_id", "must not be empty"));
    }

    let match_tree = compile(&rule.match_tree, "match", vocabulary, &mut errors);
    let skip = rule
        .skip
        .as_ref()
        .map(|p| compile(p, "skip", vocabulary, &mut errors));

    let mut confidence = ConfidenceRule::default();
    if let Some(raw) = &rule.confidence {
        confidence.high_when = raw
            .high_when
            .as_ref()
            .map(|p| compile(p, "confidence.high_when", vocabulary, &mut errors));
        confidence.low_when = raw
            .low_when
            .as_ref()
            .map(|p| compile(p, "confidence.low_when", vocabulary, &mut errors));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(DetectionRule {
        gap_id: rule.gap_id.clone(),
        priority: rule.priority,
        match_tree,
        skip,
        confidence,
    })
}

/// Parse and validate a rule from JSON text.
pub fn parse_rule(
    json: &str,
    vocabulary: &FeatureVocabulary,
) -> Result<(RawDetectionRule, DetectionRule), Vec<RuleError>> {
    let raw: RawDetectionRule = serde_json::from_str(json)
        .map_err(|e| vec![RuleError::new("<root>", format!("malformed rule: {}", e))])?;
    let compiled = validate(&raw, vocabulary)?;
    Ok((raw, compiled))
}

fn compile(
    raw: &RawPredicate,
    path: &str,
    vocabulary: &FeatureVocabulary,
    errors: &mut Vec<RuleError>,
) -> Predicate {
    match raw {
        RawPredicate::All { all } => {
            let path = format!("{}.ALL", path);
            Predicate::All(compile_children(all, &path, vocabulary, errors))
        }
        RawPredicate::Any { any } => {
            let path = format!("{}.ANY", path);
            Predicate::Any(compile_children(any, &path, vocabulary, errors))
        }
        RawPredicate::Leaf { feature, op, value } => {
            compile_leaf(feature, op, value, path, vocabulary, errors)
        }
    }
}

fn compile_children(
    children: &[RawPredicate],
    path: &str,
    vocabulary: &FeatureVocabulary,
    errors: &mut Vec<RuleError>,
) -> Vec<Predicate> {
    if children.is_empty() {
        errors.push(RuleError::new(path, "combinator has no children"));
    }
    children
        .iter()
        .enumerate()
        .map(|(i, child)| compile(child, &format!("{}[{}]", path, i), vocabulary, errors))
        .collect()
}

fn compile_leaf(
    feature: &str,
    op: &str,
    value: &Value,
    path: &str,
    vocabulary: &FeatureVocabulary,
    errors: &mut Vec<RuleError>,
) -> Predicate {
    let before = errors.len();

    let ty = vocabulary.feature_type(feature);
    if ty.is_none() {
        errors.push(RuleError::new(
            path,
            format!("unknown feature '{}'", feature),
        ));
    }

    let operator = Operator::parse(op);
    if operator.is_none() {
        errors.push(RuleError::new(
            path,
            format!("unknown operator '{}' (valid: {:?})", op, VALID_OPERATORS),
        ));
    }

    let operand = match (ty, operator) {
        (Some(ty), Some(operator)) => check_operand(feature, ty, operator, value, path, errors),
        _ => None,
    };

    match (operator, operand) {
        (Some(op), Some(operand)) if errors.len() == before => Predicate::Leaf(Leaf {
            feature: feature.to_string(),
            op,
            operand,
        }),
        // Placeholder; the caller discards the tree when errors were recorded.
        _ => Predicate::All(Vec::new()),
    }
}

fn check_operand(
    feature: &str,
    ty: &FeatureType,
    op: Operator,
    value: &Value,
    path: &str,
    errors: &mut Vec<RuleError>,
) -> Option<Operand> {
    if op.is_ordering() && !ty.is_ordered() {
        errors.push(RuleError::new(
            path,
            format!(
                "operator '{}' is not applicable to {} feature '{}'",
                op_label(op),
                ty.kind_name(),
                feature
            ),
        ));
        return None;
    }

    if op == Operator::In {
        let items = match value {
            Value::Array(items) if !items.is_empty() => items,
            _ => {
                errors.push(RuleError::new(
                    path,
                    "operator 'in' requires a non-empty array value",
                ));
                return None;
            }
        };
        let mut set = Vec::with_capacity(items.len());
        for item in items {
            set.push(check_scalar(feature, ty, item, path, errors)?);
        }
        return Some(Operand::Set(set));
    }

    check_scalar(feature, ty, value, path, errors).map(Operand::Value)
}

fn check_scalar(
    feature: &str,
    ty: &FeatureType,
    value: &Value,
    path: &str,
    errors: &mut Vec<RuleError>,
) -> Option<FeatureValue> {
    let converted = match json_to_feature_value(value) {
        Some(v) => v,
        None => {
            errors.push(RuleError::new(
                path,
                format!("value {} is not a scalar", value),
            ));
            return None;
        }
    };
    if let Err(reason) = ty.check(&converted) {
        errors.push(RuleError::new(
            path,
            format!("feature '{}': {}", feature, reason),
        ));
        return None;
    }
    Some(converted)
}

fn json_to_feature_value(value: &Value) -> Option<FeatureValue> {
    match value {
        Value::Bool(b) => Some(FeatureValue::Bool(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(FeatureValue::Int(i)),
            None => n.as_f64().map(FeatureValue::Float),
        },
        Value::String(s) => Some(FeatureValue::Text(s.clone())),
        _ => None,
    }
}

fn op_label(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "==",
        Operator::Ne => "!=",
        Operator::Ge => ">=",
        Operator::Le => "<=",
        Operator::Gt => ">",
        Operator::Lt => "<",
        Operator::In => "in",
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// Evaluate one rule against a feature vector.
pub fn evaluate(rule: &DetectionRule, features: &FeatureVector) -> Option<GapMatch> {
    if let Some(skip) = &rule.skip {
        if any_leaf_holds(skip, features) {
            return None;
        }
    }

    if !holds(&rule.match_tree, features) {
        return None;
    }

    let confidence = if rule
        .confidence
        .high_when
        .as_ref()
        .is_some_and(|p| holds(p, features))
    {
        Confidence::High
    } else if rule
        .confidence
        .low_when
        .as_ref()
        .is_some_and(|p| holds(p, features))
    {
        Confidence::Low
    } else {
        Confidence::Medium
    };

    Some(GapMatch {
        gap_id: rule.gap_id.clone(),
        confidence,
        priority: rule.priority,
    })
}

/// Evaluate every rule and return matches ordered by priority rank.
///
/// The sort is stable, so matches of equal priority keep declaration order.
pub fn evaluate_all(rules: &[DetectionRule], features: &FeatureVector) -> Vec<GapMatch> {
    let mut matches: Vec<GapMatch> = rules
        .iter()
        .filter_map(|rule| evaluate(rule, features))
        .collect();
    matches.sort_by_key(|m| m.priority.rank());
    matches
}

/// Evaluate a predicate tree with `ALL`/`ANY` semantics.
pub fn holds(predicate: &Predicate, features: &FeatureVector) -> bool {
    match predicate {
        Predicate::All(children) => children.iter().all(|c| holds(c, features)),
        Predicate::Any(children) => children.iter().any(|c| holds(c, features)),
        Predicate::Leaf(leaf) => leaf_holds(leaf, features),
    }
}

fn any_leaf_holds(predicate: &Predicate, features: &FeatureVector) -> bool {
    match predicate {
        Predicate::All(children) | Predicate::Any(children) => {
            children.iter().any(|c| any_leaf_holds(c, features))
        }
        Predicate::Leaf(leaf) => leaf_holds(leaf, features),
    }
}

fn leaf_holds(leaf: &Leaf, features: &FeatureVector) -> bool {
    let Some(actual) = features.get(&leaf.feature) else {
        return false;
    };

    match (&leaf.operand, leaf.op) {
        (Operand::Set(set), Operator::In) => set.iter().any(|v| actual.loosely_equals(v)),
        (Operand::Value(expected), Operator::Eq) => actual.loosely_equals(expected),
        (Operand::Value(expected), Operator::Ne) => !actual.loosely_equals(expected),
        (Operand::Value(expected), op) => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => match op {
                Operator::Ge => a >= b,
                Operator::Le => a <= b,
                Operator::Gt => a > b,
                Operator::Lt => a < b,
                _ => false,
            },
            _ => false,
        },
        _ => false,
    }
}
