//! Derived knowledge: findings, patterns, curated entries and gold examples.
//!
//! Every record lives in an id-indexed arena owned by the layer store and
//! refers to other records by id only. The graph is a DAG of append-mostly
//! records; traversal is indexed lookup.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::features::FeatureVector;
use crate::core::outcome::{Conditions, OutcomeKey, StreamId};
use crate::core::rules::{DetectionRule, Priority, RawDetectionRule};

/// Id prefix for findings.
pub const FINDING_PREFIX: &str = "F";
/// Id prefix for patterns.
pub const PATTERN_PREFIX: &str = "P";
/// Id prefix for knowledge entries.
pub const ENTRY_PREFIX: &str = "K";
/// Id prefix for gold examples.
pub const EXAMPLE_PREFIX: &str = "G";

/// Render an arena id such as `F-000001`.
pub fn format_id(prefix: &str, n: u64) -> String {
    format!("{}-{:06}", prefix, n)
}

/// Monotonic version of committed knowledge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnowledgeVersion(pub u64);

impl KnowledgeVersion {
    pub fn next(self) -> Self {
        KnowledgeVersion(self.0 + 1)
    }
}

impl fmt::Display for KnowledgeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kv-{:08}", self.0)
    }
}

// =============================================================================
// Layer 2: findings
// =============================================================================

/// An extracted, condition-tagged observation over one or more outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub engine: String,
    pub benchmark: String,
    /// Position in the store-wide finding sequence; the L2→L3 cursor.
    pub seq: u64,
    pub outcome_keys: Vec<OutcomeKey>,
    pub query_ids: BTreeSet<String>,
    pub observation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_speedup: Option<f64>,
    pub win: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Finding {
    pub fn stream(&self) -> StreamId {
        StreamId::new(&self.engine, &self.benchmark)
    }

    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none()
    }
}

// =============================================================================
// Layer 3: patterns
// =============================================================================

/// Lifecycle of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatternStatus {
    #[default]
    Candidate,
    Promoted,
    Deprecated,
}

/// A known condition under which a pattern's mechanism backfires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterIndication {
    /// Query shape or condition under which the mechanism regresses.
    pub pattern: String,
    pub reason: String,
    #[serde(default)]
    pub regressed_example_ids: Vec<String>,
}

/// A cross-query aggregate of findings with success statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub engine: String,
    pub benchmark: String,
    /// Mechanism classification; the merge key within a stream.
    pub mechanism: String,
    pub description: String,
    pub finding_ids: Vec<String>,
    pub query_ids: BTreeSet<String>,
    pub observations: u32,
    pub wins: u32,
    pub success_rate: f64,
    #[serde(default)]
    pub counter_indications: Vec<CounterIndication>,
    #[serde(default)]
    pub status: PatternStatus,
    /// Store-wide revision at the last upsert; the L3→L4 cursor.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl Pattern {
    pub fn stream(&self) -> StreamId {
        StreamId::new(&self.engine, &self.benchmark)
    }
}

// =============================================================================
// Layer 4: curated knowledge
// =============================================================================

/// Kind of a curated entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Gap,
    Strength,
    TuningRule,
}

/// A disagreement between a proposed update and a human-reviewed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub detected_at: DateTime<Utc>,
    pub reason: String,
    pub proposed_description: String,
    #[serde(default)]
    pub proposed_sources: Vec<String>,
}

/// A curated, scoped claim about one engine's behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub engine: String,
    pub kind: EntryKind,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    /// Gap identifier matched by detection rules and cited by examples.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_id: Option<String>,
    #[serde(default)]
    pub source_patterns: Vec<String>,
    #[serde(default)]
    pub source_findings: Vec<String>,
    /// Validated rule; absent when none was proposed or it failed validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_rule: Option<RawDetectionRule>,
    #[serde(default)]
    pub human_reviewed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    /// Number of cited evidence records.
    pub fn evidence_count(&self) -> usize {
        self.source_patterns.len() + self.source_findings.len()
    }

    /// Whether the entry cites at least one pattern or finding.
    pub fn has_evidence(&self) -> bool {
        self.evidence_count() >= 1
    }

    /// Whether two entries describe the same claim.
    pub fn same_claim(&self, engine: &str, kind: EntryKind, title: &str) -> bool {
        self.engine == engine && self.kind == kind && self.title.eq_ignore_ascii_case(title)
    }

    /// All cited evidence ids.
    pub fn evidence_ids(&self) -> impl Iterator<Item = &String> {
        self.source_patterns.iter().chain(self.source_findings.iter())
    }
}

/// Lifecycle of a gold example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExampleStatus {
    #[default]
    Active,
    Deprecated,
    Superseded { by: String },
}

/// A promoted, evidence-backed before/after query pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldExample {
    pub id: String,
    pub engine: String,
    pub query_id: String,
    pub original_sql: String,
    pub optimized_sql: String,
    pub speedup: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    #[serde(default)]
    pub gap_ids: Vec<String>,
    #[serde(default)]
    pub source_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_outcome: Option<OutcomeKey>,
    /// Features of the original SQL, computed once at promotion.
    pub features: FeatureVector,
    #[serde(default)]
    pub status: ExampleStatus,
    pub created_at: DateTime<Utc>,
}

impl GoldExample {
    pub fn is_active(&self) -> bool {
        self.status == ExampleStatus::Active
    }
}

// =============================================================================
// Published snapshot
// =============================================================================

/// Profile entries of one engine, split by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineProfile {
    pub strengths: Vec<KnowledgeEntry>,
    pub gaps: Vec<KnowledgeEntry>,
    pub tuning_rules: Vec<KnowledgeEntry>,
}

impl EngineProfile {
    pub fn is_empty(&self) -> bool {
        self.strengths.is_empty() && self.gaps.is_empty() && self.tuning_rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strengths.len() + self.gaps.len() + self.tuning_rules.len()
    }
}

/// A counter-indication surfaced to the pipeline for a triggered gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub gap_id: String,
    pub pattern_id: String,
    pub pattern: String,
    pub reason: String,
    #[serde(default)]
    pub regressed_example_ids: Vec<String>,
}

/// Immutable bundle of committed knowledge for one engine.
///
/// Built once per Layer-4 commit and shared through `Arc`; never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeSnapshot {
    pub engine: String,
    pub version: KnowledgeVersion,
    pub committed_at: DateTime<Utc>,
    pub profile: EngineProfile,
    pub examples: Vec<GoldExample>,
    /// Compiled rules in declaration order.
    pub rules: Vec<DetectionRule>,
    /// Counter-indications keyed by gap id.
    pub constraints: BTreeMap<String, Vec<Constraint>>,
    /// Observations from active findings, keyed by query id.
    pub runtime_findings: BTreeMap<String, Vec<String>>,
}

impl KnowledgeSnapshot {
    /// An empty snapshot for an engine.
    pub fn empty(engine: impl Into<String>, version: KnowledgeVersion) -> Self {
        Self {
            engine: engine.into(),
            version,
            committed_at: Utc::now(),
            profile: EngineProfile::default(),
            examples: Vec::new(),
            rules: Vec::new(),
            constraints: BTreeMap::new(),
            runtime_findings: BTreeMap::new(),
        }
    }
}
