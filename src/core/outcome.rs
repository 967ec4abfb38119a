//! Outcome records: one per optimization attempt.
//!
//! Outcomes are the raw material of Layer 1. They are immutable once
//! appended, deduplicated by [`OutcomeKey`], and grouped into streams by
//! [`StreamId`]. Only outcomes whose validation has reached a terminal state
//! are ever consumed by compaction.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::core::features::{FeatureVector, FeatureVocabulary};
use crate::core::rules::Confidence;
use crate::error::{Result, StratumError};

/// Dedup key of an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutcomeKey {
    pub query_id: String,
    pub run_id: String,
    pub worker_id: String,
}

impl OutcomeKey {
    pub fn new(
        query_id: impl Into<String>,
        run_id: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            query_id: query_id.into(),
            run_id: run_id.into(),
            worker_id: worker_id.into(),
        }
    }
}

impl fmt::Display for OutcomeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.query_id, self.run_id, self.worker_id)
    }
}

/// A logical stream of outcomes: one engine running one benchmark.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub engine: String,
    pub benchmark: String,
}

impl StreamId {
    pub fn new(engine: impl Into<String>, benchmark: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            benchmark: benchmark.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.engine, self.benchmark)
    }
}

/// Which producer emitted the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    #[default]
    Swarm,
    Oneshot,
    Retry,
    Manual,
    Benchmark,
}

/// Result of the optimization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Win,
    Improved,
    Neutral,
    Regression,
    Error,
}

impl OutcomeStatus {
    /// Whether the attempt produced a faster query.
    pub fn is_success(self) -> bool {
        matches!(self, OutcomeStatus::Win | OutcomeStatus::Improved)
    }

    /// Name as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Win => "win",
            OutcomeStatus::Improved => "improved",
            OutcomeStatus::Neutral => "neutral",
            OutcomeStatus::Regression => "regression",
            OutcomeStatus::Error => "error",
        }
    }
}

/// Validation state of the optimized query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    /// The run is still in flight.
    #[default]
    Pending,
    Passed,
    Failed,
}

impl ValidationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ValidationState::Pending)
    }
}

/// Condition metadata used to disambiguate contradicting observations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_pattern: Option<String>,
}

/// Who produced the optimization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// One optimization attempt as emitted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub query_id: String,
    pub run_id: String,
    pub worker_id: String,
    pub engine: String,
    pub benchmark: String,
    #[serde(default)]
    pub source: OutcomeSource,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speedup: Option<f64>,
    #[serde(default)]
    pub validation: ValidationState,
    #[serde(default)]
    pub validation_confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimized_sql: Option<String>,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FeatureVector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_version_used: Option<String>,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

impl Outcome {
    /// Create an outcome with the required fields; everything else empty.
    pub fn new(
        key: OutcomeKey,
        stream: StreamId,
        status: OutcomeStatus,
    ) -> Self {
        Self {
            query_id: key.query_id,
            run_id: key.run_id,
            worker_id: key.worker_id,
            engine: stream.engine,
            benchmark: stream.benchmark,
            source: OutcomeSource::default(),
            status,
            speedup: None,
            validation: ValidationState::Pending,
            validation_confidence: Confidence::default(),
            transform: None,
            config: BTreeMap::new(),
            error: None,
            reasoning: None,
            original_sql: None,
            optimized_sql: None,
            conditions: Conditions::default(),
            features: None,
            provenance: None,
            knowledge_version_used: None,
            recorded_at: Utc::now(),
        }
    }

    /// A success whose optimized query passed validation.
    pub fn is_validated_win(&self) -> bool {
        self.status.is_success() && self.validation == ValidationState::Passed
    }

    pub fn with_speedup(mut self, speedup: f64) -> Self {
        self.speedup = Some(speedup);
        self
    }

    pub fn with_validation(mut self, validation: ValidationState) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }

    pub fn with_sql(mut self, original: impl Into<String>, optimized: impl Into<String>) -> Self {
        self.original_sql = Some(original.into());
        self.optimized_sql = Some(optimized.into());
        self
    }

    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_features(mut self, features: FeatureVector) -> Self {
        self.features = Some(features);
        self
    }

    pub fn with_source(mut self, source: OutcomeSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_recorded_at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }

    /// The dedup key.
    pub fn key(&self) -> OutcomeKey {
        OutcomeKey::new(&self.query_id, &self.run_id, &self.worker_id)
    }

    /// The stream this outcome belongs to.
    pub fn stream(&self) -> StreamId {
        StreamId::new(&self.engine, &self.benchmark)
    }

    /// UTC day of the physical partition.
    pub fn partition_date(&self) -> NaiveDate {
        self.recorded_at.date_naive()
    }

    /// Whether compaction may consume this outcome.
    pub fn is_terminal(&self) -> bool {
        self.validation.is_terminal()
    }

    /// Check required fields and bring the feature vector into conformance.
    ///
    /// Runs synchronously at ingest; failures are caller errors.
    pub fn validate(&mut self, vocabulary: &FeatureVocabulary) -> Result<()> {
        for (field, value) in [
            ("query_id", &self.query_id),
            ("run_id", &self.run_id),
            ("worker_id", &self.worker_id),
            ("engine", &self.engine),
            ("benchmark", &self.benchmark),
        ] {
            if value.trim().is_empty() {
                return Err(StratumError::validation(field, "must not be empty"));
            }
            if value.contains(['/', '\\']) || value == "." || value == ".." {
                return Err(StratumError::validation(
                    field,
                    format!("'{}' contains a path separator", value),
                ));
            }
        }

        if let Some(speedup) = self.speedup {
            if !speedup.is_finite() || speedup < 0.0 {
                return Err(StratumError::validation(
                    "speedup",
                    format!("{} is not a finite non-negative number", speedup),
                ));
            }
        }

        if let Some(features) = &self.features {
            let normalized = vocabulary
                .normalize(features)
                .map_err(|e| StratumError::validation("features", e.to_string()))?;
            self.features = Some(normalized);
        }

        Ok(())
    }

    /// Drop bulky free text kept only for recent records.
    ///
    /// Returns true if anything was removed.
    pub fn strip_bulk_text(&mut self) -> bool {
        let had_text = self.original_sql.is_some()
            || self.optimized_sql.is_some()
            || self.reasoning.is_some()
            || self.error.is_some();
        self.original_sql = None;
        self.optimized_sql = None;
        self.reasoning = None;
        self.error = None;
        had_text
    }
}

/// An outcome as persisted, tagged with its per-stream sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOutcome {
    /// 1-based, gap-free within the stream.
    pub seq: u64,
    #[serde(flatten)]
    pub outcome: Outcome,
}
