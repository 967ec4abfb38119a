//! Core types and logic for Stratum.
//!
//! This module contains the feature vocabulary, the detection-rule
//! evaluator, outcome records and the derived knowledge records of
//! Layers 2 through 4.

pub mod features;
pub mod knowledge;
pub mod outcome;
pub mod rules;

pub use features::{
    FeatureType, FeatureValue, FeatureVector, FeatureVectorBuilder, FeatureVocabulary,
    STANDARD_VOCABULARY_VERSION,
};
pub use knowledge::{
    format_id, Conflict, Constraint, CounterIndication, EngineProfile, EntryKind, ExampleStatus,
    Finding, GoldExample, KnowledgeEntry, KnowledgeSnapshot, KnowledgeVersion, Pattern,
    PatternStatus,
};
pub use outcome::{
    Conditions, Outcome, OutcomeKey, OutcomeSource, OutcomeStatus, Provenance, StoredOutcome,
    StreamId, ValidationState,
};
pub use rules::{
    evaluate, evaluate_all, validate, Confidence, DetectionRule, GapMatch, Priority,
    RawDetectionRule, RawPredicate, RuleError,
};
