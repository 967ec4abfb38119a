//! Stratum - layered knowledge compaction for query optimization pipelines
//!
//! Stratum records optimization outcomes in an append-only log and compacts
//! them, stage by stage, into findings, patterns and finally engine
//! profiles with gold examples. The query path serves the latest committed
//! knowledge for an engine from an in-memory snapshot cache.

pub mod audit;
pub mod cli;
pub mod compaction;
pub mod config;
pub mod core;
pub mod error;
pub mod retrieval;
pub mod service;
pub mod storage;
pub mod util;

pub use audit::{AuditEvent, AuditEventType, AuditLog, AuditSink, AuditSummary};
pub use compaction::{CompactionEngine, CycleReport, HeuristicOracle, Oracle, StageOutcome};
pub use config::Config;
pub use core::{
    FeatureVector, FeatureVocabulary, GoldExample, KnowledgeEntry, KnowledgeSnapshot,
    KnowledgeVersion, Outcome, OutcomeKey, StreamId,
};
pub use error::{QueryError, Result, StratumError};
pub use retrieval::{rank, score, ScoredExample};
pub use service::{
    FallbackContext, IngestService, KnowledgeClient, KnowledgeQuery, KnowledgeResponse,
    QueryService, SnapshotCache,
};
pub use storage::{FileOutcomeStore, LayerStore, MemoryOutcomeStore, OutcomeStore};

// CLI commands
pub use cli::{
    CompactCommand, DeadLettersCommand, IngestCommand, QueryCommand, RetentionCommand,
    RuleCommand, StatusCommand,
};
