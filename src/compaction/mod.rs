//! Compaction: turning raw outcomes into curated knowledge.
//!
//! Three transitions run per `(engine, benchmark)` stream. Extraction
//! turns terminal outcomes into findings, mining groups findings into
//! patterns, and promotion turns qualifying patterns into knowledge
//! entries and gold examples behind the evidence gate. Each run commits
//! its output together with its cursor or not at all.

pub mod engine;
pub mod oracle;
pub mod scheduler;
pub mod stages;
pub mod triggers;

pub use engine::{CompactionEngine, CycleReport, SkipReason, StageOutcome, StageRun};
pub use oracle::{FeatureExtractor, HeuristicOracle, Oracle, OracleRequest};
pub use scheduler::{RunGuard, Scheduler};
