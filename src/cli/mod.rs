//! CLI commands for Stratum.
//!
//! This module provides the operator entry points, organized into:
//! - **Write path**: ingest
//! - **Compaction**: compact, dead-letters, retention
//! - **Read path**: query, rule
//! - **Inspection**: status

// Write path
pub mod ingest;

// Compaction
pub mod compact;
pub mod dead_letters;
pub mod retention;

// Read path
pub mod query;
pub mod rule;

// Inspection
pub mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audit::AuditLog;
use crate::compaction::{CompactionEngine, HeuristicOracle};
use crate::config::Config;
use crate::core::features::FeatureVocabulary;
use crate::error::Result;
use crate::storage::{FileOutcomeStore, LayerStore};

pub use compact::CompactCommand;
pub use dead_letters::DeadLettersCommand;
pub use ingest::IngestCommand;
pub use query::QueryCommand;
pub use retention::RetentionCommand;
pub use rule::RuleCommand;
pub use status::StatusCommand;

/// The on-disk stores of one data directory.
pub(crate) struct Stores {
    pub data_dir: PathBuf,
    pub outcomes: Arc<FileOutcomeStore>,
    pub layers: Arc<LayerStore>,
    pub audit: Arc<AuditLog>,
}

impl Stores {
    pub fn open(config: &Config, project_path: &Path) -> Result<Self> {
        let data_dir = config.data_dir(project_path);
        let vocabulary = FeatureVocabulary::standard();
        let outcomes = FileOutcomeStore::open_with_vocabulary(&data_dir, vocabulary.clone())?;
        let layers = LayerStore::open(&data_dir, vocabulary)?;
        Ok(Self {
            audit: Arc::new(AuditLog::in_data_dir(&data_dir)),
            outcomes: Arc::new(outcomes),
            layers: Arc::new(layers),
            data_dir,
        })
    }

    /// A compaction engine over these stores using the heuristic oracle.
    pub fn engine(&self, config: &Config) -> CompactionEngine {
        CompactionEngine::new(
            config.clone(),
            Arc::clone(&self.outcomes) as _,
            Arc::clone(&self.layers),
            Arc::new(HeuristicOracle::new()),
            Arc::clone(&self.audit) as _,
        )
    }
}
