//! Query command for Stratum.
//!
//! Answers one knowledge query from the published snapshots, optionally
//! backed by a static knowledge file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::features::{FeatureVector, FeatureVocabulary};
use crate::core::rules::Confidence;
use crate::error::QueryError;
use crate::service::{
    FallbackContext, KnowledgeClient, KnowledgeOrigin, KnowledgeQuery, KnowledgeResponse,
    QueryService, SnapshotCache, StaticProfiles,
};
use crate::storage::LayerStore;

/// Options for the query command.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
    pub engine: String,
    pub query_id: String,
    /// Feature vector as a JSON object.
    pub features: String,
    pub confidence: Confidence,
    /// Static knowledge to fall back to.
    pub static_knowledge: Option<PathBuf>,
}

/// Output format for the query command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutput {
    pub success: bool,
    /// The query reached the service but could not be answered.
    pub unavailable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<KnowledgeOrigin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<KnowledgeResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryOutput {
    fn answered(origin: KnowledgeOrigin, response: KnowledgeResponse) -> Self {
        Self {
            success: true,
            unavailable: false,
            origin: Some(origin),
            response: Some(response),
            error: None,
        }
    }

    fn unavailable(error: &QueryError) -> Self {
        Self {
            success: false,
            unavailable: true,
            origin: None,
            response: None,
            error: Some(error.to_string()),
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            unavailable: false,
            origin: None,
            response: None,
            error: Some(error.into()),
        }
    }
}

/// The query command implementation.
pub struct QueryCommand {
    config: Config,
    project_path: PathBuf,
}

impl QueryCommand {
    /// Create a new query command.
    pub fn new(config: Config, project_path: impl AsRef<Path>) -> Self {
        Self {
            config,
            project_path: project_path.as_ref().to_path_buf(),
        }
    }

    /// Run the query command.
    pub async fn run(&self, options: &QueryOptions) -> QueryOutput {
        let vocabulary = FeatureVocabulary::standard();
        let features = match serde_json::from_str::<FeatureVector>(&options.features)
            .map_err(|e| e.to_string())
            .and_then(|fv| vocabulary.normalize(&fv).map_err(|e| e.to_string()))
        {
            Ok(fv) => fv,
            Err(e) => return QueryOutput::failure(format!("invalid features: {}", e)),
        };

        let data_dir = self.config.data_dir(&self.project_path);
        let layers = match LayerStore::open(&data_dir, vocabulary) {
            Ok(l) => Arc::new(l),
            Err(e) => return QueryOutput::failure(e.to_string()),
        };
        let service = QueryService::new(
            Arc::new(SnapshotCache::from_config(&self.config.cache)),
            self.config.query.clone(),
        )
        .with_layers(layers);

        let query = KnowledgeQuery::new(&options.query_id, &options.engine, features)
            .with_confidence(options.confidence);

        match &options.static_knowledge {
            Some(path) => {
                let profiles = match StaticProfiles::load(path) {
                    Ok(p) => p,
                    Err(e) => return QueryOutput::failure(e.to_string()),
                };
                let client = KnowledgeClient::new(
                    service,
                    Arc::new(profiles),
                    Arc::new(FallbackContext::new()),
                );
                match client.query(query).await {
                    Ok(served) => QueryOutput::answered(served.origin, served.response),
                    Err(e) => QueryOutput::unavailable(&e),
                }
            }
            None => match service.query(query).await {
                Ok(response) => QueryOutput::answered(KnowledgeOrigin::Live, response),
                Err(e) => QueryOutput::unavailable(&e),
            },
        }
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &QueryOutput, options: &QueryOptions) -> String {
        if options.quiet {
            return String::new();
        }

        if options.json {
            serde_json::to_string_pretty(output).unwrap_or_else(|_| "{}".to_string())
        } else {
            self.format_human_readable(output)
        }
    }

    fn format_human_readable(&self, output: &QueryOutput) -> String {
        let Some(response) = &output.response else {
            return format!(
                "No knowledge: {}",
                output.error.as_deref().unwrap_or("unknown error")
            );
        };

        let origin = match output.origin {
            Some(KnowledgeOrigin::Static) => "static",
            _ => "live",
        };
        let mut lines = vec![format!(
            "Knowledge for {} (version {}, {})",
            response.query_id, response.knowledge_version, origin
        )];

        if !response.triggered_gaps.is_empty() {
            lines.push("Triggered gaps:".to_string());
            for gap in &response.triggered_gaps {
                lines.push(format!(
                    "  [{}] {} ({:?} confidence)",
                    gap.priority.label(),
                    gap.gap_id,
                    gap.confidence
                ));
            }
        }

        lines.push("Examples:".to_string());
        for scored in &response.matched_examples {
            lines.push(format!(
                "  {} {:.2}x (score {:.2}) {}",
                scored.example.id,
                scored.example.speedup,
                scored.score,
                scored.example.query_id
            ));
        }

        for constraint in &response.constraints {
            lines.push(format!(
                "Constraint on {}: {}",
                constraint.gap_id, constraint.reason
            ));
        }

        lines.push(format!(
            "Profile: {} entr{}",
            response.engine_profile.len(),
            if response.engine_profile.len() == 1 { "y" } else { "ies" }
        ));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::compact::{CompactCommand, CompactOptions};
    use crate::config::TriggerConfig;
    use crate::core::knowledge::EntryKind;
    use crate::core::outcome::fixtures;
    use crate::service::StaticKnowledge;
    use crate::storage::layers::fixtures::entry;
    use crate::storage::{FileOutcomeStore, OutcomeStore};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const FEATURES: &str = r#"{"archetype": "correlated_subquery", "table_count": 3}"#;

    fn config(temp: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = Some(temp.path().join("data"));
        config.triggers = TriggerConfig {
            extract_min_entries: 3,
            mine_min_findings: 3,
            promote_min_wins: 3,
            ..TriggerConfig::default()
        };
        config
    }

    fn options(engine: &str, features: &str) -> QueryOptions {
        QueryOptions {
            json: false,
            quiet: false,
            engine: engine.to_string(),
            query_id: "q42".to_string(),
            features: features.to_string(),
            confidence: Confidence::Medium,
            static_knowledge: None,
        }
    }

    async fn compacted(temp: &TempDir) {
        let store = FileOutcomeStore::open(temp.path().join("data")).unwrap();
        let fv: FeatureVector = serde_json::from_str(FEATURES).unwrap();
        let fv = FeatureVocabulary::standard().normalize(&fv).unwrap();
        for i in 1..=4 {
            store
                .append(fixtures::win(&format!("q{}", i), "r1").with_features(fv.clone()))
                .unwrap();
        }
        let output = CompactCommand::new(config(temp), temp.path())
            .run(&CompactOptions::default(), &CancellationToken::new())
            .await;
        assert_eq!(output.committed, 3);
    }

    #[tokio::test]
    async fn test_query_after_compaction() {
        let temp = TempDir::new().unwrap();
        compacted(&temp).await;

        let cmd = QueryCommand::new(config(&temp), temp.path());
        let opts = options("duckdb", FEATURES);
        let output = cmd.run(&opts).await;
        assert!(output.success, "{:?}", output.error);
        assert_eq!(output.origin, Some(KnowledgeOrigin::Live));
        let response = output.response.as_ref().unwrap();
        assert_eq!(response.query_id, "q42");
        assert!(!response.matched_examples.is_empty());
        assert!(!response.engine_profile.is_empty());

        let human = cmd.format_output(&output, &opts);
        assert!(human.contains("Knowledge for q42"));
        assert!(human.contains("live"));
    }

    #[tokio::test]
    async fn test_cold_engine_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let cmd = QueryCommand::new(config(&temp), temp.path());
        let output = cmd.run(&options("duckdb", FEATURES)).await;
        assert!(!output.success);
        assert!(output.unavailable);
        assert!(output.error.unwrap().contains("cold cache"));
    }

    fn write_static(temp: &TempDir, knowledge: StaticKnowledge) -> std::path::PathBuf {
        let path = temp.path().join("static.json");
        let profiles = StaticProfiles::new().with_engine("duckdb", knowledge);
        std::fs::write(&path, serde_json::to_string(&profiles).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_static_knowledge_fallback() {
        let temp = TempDir::new().unwrap();
        let mut knowledge = StaticKnowledge::default();
        knowledge.profile.strengths.push(entry(
            "K-000001",
            "duckdb",
            EntryKind::Strength,
            &["P-000001"],
        ));
        let path = write_static(&temp, knowledge);

        let cmd = QueryCommand::new(config(&temp), temp.path());
        let mut opts = options("duckdb", FEATURES);
        opts.static_knowledge = Some(path);
        let output = cmd.run(&opts).await;
        assert!(output.success);
        assert_eq!(output.origin, Some(KnowledgeOrigin::Static));
    }

    #[tokio::test]
    async fn test_empty_static_knowledge_stays_unavailable() {
        let temp = TempDir::new().unwrap();
        let path = write_static(&temp, StaticKnowledge::default());

        let cmd = QueryCommand::new(config(&temp), temp.path());
        let mut opts = options("duckdb", FEATURES);
        opts.static_knowledge = Some(path);
        let output = cmd.run(&opts).await;
        assert!(!output.success);
        assert!(output.unavailable);
        assert!(output.error.unwrap().contains("cold cache"));
    }

    #[tokio::test]
    async fn test_invalid_features_fail_before_lookup() {
        let temp = TempDir::new().unwrap();
        let cmd = QueryCommand::new(config(&temp), temp.path());

        let output = cmd.run(&options("duckdb", "[1, 2]")).await;
        assert!(!output.success);
        assert!(!output.unavailable);

        let output = cmd.run(&options("duckdb", r#"{"table_count": "many"}"#)).await;
        assert!(output.error.unwrap().starts_with("invalid features"));
    }
}
