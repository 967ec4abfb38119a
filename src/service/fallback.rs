//! Fallback wrapper around the query service.
//!
//! [`KnowledgeClient`] asks the live query service first. When that fails
//! (gate failure or timeout) the engine is recorded in the caller's
//! [`FallbackContext`] and served from a [`StaticKnowledgeSource`] for as
//! long as that context lives. The context is owned by the caller, so a
//! pipeline run decides its own scope.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::core::knowledge::{EngineProfile, GoldExample, KnowledgeVersion};
use crate::error::{GateFailureReason, QueryError, Result, StratumError};
use crate::retrieval;
use crate::service::query::{KnowledgeQuery, KnowledgeResponse, QueryService};
use crate::util::read_to_string_limited;

/// Knowledge that does not depend on the compaction pipeline.
pub trait StaticKnowledgeSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Response for a query, or `None` when there is nothing to serve for
    /// the engine.
    fn answer(&self, query: &KnowledgeQuery) -> Option<KnowledgeResponse>;
}

/// Hand-maintained profile and examples for one engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticKnowledge {
    #[serde(default)]
    pub profile: EngineProfile,
    #[serde(default)]
    pub examples: Vec<GoldExample>,
}

/// Static knowledge keyed by engine, usually loaded from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticProfiles {
    #[serde(default)]
    pub engines: BTreeMap<String, StaticKnowledge>,
    /// Examples returned per query.
    #[serde(default = "default_max_examples")]
    pub max_examples: usize,
}

fn default_max_examples() -> usize {
    3
}

impl StaticProfiles {
    pub fn new() -> Self {
        Self {
            engines: BTreeMap::new(),
            max_examples: default_max_examples(),
        }
    }

    pub fn with_engine(mut self, engine: impl Into<String>, knowledge: StaticKnowledge) -> Self {
        self.engines.insert(engine.into(), knowledge);
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = read_to_string_limited(path)?;
        serde_json::from_str(&content).map_err(|e| {
            StratumError::config(format!("invalid static knowledge {}: {}", path.display(), e))
        })
    }
}

impl StaticKnowledgeSource for StaticProfiles {
    fn name(&self) -> &'static str {
        "static"
    }

    fn answer(&self, query: &KnowledgeQuery) -> Option<KnowledgeResponse> {
        let knowledge = self.engines.get(&query.engine)?;
        let matched_examples =
            retrieval::rank(&query.features, &[], &knowledge.examples, self.max_examples);
        if knowledge.profile.is_empty() && matched_examples.is_empty() {
            return None;
        }
        Some(KnowledgeResponse {
            query_id: query.query_id.clone(),
            matched_examples,
            engine_profile: knowledge.profile.clone(),
            triggered_gaps: Vec::new(),
            constraints: Vec::new(),
            runtime_findings: None,
            knowledge_version: KnowledgeVersion::default(),
        })
    }
}

/// Engines that fell back during one pipeline run.
#[derive(Debug, Default)]
pub struct FallbackContext {
    disabled: Mutex<BTreeMap<String, String>>,
}

impl FallbackContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route an engine to the static source from now on.
    pub fn disable(&self, engine: &str, reason: &QueryError) {
        if let Ok(mut disabled) = self.disabled.lock() {
            disabled
                .entry(engine.to_string())
                .or_insert_with(|| reason.to_string());
        }
    }

    pub fn is_disabled(&self, engine: &str) -> bool {
        self.disabled
            .lock()
            .map(|d| d.contains_key(engine))
            .unwrap_or(false)
    }

    /// Why an engine was disabled.
    pub fn reason(&self, engine: &str) -> Option<String> {
        self.disabled.lock().ok()?.get(engine).cloned()
    }

    pub fn disabled_engines(&self) -> Vec<String> {
        self.disabled
            .lock()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Where an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeOrigin {
    Live,
    Static,
}

/// A response plus its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServedKnowledge {
    pub origin: KnowledgeOrigin,
    #[serde(flatten)]
    pub response: KnowledgeResponse,
}

/// Query client that falls back to static knowledge.
pub struct KnowledgeClient {
    service: QueryService,
    fallback: Arc<dyn StaticKnowledgeSource>,
    context: Arc<FallbackContext>,
}

impl KnowledgeClient {
    pub fn new(
        service: QueryService,
        fallback: Arc<dyn StaticKnowledgeSource>,
        context: Arc<FallbackContext>,
    ) -> Self {
        Self {
            service,
            fallback,
            context,
        }
    }

    pub fn context(&self) -> &Arc<FallbackContext> {
        &self.context
    }

    fn serve_static(&self, query: &KnowledgeQuery) -> Option<ServedKnowledge> {
        self.fallback.answer(query).map(|response| ServedKnowledge {
            origin: KnowledgeOrigin::Static,
            response,
        })
    }

    /// Answer from the live service, or from the static source once the
    /// engine has failed in this context.
    ///
    /// The live error is returned when the static source has nothing for
    /// the engine either.
    pub async fn query(&self, query: KnowledgeQuery) -> std::result::Result<ServedKnowledge, QueryError> {
        if self.context.is_disabled(&query.engine) {
            return self
                .serve_static(&query)
                .ok_or_else(|| QueryError::gate(&query.engine, GateFailureReason::EngineDisabled));
        }

        match self.service.query(query.clone()).await {
            Ok(response) => Ok(ServedKnowledge {
                origin: KnowledgeOrigin::Live,
                response,
            }),
            Err(e) => {
                tracing::warn!(
                    engine = %query.engine,
                    error = %e,
                    fallback = self.fallback.name(),
                    "live knowledge unavailable, falling back"
                );
                self.context.disable(&query.engine, &e);
                self.serve_static(&query).ok_or(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use crate::core::features::{FeatureVector, FeatureVocabulary};
    use crate::core::knowledge::{EntryKind, ExampleStatus, KnowledgeSnapshot};
    use crate::service::cache::SnapshotCache;
    use crate::storage::layers::fixtures::entry;
    use chrono::Utc;
    use tempfile::TempDir;

    fn features() -> FeatureVector {
        let vocab = FeatureVocabulary::standard();
        vocab.builder().set("table_count", 3i64).unwrap().build()
    }

    fn example(id: &str, engine: &str) -> GoldExample {
        GoldExample {
            id: id.into(),
            engine: engine.into(),
            query_id: "q1".into(),
            original_sql: "SELECT 1".into(),
            optimized_sql: "SELECT 1".into(),
            speedup: 1.5,
            transform: None,
            gap_ids: vec![],
            source_patterns: vec!["P-000001".into()],
            source_outcome: None,
            features: features(),
            status: ExampleStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn static_source() -> Arc<StaticProfiles> {
        let mut profile = EngineProfile::default();
        profile
            .strengths
            .push(entry("K-000009", "duckdb", EntryKind::Strength, &["P-000001"]));
        Arc::new(StaticProfiles::new().with_engine(
            "duckdb",
            StaticKnowledge {
                profile,
                examples: vec![example("G-000009", "duckdb")],
            },
        ))
    }

    fn live_snapshot() -> Arc<KnowledgeSnapshot> {
        let mut s = KnowledgeSnapshot::empty("duckdb", KnowledgeVersion(3));
        s.profile
            .gaps
            .push(entry("K-000001", "duckdb", EntryKind::Gap, &["P-000001"]));
        s.examples.push(example("G-000001", "duckdb"));
        Arc::new(s)
    }

    fn client(cache: Arc<SnapshotCache>) -> KnowledgeClient {
        KnowledgeClient::new(
            QueryService::new(cache, QueryConfig::default()),
            static_source(),
            Arc::new(FallbackContext::new()),
        )
    }

    #[tokio::test]
    async fn test_live_answer_when_available() {
        let cache = Arc::new(SnapshotCache::default());
        cache.install(live_snapshot());
        let client = client(cache);

        let served = client
            .query(KnowledgeQuery::new("q1", "duckdb", features()))
            .await
            .unwrap();
        assert_eq!(served.origin, KnowledgeOrigin::Live);
        assert_eq!(served.response.knowledge_version, KnowledgeVersion(3));
        assert!(client.context().disabled_engines().is_empty());
    }

    #[tokio::test]
    async fn test_gate_failure_switches_engine_to_static_for_context() {
        let cache = Arc::new(SnapshotCache::default());
        let client = client(Arc::clone(&cache));

        let served = client
            .query(KnowledgeQuery::new("q1", "duckdb", features()))
            .await
            .unwrap();
        assert_eq!(served.origin, KnowledgeOrigin::Static);
        assert_eq!(served.response.matched_examples[0].example.id, "G-000009");
        assert!(client.context().is_disabled("duckdb"));
        assert!(client.context().reason("duckdb").unwrap().contains("cold cache"));

        // Live knowledge arriving later does not re-enable the engine
        cache.install(live_snapshot());
        let served = client
            .query(KnowledgeQuery::new("q2", "duckdb", features()))
            .await
            .unwrap();
        assert_eq!(served.origin, KnowledgeOrigin::Static);
    }

    #[tokio::test]
    async fn test_new_context_tries_live_again() {
        let cache = Arc::new(SnapshotCache::default());
        let first = client(Arc::clone(&cache));
        first
            .query(KnowledgeQuery::new("q1", "duckdb", features()))
            .await
            .unwrap();

        cache.install(live_snapshot());
        let second = client(cache);
        let served = second
            .query(KnowledgeQuery::new("q1", "duckdb", features()))
            .await
            .unwrap();
        assert_eq!(served.origin, KnowledgeOrigin::Live);
    }

    #[tokio::test]
    async fn test_unknown_engine_surfaces_live_error() {
        let client = client(Arc::new(SnapshotCache::default()));
        let err = client
            .query(KnowledgeQuery::new("q1", "postgres", features()))
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::gate("postgres", GateFailureReason::ColdCache));

        let err = client
            .query(KnowledgeQuery::new("q1", "postgres", features()))
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::gate("postgres", GateFailureReason::EngineDisabled));
    }

    #[tokio::test]
    async fn test_empty_static_knowledge_surfaces_live_error() {
        let empty = StaticProfiles::new().with_engine("duckdb", StaticKnowledge::default());
        assert!(empty
            .answer(&KnowledgeQuery::new("q1", "duckdb", features()))
            .is_none());

        let client = KnowledgeClient::new(
            QueryService::new(Arc::new(SnapshotCache::default()), QueryConfig::default()),
            Arc::new(empty),
            Arc::new(FallbackContext::new()),
        );
        let err = client
            .query(KnowledgeQuery::new("q1", "duckdb", features()))
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::gate("duckdb", GateFailureReason::ColdCache));
        assert!(client.context().is_disabled("duckdb"));
    }

    #[test]
    fn test_examples_alone_are_served() {
        let source = StaticProfiles::new().with_engine(
            "duckdb",
            StaticKnowledge {
                profile: EngineProfile::default(),
                examples: vec![example("G-000001", "duckdb")],
            },
        );
        let response = source
            .answer(&KnowledgeQuery::new("q1", "duckdb", features()))
            .unwrap();
        assert_eq!(response.matched_examples.len(), 1);
        assert!(response.engine_profile.is_empty());
    }

    #[test]
    fn test_load_static_profiles() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("static.json");
        let profiles = StaticProfiles::new().with_engine(
            "duckdb",
            StaticKnowledge {
                profile: EngineProfile::default(),
                examples: vec![example("G-000001", "duckdb")],
            },
        );
        std::fs::write(&path, serde_json::to_string(&profiles).unwrap()).unwrap();

        let loaded = StaticProfiles::load(&path).unwrap();
        assert_eq!(loaded, profiles);

        std::fs::write(&path, "{not json").unwrap();
        assert!(StaticProfiles::load(&path).is_err());
    }
}
