//! Read path: answer a knowledge query from the snapshot cache.
//!
//! Answers are built from one engine snapshot under a hard latency budget.
//! Detection rules run against the query's feature vector, the triggered
//! gaps drive example ranking and constraint lookup, and the response
//! carries the knowledge version it was built from.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::QueryConfig;
use crate::core::features::FeatureVector;
use crate::core::knowledge::{Constraint, EngineProfile, KnowledgeSnapshot, KnowledgeVersion};
use crate::core::rules::{self, Confidence, GapMatch};
use crate::error::{GateFailureReason, QueryError};
use crate::retrieval::{self, ScoredExample};
use crate::service::cache::SnapshotCache;
use crate::storage::layers::LayerStore;

/// A request for knowledge about one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeQuery {
    pub query_id: String,
    /// Structural fingerprint of the SQL text.
    #[serde(default)]
    pub fingerprint: Option<String>,
    pub engine: String,
    pub features: FeatureVector,
    /// Caller's confidence in `features`. At `low`, low-confidence gap
    /// matches are dropped.
    #[serde(default)]
    pub confidence: Confidence,
}

impl KnowledgeQuery {
    pub fn new(query_id: impl Into<String>, engine: impl Into<String>, features: FeatureVector) -> Self {
        Self {
            query_id: query_id.into(),
            fingerprint: None,
            engine: engine.into(),
            features,
            confidence: Confidence::default(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Knowledge served for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeResponse {
    pub query_id: String,
    pub matched_examples: Vec<ScoredExample>,
    pub engine_profile: EngineProfile,
    /// Gaps whose detection rules fired, highest priority first.
    pub triggered_gaps: Vec<GapMatch>,
    /// Counter-indications attached to the triggered gaps.
    pub constraints: Vec<Constraint>,
    /// Plan-level observations, only for engines with plan diagnostics.
    pub runtime_findings: Option<Vec<String>>,
    pub knowledge_version: KnowledgeVersion,
}

/// Build a response from one snapshot.
///
/// Fails with a gate failure when either required field would be empty.
pub fn answer(
    snapshot: &KnowledgeSnapshot,
    query: &KnowledgeQuery,
    config: &QueryConfig,
) -> Result<KnowledgeResponse, QueryError> {
    if snapshot.profile.is_empty() {
        return Err(QueryError::gate(&query.engine, GateFailureReason::MissingProfile));
    }

    let mut triggered = rules::evaluate_all(&snapshot.rules, &query.features);
    if query.confidence == Confidence::Low {
        triggered.retain(|m| m.confidence != Confidence::Low);
    }
    let gap_ids: Vec<String> = triggered.iter().map(|m| m.gap_id.clone()).collect();

    let matched = retrieval::rank(
        &query.features,
        &gap_ids,
        &snapshot.examples,
        config.max_examples,
    );
    if matched.is_empty() {
        return Err(QueryError::gate(&query.engine, GateFailureReason::MissingExamples));
    }

    let constraints = gap_ids
        .iter()
        .filter_map(|gap| snapshot.constraints.get(gap))
        .flatten()
        .cloned()
        .collect();

    let runtime_findings = config
        .plan_diagnostics_engines
        .iter()
        .any(|e| e.eq_ignore_ascii_case(&query.engine))
        .then(|| {
            snapshot
                .runtime_findings
                .get(&query.query_id)
                .cloned()
                .unwrap_or_default()
        });

    Ok(KnowledgeResponse {
        query_id: query.query_id.clone(),
        matched_examples: matched,
        engine_profile: snapshot.profile.clone(),
        triggered_gaps: triggered,
        constraints,
        runtime_findings,
        knowledge_version: snapshot.version,
    })
}

/// Run `work` on the blocking pool, giving up after `budget`.
async fn within_budget<T, F>(budget: Duration, work: F) -> Result<T, QueryError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, QueryError> + Send + 'static,
{
    let budget_ms = budget.as_millis() as u64;
    match tokio::time::timeout(budget, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
        Ok(Err(_)) | Err(_) => {
            tracing::warn!(budget_ms, "knowledge query exceeded its budget");
            Err(QueryError::Timeout { budget_ms })
        }
    }
}

/// Query entry point over the snapshot cache.
#[derive(Clone)]
pub struct QueryService {
    cache: Arc<SnapshotCache>,
    layers: Option<Arc<LayerStore>>,
    config: Arc<QueryConfig>,
}

impl QueryService {
    pub fn new(cache: Arc<SnapshotCache>, config: QueryConfig) -> Self {
        Self {
            cache,
            layers: None,
            config: Arc::new(config),
        }
    }

    /// Layer store to refresh expired cache entries from.
    pub fn with_layers(mut self, layers: Arc<LayerStore>) -> Self {
        self.layers = Some(layers);
        self
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    fn snapshot(&self, engine: &str) -> Option<Arc<KnowledgeSnapshot>> {
        match &self.layers {
            Some(layers) => self.cache.get_or_refresh(engine, layers),
            None => self.cache.get(engine),
        }
    }

    /// Answer a query within `query.timeout_ms`.
    pub async fn query(&self, query: KnowledgeQuery) -> Result<KnowledgeResponse, QueryError> {
        let Some(snapshot) = self.snapshot(&query.engine) else {
            tracing::debug!(engine = %query.engine, "no snapshot for engine");
            return Err(QueryError::gate(&query.engine, GateFailureReason::ColdCache));
        };

        let config = Arc::clone(&self.config);
        let budget = Duration::from_millis(config.timeout_ms);
        let result = within_budget(budget, move || answer(&snapshot, &query, &config)).await;

        if let Err(e) = &result {
            tracing::debug!(error = %e, "knowledge query failed");
        }
        result
    }
}
