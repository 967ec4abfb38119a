//! Derivation stages: extraction (L1 → L2), mining (L2 → L3) and
//! promotion (L3 → L4).
//!
//! A stage run has three steps. The oracle is invoked with retries until
//! its output parses and passes the field checks in `parse_*`. The parsed
//! output is then applied to a copy of the layer state by `apply_*`, which
//! also advances the cursor, all inside one [`LayerStore::transact`]. Audit
//! events gathered while applying are emitted only after the commit.
//!
//! [`LayerStore::transact`]: crate::storage::layers::LayerStore::transact

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEventType, AuditSink};
use crate::compaction::oracle::{
    ExtractOutput, FeatureExtractor, MineOutput, Oracle, OracleRequest, PromoteOutput,
    ProposedEntry, ProposedExample,
};
use crate::compaction::triggers::{OutcomeBatch, PatternBatch};
use crate::config::{Config, MiningConfig, RetryConfig};
use crate::core::features::FeatureVocabulary;
use crate::core::knowledge::{
    Conflict, EntryKind, ExampleStatus, Finding, GoldExample, KnowledgeEntry, Pattern,
    PatternStatus,
};
use crate::core::outcome::{OutcomeKey, StoredOutcome, StreamId};
use crate::core::rules::{self, RawDetectionRule};
use crate::error::{Result, StratumError};
use crate::storage::layers::{LayerState, Transition};
use crate::storage::traits::OutcomeStore;

/// Result of applying one stage's output.
#[derive(Debug, Clone, Default)]
pub struct Applied {
    /// Cursor position after the commit.
    pub cursor: u64,
    /// Records created or updated.
    pub produced: u32,
    /// Events to audit once the commit is durable.
    pub audit: Vec<AuditEventType>,
}

// =============================================================================
// Oracle invocation
// =============================================================================

/// How an oracle invocation ended.
#[derive(Debug)]
pub enum Invocation<T> {
    Parsed(T),
    /// Every attempt failed; the batch must be parked.
    Exhausted { attempts: u32, last_error: String },
    /// Cancellation arrived between attempts.
    Cancelled,
}

/// Invoke the oracle until its output parses, backing off between
/// attempts. Each failed attempt is audited.
#[allow(clippy::too_many_arguments)]
pub async fn invoke_with_retry<T>(
    oracle: &dyn Oracle,
    request: &OracleRequest,
    retry: &RetryConfig,
    transition: Transition,
    stream: &StreamId,
    audit: &dyn AuditSink,
    cancel: &CancellationToken,
    parse: impl Fn(Value) -> Result<T>,
) -> Invocation<T> {
    let max_attempts = retry.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..max_attempts {
        if attempt > 0 {
            let delay = retry.backoff(attempt - 1);
            tokio::select! {
                _ = cancel.cancelled() => return Invocation::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match oracle.invoke(request).await.and_then(&parse) {
            Ok(parsed) => return Invocation::Parsed(parsed),
            Err(err) => {
                last_error = err.to_string();
                tracing::warn!(
                    %transition,
                    %stream,
                    attempt = attempt + 1,
                    error = %last_error,
                    "stage attempt failed"
                );
                audit.record(AuditEventType::stage_retried(
                    transition,
                    stream,
                    attempt + 1,
                    last_error.clone(),
                ));
            }
        }
    }

    Invocation::Exhausted {
        attempts: max_attempts,
        last_error,
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Typed parse plus field checks for extraction output.
///
/// Findings may only cite outcomes from the batch.
pub fn parse_extraction(value: Value, batch: &[StoredOutcome]) -> Result<ExtractOutput> {
    let output: ExtractOutput = serde_json::from_value(value)?;
    let keys: HashSet<OutcomeKey> = batch.iter().map(|r| r.outcome.key()).collect();

    for (i, finding) in output.findings.iter().enumerate() {
        let field = format!("findings[{}]", i);
        if finding.outcome_keys.is_empty() {
            return Err(StratumError::validation(field, "cites no outcome"));
        }
        if finding.observation.trim().is_empty() {
            return Err(StratumError::validation(field, "observation is empty"));
        }
        if let Some(key) = finding.outcome_keys.iter().find(|k| !keys.contains(k)) {
            return Err(StratumError::validation(
                field,
                format!("outcome {} is not part of the batch", key),
            ));
        }
    }
    Ok(output)
}

/// Turn proposed findings into Layer-2 records and advance the cursor.
pub fn apply_extraction(
    state: &mut LayerState,
    stream: &StreamId,
    batch: &OutcomeBatch,
    output: ExtractOutput,
    now: DateTime<Utc>,
) -> Result<Applied> {
    let by_key: HashMap<OutcomeKey, &StoredOutcome> = batch
        .records
        .iter()
        .map(|r| (r.outcome.key(), r))
        .collect();

    let mut produced = 0;
    for proposal in output.findings {
        let mut keys: Vec<OutcomeKey> = Vec::new();
        for key in proposal.outcome_keys {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        let records: Vec<&StoredOutcome> = keys.iter().filter_map(|k| by_key.get(k).copied()).collect();
        let Some(first) = records.first() else {
            continue;
        };

        let best_speedup = records
            .iter()
            .filter_map(|r| r.outcome.speedup)
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))));

        let finding = Finding {
            id: String::new(),
            engine: stream.engine.clone(),
            benchmark: stream.benchmark.clone(),
            seq: 0,
            query_ids: records.iter().map(|r| r.outcome.query_id.clone()).collect(),
            observation: proposal.observation,
            transform: proposal.transform.or_else(|| first.outcome.transform.clone()),
            conditions: proposal
                .conditions
                .unwrap_or_else(|| first.outcome.conditions.clone()),
            best_speedup,
            win: records.iter().any(|r| r.outcome.is_validated_win()),
            superseded_by: None,
            created_at: now,
            outcome_keys: keys,
        };
        let keys = finding.outcome_keys.clone();
        let id = state.insert_finding(finding);
        let superseded = state.supersede_covering(&keys, &id);
        if !superseded.is_empty() {
            tracing::debug!(finding = %id, superseded = ?superseded, "re-extraction superseded findings");
        }
        produced += 1;
    }

    state.advance_cursor(Transition::Extract, stream, batch.to, now)?;

    let audit = batch
        .abandoned
        .iter()
        .map(|key| AuditEventType::pending_abandoned(stream, key.clone()))
        .collect();

    Ok(Applied {
        cursor: batch.to,
        produced,
        audit,
    })
}

// =============================================================================
// Mining
// =============================================================================

/// Typed parse plus field checks for mining output.
///
/// Patterns may only cite findings the oracle was shown.
pub fn parse_mining(value: Value, known_findings: &HashSet<String>) -> Result<MineOutput> {
    let output: MineOutput = serde_json::from_value(value)?;
    for (i, pattern) in output.patterns.iter().enumerate() {
        let field = format!("patterns[{}]", i);
        if pattern.mechanism.trim().is_empty() {
            return Err(StratumError::validation(field, "mechanism is empty"));
        }
        if pattern.finding_ids.is_empty() {
            return Err(StratumError::validation(field, "cites no finding"));
        }
        if let Some(id) = pattern.finding_ids.iter().find(|id| !known_findings.contains(*id)) {
            return Err(StratumError::validation(
                field,
                format!("unknown finding '{}'", id),
            ));
        }
    }
    Ok(output)
}

/// Recompute a pattern's span and counts from its active cited findings.
fn recount(pattern: &mut Pattern, state: &LayerState) {
    let cited: Vec<&Finding> = pattern
        .finding_ids
        .iter()
        .filter_map(|id| state.findings.get(id))
        .filter(|f| f.is_active())
        .collect();
    pattern.query_ids = cited.iter().flat_map(|f| f.query_ids.iter().cloned()).collect();
    pattern.observations = cited.len() as u32;
    pattern.wins = cited.iter().filter(|f| f.win).count() as u32;
    pattern.success_rate = if pattern.observations > 0 {
        f64::from(pattern.wins) / f64::from(pattern.observations)
    } else {
        0.0
    };
}

/// Distinct query ids across the cited findings that are still active.
fn span(finding_ids: &[String], state: &LayerState) -> usize {
    finding_ids
        .iter()
        .filter_map(|id| state.findings.get(id))
        .filter(|f| f.is_active())
        .flat_map(|f| f.query_ids.iter())
        .collect::<BTreeSet<_>>()
        .len()
}

/// Merge proposed patterns into Layer 3 and advance the cursor.
///
/// Proposals spanning too few distinct queries are dropped. Proposals
/// sharing a mechanism with an existing pattern of the stream are merged
/// into it. Counts are always recomputed here, never taken from the oracle,
/// and a pattern whose recomputed span falls short is not stored.
pub fn apply_mining(
    state: &mut LayerState,
    stream: &StreamId,
    cursor_to: u64,
    output: MineOutput,
    mining: &MiningConfig,
    now: DateTime<Utc>,
) -> Result<Applied> {
    let mut produced = 0;
    for proposal in output.patterns {
        let distinct = span(&proposal.finding_ids, state);
        if distinct < mining.min_distinct_queries {
            tracing::info!(
                %stream,
                mechanism = %proposal.mechanism,
                distinct,
                "pattern spans too few queries; dropped"
            );
            continue;
        }

        let mut pattern = match state.pattern_by_mechanism(stream, &proposal.mechanism) {
            Some(existing) => existing.clone(),
            None => Pattern {
                id: state.next_pattern_id(),
                engine: stream.engine.clone(),
                benchmark: stream.benchmark.clone(),
                mechanism: proposal.mechanism.clone(),
                description: String::new(),
                finding_ids: Vec::new(),
                query_ids: BTreeSet::new(),
                observations: 0,
                wins: 0,
                success_rate: 0.0,
                counter_indications: Vec::new(),
                status: PatternStatus::Candidate,
                revision: 0,
                updated_at: now,
            },
        };

        if pattern.status == PatternStatus::Candidate || pattern.description.is_empty() {
            pattern.description = proposal.description;
        }
        for id in proposal.finding_ids {
            if !pattern.finding_ids.contains(&id) {
                pattern.finding_ids.push(id);
            }
        }
        for ci in proposal.counter_indications {
            if !pattern.counter_indications.contains(&ci) {
                pattern.counter_indications.push(ci);
            }
        }

        recount(&mut pattern, state);
        if pattern.query_ids.len() < mining.min_distinct_queries {
            tracing::info!(
                %stream,
                pattern = %pattern.id,
                distinct = pattern.query_ids.len(),
                "merged pattern spans too few active queries; not stored"
            );
            continue;
        }
        if pattern.status != PatternStatus::Deprecated
            && pattern.observations >= mining.min_observations_to_deprecate
            && pattern.success_rate < mining.deprecate_below
        {
            tracing::info!(
                pattern = %pattern.id,
                success_rate = pattern.success_rate,
                "pattern deprecated"
            );
            pattern.status = PatternStatus::Deprecated;
        }
        pattern.updated_at = now;
        state.upsert_pattern(pattern);
        produced += 1;
    }

    state.advance_cursor(Transition::Mine, stream, cursor_to, now)?;
    Ok(Applied {
        cursor: cursor_to,
        produced,
        audit: Vec::new(),
    })
}

// =============================================================================
// Promotion
// =============================================================================

/// Typed parse of promotion output. Per-entry problems are handled by the
/// evidence gate, not here.
pub fn parse_promotion(value: Value) -> Result<PromoteOutput> {
    Ok(serde_json::from_value(value)?)
}

/// Collaborators the evidence gate needs besides the layer state.
pub struct PromotionContext<'a> {
    pub config: &'a Config,
    pub vocabulary: &'a FeatureVocabulary,
    pub outcomes: &'a dyn OutcomeStore,
    pub extractor: Option<&'a dyn FeatureExtractor>,
}

/// Evidence check shared by entries and examples.
///
/// At least one citation is always required. When `evidence.required` is
/// set every citation must also exist in the current graph.
fn check_evidence<'a>(
    state: &LayerState,
    ids: impl IntoIterator<Item = &'a String>,
    existence_required: bool,
) -> std::result::Result<(), String> {
    let ids: Vec<&String> = ids.into_iter().collect();
    if ids.is_empty() {
        return Err("cites no pattern or finding".to_string());
    }
    if existence_required {
        if let Some(missing) = ids.iter().find(|id| !state.evidence_exists(id)) {
            return Err(format!("cites unknown id '{}'", missing));
        }
    }
    Ok(())
}

fn merge_ids(into: &mut Vec<String>, from: &[String]) {
    for id in from {
        if !into.contains(id) {
            into.push(id.clone());
        }
    }
}

/// Validate a proposed detection rule. Returns the rule if it may be stored.
fn admit_rule(
    engine: &str,
    proposal: &ProposedEntry,
    vocabulary: &FeatureVocabulary,
    audit: &mut Vec<AuditEventType>,
) -> Option<RawDetectionRule> {
    let value = proposal.detection_rule.as_ref()?;
    if value.is_null() {
        return None;
    }
    let target = proposal
        .gap_id
        .clone()
        .unwrap_or_else(|| proposal.title.clone());

    if proposal.kind != EntryKind::Gap {
        audit.push(AuditEventType::rule_rejected(
            engine,
            target,
            vec!["<root>: detection rules apply to gaps only".to_string()],
        ));
        return None;
    }

    let raw: RawDetectionRule = match serde_json::from_value(value.clone()) {
        Ok(raw) => raw,
        Err(e) => {
            audit.push(AuditEventType::rule_rejected(
                engine,
                target,
                vec![format!("<root>: malformed rule: {}", e)],
            ));
            return None;
        }
    };

    let mut errors: Vec<String> = match rules::validate(&raw, vocabulary) {
        Ok(_) => Vec::new(),
        Err(errors) => errors.iter().map(|e| e.to_string()).collect(),
    };
    if proposal.gap_id.as_deref() != Some(raw.gap_id.as_str()) {
        errors.push(format!(
            "gap_id: rule targets '{}' but the entry is '{}'",
            raw.gap_id, target
        ));
    }

    if errors.is_empty() {
        Some(raw)
    } else {
        tracing::warn!(engine, gap = %target, errors = errors.len(), "detection rule rejected");
        audit.push(AuditEventType::rule_rejected(engine, target, errors));
        None
    }
}

/// Run one proposed entry through the evidence gate and commit it.
///
/// Returns the id of the entry written, or `None` if it was rejected.
fn admit_entry(
    state: &mut LayerState,
    ctx: &PromotionContext<'_>,
    engine: &str,
    proposal: ProposedEntry,
    now: DateTime<Utc>,
    audit: &mut Vec<AuditEventType>,
) -> Result<Option<String>> {
    let reject = |audit: &mut Vec<AuditEventType>, reason: String| {
        tracing::info!(engine, title = %proposal.title, %reason, "entry rejected by evidence gate");
        audit.push(AuditEventType::evidence_rejected(
            engine,
            proposal.title.clone(),
            reason,
        ));
    };

    if proposal.title.trim().is_empty() {
        reject(audit, "title is empty".to_string());
        return Ok(None);
    }
    if let Err(reason) = check_evidence(
        state,
        proposal.source_patterns.iter().chain(&proposal.source_findings),
        ctx.config.evidence.required,
    ) {
        reject(audit, reason);
        return Ok(None);
    }
    if proposal.kind == EntryKind::Gap
        && proposal.gap_id.as_deref().is_none_or(|g| g.trim().is_empty())
    {
        reject(audit, "gap entry has no gap_id".to_string());
        return Ok(None);
    }

    let rule = admit_rule(engine, &proposal, ctx.vocabulary, audit);

    let entry = match state.find_entry(engine, proposal.kind, &proposal.title).cloned() {
        Some(mut existing) => {
            if existing.human_reviewed && !ctx.config.promotion.allow_human_override {
                let mut sources = proposal.source_patterns.clone();
                merge_ids(&mut sources, &proposal.source_findings);
                existing.conflicts.push(Conflict {
                    detected_at: now,
                    reason: "proposal differs from a human-reviewed entry".to_string(),
                    proposed_description: proposal.description.clone(),
                    proposed_sources: sources,
                });
                audit.push(AuditEventType::conflict(
                    existing.id.clone(),
                    engine,
                    "human-reviewed entry kept; proposal recorded",
                ));
            } else {
                existing.description = proposal.description.clone();
                existing.priority = proposal.priority;
                if proposal.gap_id.is_some() {
                    existing.gap_id = proposal.gap_id.clone();
                }
                if rule.is_some() {
                    existing.detection_rule = rule;
                }
                existing.human_reviewed = false;
            }
            merge_ids(&mut existing.source_patterns, &proposal.source_patterns);
            merge_ids(&mut existing.source_findings, &proposal.source_findings);
            existing.updated_at = now;
            existing
        }
        None => KnowledgeEntry {
            id: state.next_entry_id(),
            engine: engine.to_string(),
            kind: proposal.kind,
            title: proposal.title.clone(),
            description: proposal.description.clone(),
            priority: proposal.priority,
            gap_id: proposal.gap_id.clone(),
            source_patterns: proposal.source_patterns.clone(),
            source_findings: proposal.source_findings.clone(),
            detection_rule: rule,
            human_reviewed: false,
            conflicts: Vec::new(),
            revision: 0,
            created_at: now,
            updated_at: now,
        },
    };

    let cited = entry.source_patterns.clone();
    let id = state.upsert_entry(entry)?;

    for pattern_id in cited {
        if let Some(pattern) = state.patterns.get(&pattern_id) {
            if pattern.status == PatternStatus::Candidate {
                let mut pattern = pattern.clone();
                pattern.status = PatternStatus::Promoted;
                pattern.updated_at = now;
                state.upsert_pattern(pattern);
            }
        }
    }
    Ok(Some(id))
}

/// Run one proposed example through the gate and commit it.
fn admit_example(
    state: &mut LayerState,
    ctx: &PromotionContext<'_>,
    engine: &str,
    proposal: ProposedExample,
    now: DateTime<Utc>,
    audit: &mut Vec<AuditEventType>,
) -> Option<String> {
    let query_id = proposal.query_id.clone();
    let reject = |audit: &mut Vec<AuditEventType>, reason: String| {
        tracing::info!(engine, query = %query_id, %reason, "example rejected");
        audit.push(AuditEventType::example_rejected(engine, query_id.clone(), reason));
    };

    if let Err(reason) = check_evidence(
        state,
        proposal.source_patterns.iter(),
        ctx.config.evidence.required,
    ) {
        reject(audit, reason);
        return None;
    }

    let source = match &proposal.source_outcome {
        Some(key) => match ctx.outcomes.get(key) {
            Ok(Some(stored)) if stored.outcome.engine == engine => Some(stored.outcome),
            Ok(Some(_)) => {
                reject(audit, format!("source outcome {} belongs to another engine", key));
                return None;
            }
            Ok(None) => {
                reject(audit, format!("source outcome {} not found", key));
                return None;
            }
            Err(e) => {
                reject(audit, format!("source outcome {} unreadable: {}", key, e));
                return None;
            }
        },
        None => None,
    };

    let original_sql = proposal
        .original_sql
        .clone()
        .or_else(|| source.as_ref().and_then(|o| o.original_sql.clone()));
    let optimized_sql = proposal
        .optimized_sql
        .clone()
        .or_else(|| source.as_ref().and_then(|o| o.optimized_sql.clone()));
    let (Some(original_sql), Some(optimized_sql)) = (original_sql, optimized_sql) else {
        reject(audit, "no SQL text available".to_string());
        return None;
    };

    let speedup = proposal
        .speedup
        .or_else(|| source.as_ref().and_then(|o| o.speedup));
    let Some(speedup) = speedup.filter(|s| s.is_finite() && *s > 0.0) else {
        reject(audit, "no positive speedup".to_string());
        return None;
    };

    let features = match source.as_ref().and_then(|o| o.features.clone()) {
        Some(features) => Some(features),
        None => ctx.extractor.and_then(|extractor| {
            extractor
                .extract(engine, &original_sql)
                .and_then(|fv| ctx.vocabulary.normalize(&fv))
                .map_err(|e| tracing::warn!(engine, error = %e, "feature extraction failed"))
                .ok()
        }),
    };
    let Some(features) = features else {
        reject(audit, "no feature vector obtainable".to_string());
        return None;
    };

    let incumbent = state
        .examples
        .values()
        .find(|g| g.engine == engine && g.query_id == proposal.query_id && g.is_active())
        .map(|g| (g.id.clone(), g.speedup));
    if let Some((incumbent_id, incumbent_speedup)) = &incumbent {
        if *incumbent_speedup >= speedup {
            reject(
                audit,
                format!("{} is at least as fast ({:.2}x)", incumbent_id, incumbent_speedup),
            );
            return None;
        }
    }

    let id = state.next_example_id();
    let example = GoldExample {
        id: id.clone(),
        engine: engine.to_string(),
        query_id: proposal.query_id,
        original_sql,
        optimized_sql,
        speedup,
        transform: proposal
            .transform
            .or_else(|| source.as_ref().and_then(|o| o.transform.clone())),
        gap_ids: proposal.gap_ids,
        source_patterns: proposal.source_patterns,
        source_outcome: proposal.source_outcome,
        features,
        status: ExampleStatus::Active,
        created_at: now,
    };
    state.examples.insert(id.clone(), example);

    if let Some((incumbent_id, _)) = incumbent {
        if let Some(old) = state.examples.get_mut(&incumbent_id) {
            old.status = ExampleStatus::Superseded { by: id.clone() };
        }
    }
    Some(id)
}

/// Apply promotion output through the evidence gate and advance the cursor.
///
/// Rejected entries and examples are audited and left out; the rest of the
/// batch commits. A new knowledge version is assigned to the engine when
/// anything was written.
pub fn apply_promotion(
    state: &mut LayerState,
    ctx: &PromotionContext<'_>,
    stream: &StreamId,
    batch: &PatternBatch,
    output: PromoteOutput,
    now: DateTime<Utc>,
) -> Result<Applied> {
    let engine = stream.engine.as_str();
    let mut audit = Vec::new();
    let mut produced = 0;

    for proposal in output.entries {
        if admit_entry(state, ctx, engine, proposal, now, &mut audit)?.is_some() {
            produced += 1;
        }
    }
    for proposal in output.examples {
        if admit_example(state, ctx, engine, proposal, now, &mut audit).is_some() {
            produced += 1;
        }
    }

    if produced > 0 {
        let version = state.bump_knowledge_version(engine);
        tracing::info!(engine, %version, produced, "knowledge promoted");
    }
    state.advance_cursor(Transition::Promote, stream, batch.to, now)?;

    Ok(Applied {
        cursor: batch.to,
        produced,
        audit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::compaction::oracle::{ProposedFinding, ProposedPattern};
    use crate::core::features::FeatureVector;
    use crate::core::knowledge::KnowledgeVersion;
    use crate::core::outcome::{fixtures, ValidationState};
    use crate::storage::layers::fixtures::{entry, finding, pattern};
    use crate::storage::memory::MemoryOutcomeStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn stream() -> StreamId {
        StreamId::new("duckdb", "tpcds")
    }

    fn batch_of(records: Vec<StoredOutcome>) -> OutcomeBatch {
        OutcomeBatch {
            from: 0,
            to: records.last().map_or(0, |r| r.seq),
            records,
            ..OutcomeBatch::default()
        }
    }

    fn stored(seq: u64, outcome: crate::core::outcome::Outcome) -> StoredOutcome {
        StoredOutcome { seq, outcome }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    /// Oracle that fails a fixed number of times before answering.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        answer: Value,
    }

    #[async_trait]
    impl Oracle for Flaky {
        async fn invoke(&self, _request: &OracleRequest) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Ok(json!({"garbage": true}))
            } else {
                Ok(self.answer.clone())
            }
        }
    }

    fn mine_request() -> OracleRequest {
        OracleRequest::Mine {
            stream: stream(),
            existing_patterns: vec![],
            findings: vec![],
        }
    }

    // Retry

    #[tokio::test]
    async fn test_retry_until_output_parses() {
        let oracle = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            answer: json!({"patterns": []}),
        };
        let audit = MemoryAudit::new();
        let result = invoke_with_retry(
            &oracle,
            &mine_request(),
            &fast_retry(),
            Transition::Mine,
            &stream(),
            &audit,
            &CancellationToken::new(),
            |v| parse_mining(v, &HashSet::new()),
        )
        .await;
        assert!(matches!(result, Invocation::Parsed(ref o) if o.patterns.is_empty()));
        assert_eq!(audit.count_of("stage_retried"), 2);
    }

    #[tokio::test]
    async fn test_retry_exhausts() {
        let oracle = Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            answer: Value::Null,
        };
        let audit = MemoryAudit::new();
        let result = invoke_with_retry(
            &oracle,
            &mine_request(),
            &fast_retry(),
            Transition::Mine,
            &stream(),
            &audit,
            &CancellationToken::new(),
            |v| parse_mining(v, &HashSet::new()),
        )
        .await;
        match result {
            Invocation::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("serialization"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_cancel() {
        let oracle = Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            answer: Value::Null,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let retry = RetryConfig {
            max_attempts: 5,
            base_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
        };
        let result = invoke_with_retry(
            &oracle,
            &mine_request(),
            &retry,
            Transition::Mine,
            &stream(),
            &MemoryAudit::new(),
            &cancel,
            |v| parse_mining(v, &HashSet::new()),
        )
        .await;
        assert!(matches!(result, Invocation::Cancelled));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    // Extraction

    #[test]
    fn test_parse_extraction_rejects_foreign_keys() {
        let batch = vec![stored(1, fixtures::win("q1", "r1"))];
        let good = json!({"findings": [{
            "outcome_keys": [{"query_id": "q1", "run_id": "r1", "worker_id": "w1"}],
            "observation": "ok"
        }]});
        assert!(parse_extraction(good, &batch).is_ok());

        let foreign = json!({"findings": [{
            "outcome_keys": [{"query_id": "q9", "run_id": "r1", "worker_id": "w1"}],
            "observation": "ok"
        }]});
        let err = parse_extraction(foreign, &batch).unwrap_err();
        assert!(err.to_string().contains("not part of the batch"));

        let empty = json!({"findings": [{"outcome_keys": [], "observation": "ok"}]});
        assert!(parse_extraction(empty, &batch).is_err());
        assert!(parse_extraction(json!({"nope": 1}), &batch).is_err());
    }

    #[test]
    fn test_apply_extraction_builds_findings_and_supersedes() {
        let mut state = LayerState::default();
        let now = Utc::now();
        let batch = batch_of(vec![
            stored(1, fixtures::win("q1", "r1").with_speedup(3.0)),
            stored(2, fixtures::regression("q1", "r2")),
        ]);
        let output = ExtractOutput {
            findings: vec![ProposedFinding {
                outcome_keys: vec![OutcomeKey::new("q1", "r1", "w1"), OutcomeKey::new("q1", "r2", "w1")],
                observation: "decorrelation helps q1".into(),
                transform: None,
                conditions: None,
            }],
        };
        let applied = apply_extraction(&mut state, &stream(), &batch, output.clone(), now).unwrap();
        assert_eq!(applied.produced, 1);
        assert_eq!(applied.cursor, 2);
        let f = &state.findings["F-000001"];
        assert_eq!(f.best_speedup, Some(3.0));
        assert!(f.win);
        assert_eq!(f.transform.as_deref(), Some("decorrelate"));
        assert_eq!(state.cursor(Transition::Extract, &stream()).position, 2);

        // Re-extracting the same keys supersedes the first finding
        let mut again = batch.clone();
        again.from = 2;
        apply_extraction(&mut state, &stream(), &again, output, now).unwrap();
        assert_eq!(
            state.findings["F-000001"].superseded_by.as_deref(),
            Some("F-000002")
        );
        assert_eq!(state.active_findings(&stream()).len(), 1);
    }

    #[test]
    fn test_apply_extraction_audits_abandoned() {
        let mut state = LayerState::default();
        let mut batch = batch_of(vec![stored(2, fixtures::win("q2", "r1"))]);
        batch.abandoned.push(OutcomeKey::new("q1", "r1", "w1"));
        let applied = apply_extraction(
            &mut state,
            &stream(),
            &batch,
            ExtractOutput { findings: vec![] },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(applied.produced, 0);
        assert_eq!(applied.audit.len(), 1);
        assert_eq!(applied.audit[0].event_name(), "pending_abandoned");
        assert_eq!(state.cursor(Transition::Extract, &stream()).position, 2);
    }

    #[test]
    fn test_failed_validation_is_not_a_win() {
        let mut state = LayerState::default();
        let batch = batch_of(vec![
            stored(1, fixtures::win("q1", "r1").with_validation(ValidationState::Failed)),
            stored(2, fixtures::win("q2", "r1")),
        ]);
        let output = ExtractOutput {
            findings: vec![
                ProposedFinding {
                    outcome_keys: vec![OutcomeKey::new("q1", "r1", "w1")],
                    observation: "fast but wrong".into(),
                    transform: None,
                    conditions: None,
                },
                ProposedFinding {
                    outcome_keys: vec![OutcomeKey::new("q2", "r1", "w1")],
                    observation: "fast and correct".into(),
                    transform: None,
                    conditions: None,
                },
            ],
        };
        apply_extraction(&mut state, &stream(), &batch, output, Utc::now()).unwrap();
        assert!(!state.findings["F-000001"].win);
        assert_eq!(state.findings["F-000001"].best_speedup, Some(2.0));
        assert!(state.findings["F-000002"].win);
    }

    // Mining

    fn seeded_findings(state: &mut LayerState, specs: &[(&str, bool)]) -> Vec<String> {
        specs
            .iter()
            .map(|(q, win)| state.insert_finding(finding(&stream(), &[*q], *win)))
            .collect()
    }

    fn proposal(ids: &[String]) -> ProposedPattern {
        ProposedPattern {
            mechanism: "decorrelate".into(),
            description: "decorrelation wins".into(),
            finding_ids: ids.to_vec(),
            counter_indications: vec![],
        }
    }

    #[test]
    fn test_parse_mining_rejects_unknown_findings() {
        let known: HashSet<String> = ["F-000001".to_string()].into();
        let ok = json!({"patterns": [{"mechanism": "m", "description": "d", "finding_ids": ["F-000001"]}]});
        assert!(parse_mining(ok, &known).is_ok());
        let bad = json!({"patterns": [{"mechanism": "m", "description": "d", "finding_ids": ["F-000042"]}]});
        assert!(parse_mining(bad, &known).unwrap_err().to_string().contains("F-000042"));
        let empty = json!({"patterns": [{"mechanism": " ", "description": "d", "finding_ids": ["F-000001"]}]});
        assert!(parse_mining(empty, &known).is_err());
    }

    #[test]
    fn test_mining_enforces_minimum_span() {
        let mut state = LayerState::default();
        let ids = seeded_findings(&mut state, &[("q1", true), ("q1", true), ("q2", true)]);
        let applied = apply_mining(
            &mut state,
            &stream(),
            3,
            MineOutput {
                patterns: vec![proposal(&ids)],
            },
            &MiningConfig::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(applied.produced, 0);
        assert!(state.patterns.is_empty());
        assert_eq!(state.cursor(Transition::Mine, &stream()).position, 3);
    }

    /// Supersede `id` with a fresh finding over the same outcome keys.
    fn supersede(state: &mut LayerState, id: &str) -> String {
        let old = state.findings[id].clone();
        let mut replacement = old.clone();
        replacement.superseded_by = None;
        let new_id = state.insert_finding(replacement);
        state.supersede_covering(&old.outcome_keys, &new_id);
        new_id
    }

    #[test]
    fn test_mining_span_ignores_superseded_findings() {
        let mut state = LayerState::default();
        let f1 = state.insert_finding(finding(&stream(), &["q1", "q2"], true));
        let f2 = state.insert_finding(finding(&stream(), &["q3"], true));
        // Superseded after the oracle was shown f2
        supersede(&mut state, &f2);

        let applied = apply_mining(
            &mut state,
            &stream(),
            3,
            MineOutput {
                patterns: vec![proposal(&[f1, f2])],
            },
            &MiningConfig::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(applied.produced, 0);
        assert!(state.patterns.is_empty());
    }

    #[test]
    fn test_merge_keeps_pattern_when_span_shrinks() {
        let mut state = LayerState::default();
        let ids = seeded_findings(&mut state, &[("q1", true), ("q2", true), ("q3", true)]);
        apply_mining(
            &mut state,
            &stream(),
            3,
            MineOutput {
                patterns: vec![proposal(&ids)],
            },
            &MiningConfig::default(),
            Utc::now(),
        )
        .unwrap();
        let before = state.patterns["P-000001"].clone();

        supersede(&mut state, &ids[0]);
        supersede(&mut state, &ids[1]);
        let extra = seeded_findings(&mut state, &[("q7", true)]);
        let applied = apply_mining(
            &mut state,
            &stream(),
            6,
            MineOutput {
                patterns: vec![proposal(&[ids[2].clone(), extra[0].clone()])],
            },
            &MiningConfig::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(applied.produced, 0);
        assert_eq!(state.patterns.len(), 1);
        assert_eq!(state.patterns["P-000001"], before);
    }

    #[test]
    fn test_mining_recomputes_counts_and_merges() {
        let mut state = LayerState::default();
        let first = seeded_findings(&mut state, &[("q1", true), ("q2", true), ("q3", false)]);
        let mut lying = proposal(&first);
        lying.description = "first".into();
        apply_mining(
            &mut state,
            &stream(),
            3,
            MineOutput {
                patterns: vec![lying],
            },
            &MiningConfig::default(),
            Utc::now(),
        )
        .unwrap();

        let p = &state.patterns["P-000001"];
        assert_eq!(p.observations, 3);
        assert_eq!(p.wins, 2);
        assert!((p.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(p.query_ids.len(), 3);

        // Same mechanism merges into the existing pattern
        let more = seeded_findings(&mut state, &[("q4", true), ("q5", true), ("q6", true)]);
        apply_mining(
            &mut state,
            &stream(),
            6,
            MineOutput {
                patterns: vec![proposal(&more)],
            },
            &MiningConfig::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(state.patterns.len(), 1);
        let p = &state.patterns["P-000001"];
        assert_eq!(p.finding_ids.len(), 6);
        assert_eq!(p.wins, 5);
        assert_eq!(p.revision, 2);
    }

    #[test]
    fn test_mining_deprecates_failing_pattern() {
        let mut state = LayerState::default();
        let specs: Vec<(String, bool)> = (0..10).map(|i| (format!("q{}", i), i < 2)).collect();
        let refs: Vec<(&str, bool)> = specs.iter().map(|(q, w)| (q.as_str(), *w)).collect();
        let ids = seeded_findings(&mut state, &refs);
        apply_mining(
            &mut state,
            &stream(),
            10,
            MineOutput {
                patterns: vec![proposal(&ids)],
            },
            &MiningConfig::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(state.patterns["P-000001"].status, PatternStatus::Deprecated);
    }

    // Promotion

    struct FixedExtractor;

    impl FeatureExtractor for FixedExtractor {
        fn extract(&self, _engine: &str, _sql: &str) -> Result<FeatureVector> {
            let vocab = FeatureVocabulary::standard();
            Ok(vocab.builder().set("table_count", 4i64)?.build())
        }
    }

    struct Graph {
        state: LayerState,
        outcomes: MemoryOutcomeStore,
        config: Config,
        vocab: FeatureVocabulary,
    }

    impl Graph {
        fn new() -> Self {
            let mut state = LayerState::default();
            let f = state.insert_finding(finding(&stream(), &["q1", "q2", "q3"], true));
            state.upsert_pattern(pattern("P-000001", &stream(), &[&f]));
            let outcomes = MemoryOutcomeStore::new();
            outcomes.append(fixtures::win("q1", "r1")).unwrap();
            Self {
                state,
                outcomes,
                config: Config::default(),
                vocab: FeatureVocabulary::standard(),
            }
        }

        fn promote(&mut self, output: PromoteOutput) -> Applied {
            self.promote_with(output, None)
        }

        fn promote_with(
            &mut self,
            output: PromoteOutput,
            extractor: Option<&dyn FeatureExtractor>,
        ) -> Applied {
            let ctx = PromotionContext {
                config: &self.config,
                vocabulary: &self.vocab,
                outcomes: &self.outcomes,
                extractor,
            };
            let batch = PatternBatch {
                from: 0,
                to: 1,
                patterns: vec![],
            };
            apply_promotion(&mut self.state, &ctx, &stream(), &batch, output, Utc::now()).unwrap()
        }
    }

    fn gap(title: &str, patterns: &[&str], rule: Option<Value>) -> ProposedEntry {
        ProposedEntry {
            kind: EntryKind::Gap,
            title: title.into(),
            description: format!("{} description", title),
            priority: crate::core::rules::Priority::High,
            gap_id: Some("gap_decorrelate".into()),
            source_patterns: patterns.iter().map(|s| s.to_string()).collect(),
            source_findings: vec![],
            detection_rule: rule,
        }
    }

    fn example(query: &str, speedup: Option<f64>) -> ProposedExample {
        ProposedExample {
            query_id: query.into(),
            source_outcome: Some(OutcomeKey::new(query, "r1", "w1")),
            original_sql: None,
            optimized_sql: None,
            speedup,
            transform: None,
            gap_ids: vec!["gap_decorrelate".into()],
            source_patterns: vec!["P-000001".into()],
        }
    }

    fn entries_only(entries: Vec<ProposedEntry>) -> PromoteOutput {
        PromoteOutput {
            entries,
            examples: vec![],
        }
    }

    #[test]
    fn test_evidence_gate_rejects_uncited_entry() {
        let mut g = Graph::new();
        let applied = g.promote(entries_only(vec![
            gap("no evidence", &[], None),
            gap("cited", &["P-000001"], None),
        ]));
        assert_eq!(applied.produced, 1);
        assert_eq!(g.state.entries.len(), 1);
        assert!(g.state.entries.values().all(|e| e.has_evidence()));
        assert!(applied
            .audit
            .iter()
            .any(|e| matches!(e, AuditEventType::EvidenceRejected { title, .. } if title == "no evidence")));
    }

    #[test]
    fn test_evidence_gate_checks_existence_when_required() {
        let mut g = Graph::new();
        let applied = g.promote(entries_only(vec![gap("ghost", &["P-000099"], None)]));
        assert_eq!(applied.produced, 0);

        g.config.evidence.required = false;
        let applied = g.promote(entries_only(vec![gap("ghost", &["P-000099"], None)]));
        assert_eq!(applied.produced, 1, "existence check relaxed");

        let applied = g.promote(entries_only(vec![gap("still empty", &[], None)]));
        assert_eq!(applied.produced, 0, "citation count never relaxed");
    }

    #[test]
    fn test_promotion_marks_patterns_and_bumps_version() {
        let mut g = Graph::new();
        g.promote(entries_only(vec![gap("decorrelation gap", &["P-000001"], None)]));
        assert_eq!(g.state.patterns["P-000001"].status, PatternStatus::Promoted);
        assert_eq!(g.state.published["duckdb"], KnowledgeVersion(1));
        assert_eq!(g.state.cursor(Transition::Promote, &stream()).position, 1);

        // Nothing written, no new version
        g.promote(entries_only(vec![]));
        assert_eq!(g.state.published["duckdb"], KnowledgeVersion(1));
    }

    #[test]
    fn test_bad_rule_is_stripped_and_audited() {
        let mut g = Graph::new();
        let bad = json!({
            "gap_id": "gap_decorrelate",
            "match": {"feature": "no_such_feature", "op": "==", "value": true}
        });
        let applied = g.promote(entries_only(vec![gap("with bad rule", &["P-000001"], Some(bad))]));
        assert_eq!(applied.produced, 1);
        let entry = g.state.entries.values().next().unwrap();
        assert!(entry.detection_rule.is_none());
        assert!(applied.audit.iter().any(|e| matches!(
            e,
            AuditEventType::RuleRejected { errors, .. } if errors[0].contains("unknown feature 'no_such_feature'")
        )));
    }

    #[test]
    fn test_good_rule_is_stored() {
        let mut g = Graph::new();
        let rule = json!({
            "gap_id": "gap_decorrelate",
            "priority": "high",
            "match": {"ALL": [
                {"feature": "has_correlated_subquery", "op": "==", "value": true},
                {"feature": "table_count", "op": ">=", "value": 3}
            ]}
        });
        g.promote(entries_only(vec![gap("with rule", &["P-000001"], Some(rule))]));
        let entry = g.state.entries.values().next().unwrap();
        assert!(entry.detection_rule.is_some());
    }

    #[test]
    fn test_rule_for_another_gap_is_rejected() {
        let mut g = Graph::new();
        let rule = json!({
            "gap_id": "gap_other",
            "match": {"feature": "has_exists", "op": "==", "value": true}
        });
        let applied = g.promote(entries_only(vec![gap("mismatch", &["P-000001"], Some(rule))]));
        assert!(g.state.entries.values().next().unwrap().detection_rule.is_none());
        assert_eq!(applied.audit.len(), 1);
    }

    #[test]
    fn test_human_reviewed_entry_records_conflict() {
        let mut g = Graph::new();
        let mut reviewed = entry("K-000001", "duckdb", EntryKind::Gap, &["P-000001"]);
        reviewed.title = "Curated gap".into();
        reviewed.description = "hand written".into();
        reviewed.human_reviewed = true;
        g.state.upsert_entry(reviewed).unwrap();
        g.state.insert_finding(finding(&stream(), &["q7"], true));

        let mut proposal = gap("curated GAP", &["P-000001"], None);
        proposal.source_findings = vec!["F-000002".into()];
        let applied = g.promote(entries_only(vec![proposal.clone()]));

        let kept = &g.state.entries["K-000001"];
        assert_eq!(kept.description, "hand written");
        assert!(kept.human_reviewed);
        assert_eq!(kept.conflicts.len(), 1);
        assert_eq!(kept.source_findings, vec!["F-000002"]);
        assert!(applied
            .audit
            .iter()
            .any(|e| e.event_name() == "conflict_recorded"));

        g.config.promotion.allow_human_override = true;
        g.promote(entries_only(vec![proposal]));
        let overwritten = &g.state.entries["K-000001"];
        assert_eq!(overwritten.description, "curated GAP description");
        assert!(!overwritten.human_reviewed);
    }

    #[test]
    fn test_example_takes_features_and_sql_from_outcome() {
        let mut g = Graph::new();
        let vocab = FeatureVocabulary::standard();
        let fv = vocab.builder().set("table_count", 5i64).unwrap().build();
        g.outcomes
            .append(fixtures::win("q2", "r1").with_features(fv))
            .unwrap();

        let applied = g.promote(PromoteOutput {
            entries: vec![],
            examples: vec![example("q2", None)],
        });
        assert_eq!(applied.produced, 1);
        let ex = &g.state.examples["G-000001"];
        assert_eq!(ex.original_sql, "SELECT 1");
        assert_eq!(ex.speedup, 2.0);
        assert_eq!(ex.features.number("table_count"), Some(5.0));
    }

    #[test]
    fn test_example_without_features_needs_extractor() {
        let mut g = Graph::new();
        let applied = g.promote(PromoteOutput {
            entries: vec![],
            examples: vec![example("q1", None)],
        });
        assert_eq!(applied.produced, 0);
        assert!(applied
            .audit
            .iter()
            .any(|e| matches!(e, AuditEventType::ExampleRejected { reason, .. } if reason.contains("feature vector"))));

        let applied = g.promote_with(
            PromoteOutput {
                entries: vec![],
                examples: vec![example("q1", None)],
            },
            Some(&FixedExtractor),
        );
        assert_eq!(applied.produced, 1);
        assert_eq!(
            g.state.examples["G-000001"].features.number("table_count"),
            Some(4.0)
        );
    }

    #[test]
    fn test_faster_example_supersedes_slower() {
        let mut g = Graph::new();
        g.promote_with(
            PromoteOutput {
                entries: vec![],
                examples: vec![example("q1", Some(1.5))],
            },
            Some(&FixedExtractor),
        );
        let applied = g.promote_with(
            PromoteOutput {
                entries: vec![],
                examples: vec![example("q1", Some(1.2))],
            },
            Some(&FixedExtractor),
        );
        assert_eq!(applied.produced, 0, "slower example rejected");

        g.promote_with(
            PromoteOutput {
                entries: vec![],
                examples: vec![example("q1", Some(3.0))],
            },
            Some(&FixedExtractor),
        );
        assert_eq!(
            g.state.examples["G-000001"].status,
            ExampleStatus::Superseded {
                by: "G-000002".into()
            }
        );
        assert!(g.state.examples["G-000002"].is_active());
    }

    #[test]
    fn test_example_without_sql_is_rejected() {
        let mut g = Graph::new();
        let mut no_source = example("q5", Some(2.0));
        no_source.source_outcome = None;
        let applied = g.promote_with(
            PromoteOutput {
                entries: vec![],
                examples: vec![no_source],
            },
            Some(&FixedExtractor),
        );
        assert_eq!(applied.produced, 0);
    }
}
