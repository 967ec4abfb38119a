//! The reasoning oracle behind the derivation stages.
//!
//! Stages hand the oracle a typed request and get back untyped JSON, which
//! they validate before anything is committed. [`HeuristicOracle`] is a
//! deterministic stand-in that derives findings, patterns and entries from
//! plain counting; production deployments plug in their own [`Oracle`].

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::features::FeatureVector;
use crate::core::knowledge::{CounterIndication, EntryKind, Finding, GoldExample, KnowledgeEntry, Pattern};
use crate::core::outcome::{Conditions, OutcomeKey, StoredOutcome, StreamId};
use crate::core::rules::Priority;
use crate::error::Result;

/// Input to one oracle call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum OracleRequest {
    Extract {
        stream: StreamId,
        existing_findings: Vec<Finding>,
        batch: Vec<StoredOutcome>,
    },
    Mine {
        stream: StreamId,
        existing_patterns: Vec<Pattern>,
        findings: Vec<Finding>,
    },
    Promote {
        stream: StreamId,
        patterns: Vec<Pattern>,
        findings: Vec<Finding>,
        entries: Vec<KnowledgeEntry>,
        examples: Vec<GoldExample>,
    },
}

impl OracleRequest {
    pub fn stage_name(&self) -> &'static str {
        match self {
            OracleRequest::Extract { .. } => "extraction",
            OracleRequest::Mine { .. } => "mining",
            OracleRequest::Promote { .. } => "promotion",
        }
    }
}

/// Strategy for the derivation stages.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Produce the stage output for a request as JSON.
    async fn invoke(&self, request: &OracleRequest) -> Result<Value>;
}

/// Computes the feature vector of a SQL text.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, engine: &str, sql: &str) -> Result<FeatureVector>;
}

// =============================================================================
// Stage outputs
// =============================================================================

/// Extraction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractOutput {
    pub findings: Vec<ProposedFinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedFinding {
    pub outcome_keys: Vec<OutcomeKey>,
    pub observation: String,
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub conditions: Option<Conditions>,
}

/// Mining output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MineOutput {
    pub patterns: Vec<ProposedPattern>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedPattern {
    pub mechanism: String,
    pub description: String,
    pub finding_ids: Vec<String>,
    #[serde(default)]
    pub counter_indications: Vec<CounterIndication>,
}

/// Promotion output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoteOutput {
    #[serde(default)]
    pub entries: Vec<ProposedEntry>,
    #[serde(default)]
    pub examples: Vec<ProposedExample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEntry {
    pub kind: EntryKind,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub gap_id: Option<String>,
    #[serde(default)]
    pub source_patterns: Vec<String>,
    #[serde(default)]
    pub source_findings: Vec<String>,
    /// Kept untyped so one malformed rule does not sink the whole output.
    #[serde(default)]
    pub detection_rule: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedExample {
    pub query_id: String,
    #[serde(default)]
    pub source_outcome: Option<OutcomeKey>,
    #[serde(default)]
    pub original_sql: Option<String>,
    #[serde(default)]
    pub optimized_sql: Option<String>,
    #[serde(default)]
    pub speedup: Option<f64>,
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub gap_ids: Vec<String>,
    #[serde(default)]
    pub source_patterns: Vec<String>,
}

// =============================================================================
// Heuristic oracle
// =============================================================================

/// Deterministic oracle built on counting.
///
/// - Extraction: one finding per `(query, transform)` in the batch.
/// - Mining: one pattern per transform, citing every finding that used it;
///   losing findings become counter-indications keyed by archetype.
/// - Promotion: one gap entry per pattern, with a detection rule on the
///   archetype when all cited findings agree on one, plus the best winning
///   finding as a gold example.
#[derive(Debug, Clone, Default)]
pub struct HeuristicOracle;

impl HeuristicOracle {
    pub fn new() -> Self {
        Self
    }

    fn extract(batch: &[StoredOutcome]) -> ExtractOutput {
        let mut groups: BTreeMap<(String, String), Vec<&StoredOutcome>> = BTreeMap::new();
        for record in batch {
            let transform = record
                .outcome
                .transform
                .clone()
                .unwrap_or_else(|| "unclassified".to_string());
            groups
                .entry((record.outcome.query_id.clone(), transform))
                .or_default()
                .push(record);
        }

        let findings = groups
            .into_iter()
            .map(|((query_id, transform), records)| {
                let wins = records.iter().filter(|r| r.outcome.is_validated_win()).count();
                let best = records
                    .iter()
                    .filter_map(|r| r.outcome.speedup)
                    .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))));
                let observation = match best {
                    Some(best) => format!(
                        "{} on {}: {} of {} runs succeeded, best speedup {:.2}x",
                        transform,
                        query_id,
                        wins,
                        records.len(),
                        best
                    ),
                    None => format!(
                        "{} on {}: {} of {} runs succeeded",
                        transform,
                        query_id,
                        wins,
                        records.len()
                    ),
                };
                ProposedFinding {
                    outcome_keys: records.iter().map(|r| r.outcome.key()).collect(),
                    observation,
                    transform: Some(transform),
                    conditions: records.first().map(|r| r.outcome.conditions.clone()),
                }
            })
            .collect();

        ExtractOutput { findings }
    }

    fn mine(findings: &[Finding]) -> MineOutput {
        let mut groups: BTreeMap<String, Vec<&Finding>> = BTreeMap::new();
        for finding in findings {
            let mechanism = finding
                .transform
                .clone()
                .unwrap_or_else(|| "unclassified".to_string());
            groups.entry(mechanism).or_default().push(finding);
        }

        let patterns = groups
            .into_iter()
            .map(|(mechanism, group)| {
                let queries: BTreeSet<&String> =
                    group.iter().flat_map(|f| f.query_ids.iter()).collect();
                let mut losses: BTreeMap<String, usize> = BTreeMap::new();
                for finding in group.iter().filter(|f| !f.win) {
                    let archetype = finding
                        .conditions
                        .archetype
                        .clone()
                        .unwrap_or_else(|| "unclassified".to_string());
                    *losses.entry(archetype).or_insert(0) += 1;
                }
                ProposedPattern {
                    description: format!(
                        "{} observed across {} queries",
                        mechanism,
                        queries.len()
                    ),
                    finding_ids: group.iter().map(|f| f.id.clone()).collect(),
                    counter_indications: losses
                        .into_iter()
                        .map(|(archetype, n)| CounterIndication {
                            pattern: archetype,
                            reason: format!("{} failed to improve {} finding(s)", mechanism, n),
                            regressed_example_ids: Vec::new(),
                        })
                        .collect(),
                    mechanism,
                }
            })
            .collect();

        MineOutput { patterns }
    }

    fn promote(patterns: &[Pattern], findings: &[Finding]) -> Value {
        let by_id: BTreeMap<&str, &Finding> = findings.iter().map(|f| (f.id.as_str(), f)).collect();
        let mut entries = Vec::new();
        let mut examples = Vec::new();

        for pattern in patterns {
            let cited: Vec<&Finding> = pattern
                .finding_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).copied())
                .collect();
            let gap_id = format!("gap_{}", slug(&pattern.mechanism));
            let priority = if pattern.success_rate >= 0.9 && pattern.wins >= 10 {
                Priority::High
            } else {
                Priority::Medium
            };

            let archetypes: BTreeSet<&str> = cited
                .iter()
                .filter_map(|f| f.conditions.archetype.as_deref())
                .collect();
            let rule = match archetypes.iter().next() {
                Some(archetype) if archetypes.len() == 1 => Some(json!({
                    "gap_id": gap_id,
                    "priority": priority,
                    "match": {"feature": "archetype", "op": "==", "value": archetype},
                })),
                _ => None,
            };

            entries.push(json!({
                "kind": "gap",
                "title": format!("{} opportunity on {}", pattern.mechanism, pattern.engine),
                "description": pattern.description,
                "priority": priority,
                "gap_id": gap_id,
                "source_patterns": [pattern.id],
                "source_findings": pattern.finding_ids,
                "detection_rule": rule,
            }));

            let best = cited
                .iter()
                .filter(|f| f.win)
                .filter_map(|f| f.best_speedup.map(|s| (s, *f)))
                .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            if let Some((speedup, finding)) = best {
                if let Some(query_id) = finding.query_ids.iter().next() {
                    examples.push(json!({
                        "query_id": query_id,
                        "source_outcome": finding.outcome_keys.first(),
                        "speedup": speedup,
                        "transform": finding.transform,
                        "gap_ids": [gap_id],
                        "source_patterns": [pattern.id],
                    }));
                }
            }
        }

        json!({ "entries": entries, "examples": examples })
    }
}

#[async_trait]
impl Oracle for HeuristicOracle {
    async fn invoke(&self, request: &OracleRequest) -> Result<Value> {
        let output = match request {
            OracleRequest::Extract { batch, .. } => serde_json::to_value(Self::extract(batch))?,
            OracleRequest::Mine { findings, .. } => serde_json::to_value(Self::mine(findings))?,
            OracleRequest::Promote {
                patterns, findings, ..
            } => Self::promote(patterns, findings),
        };
        Ok(output)
    }
}

fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::outcome::fixtures;
    use crate::storage::layers::fixtures::{finding, pattern};

    fn stream() -> StreamId {
        StreamId::new("duckdb", "tpcds")
    }

    fn stored(seq: u64, outcome: crate::core::outcome::Outcome) -> StoredOutcome {
        StoredOutcome { seq, outcome }
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Decorrelate Subquery"), "decorrelate_subquery");
        assert_eq!(slug("--or->union--"), "or_union");
    }

    #[tokio::test]
    async fn test_heuristic_extract_groups_by_query_and_transform() {
        let request = OracleRequest::Extract {
            stream: stream(),
            existing_findings: vec![],
            batch: vec![
                stored(1, fixtures::win("q1", "r1")),
                stored(2, fixtures::regression("q1", "r2")),
                stored(3, fixtures::win("q2", "r1")),
            ],
        };
        let value = HeuristicOracle::new().invoke(&request).await.unwrap();
        let output: ExtractOutput = serde_json::from_value(value).unwrap();
        assert_eq!(output.findings.len(), 2);
        assert_eq!(output.findings[0].outcome_keys.len(), 2);
        assert!(output.findings[0].observation.contains("1 of 2 runs"));
        assert_eq!(output.findings[0].transform.as_deref(), Some("decorrelate"));
    }

    #[tokio::test]
    async fn test_heuristic_mine_collects_counter_indications() {
        let mut won = finding(&stream(), &["q1", "q2"], true);
        won.id = "F-000001".into();
        let mut lost = finding(&stream(), &["q3"], false);
        lost.id = "F-000002".into();
        lost.conditions.archetype = Some("star_join".into());

        let request = OracleRequest::Mine {
            stream: stream(),
            existing_patterns: vec![],
            findings: vec![won, lost],
        };
        let value = HeuristicOracle::new().invoke(&request).await.unwrap();
        let output: MineOutput = serde_json::from_value(value).unwrap();
        assert_eq!(output.patterns.len(), 1);
        let p = &output.patterns[0];
        assert_eq!(p.mechanism, "decorrelate");
        assert_eq!(p.finding_ids, vec!["F-000001", "F-000002"]);
        assert_eq!(p.counter_indications.len(), 1);
        assert_eq!(p.counter_indications[0].pattern, "star_join");
    }

    #[tokio::test]
    async fn test_heuristic_promote_builds_entry_rule_and_example() {
        let mut f = finding(&stream(), &["q1"], true);
        f.id = "F-000001".into();
        f.conditions.archetype = Some("star_join".into());
        let p = pattern("P-000001", &stream(), &["F-000001"]);

        let request = OracleRequest::Promote {
            stream: stream(),
            patterns: vec![p],
            findings: vec![f],
            entries: vec![],
            examples: vec![],
        };
        let value = HeuristicOracle::new().invoke(&request).await.unwrap();
        let output: PromoteOutput = serde_json::from_value(value).unwrap();

        assert_eq!(output.entries.len(), 1);
        let entry = &output.entries[0];
        assert_eq!(entry.kind, EntryKind::Gap);
        assert_eq!(entry.gap_id.as_deref(), Some("gap_decorrelation"));
        assert_eq!(entry.source_patterns, vec!["P-000001"]);
        let rule = entry.detection_rule.as_ref().unwrap();
        assert_eq!(rule["match"]["value"], "star_join");

        assert_eq!(output.examples.len(), 1);
        assert_eq!(output.examples[0].query_id, "q1");
        assert_eq!(output.examples[0].source_outcome, Some(OutcomeKey::new("q1", "r1", "w1")));
    }

    #[test]
    fn test_request_serializes_with_stage_tag() {
        let request = OracleRequest::Mine {
            stream: stream(),
            existing_patterns: vec![],
            findings: vec![],
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""stage":"mine""#));
        assert_eq!(request.stage_name(), "mining");
    }
}
