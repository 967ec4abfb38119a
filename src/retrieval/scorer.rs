//! Similarity scoring for gold examples.
//!
//! Examples are ranked against the incoming query's feature vector and the
//! gaps its detection rules triggered:
//!
//! - Gap overlap: 5.0 per distinct shared gap id
//! - Archetype match: 1.0
//! - Star-schema match: 1.0
//! - Table count proximity: `max(0, 1.0 - 0.2 * |delta|)`
//!
//! Terms are summed. A term whose feature is unset on either side
//! contributes 0. Scores depend on the query's own vector, so results are
//! never cached across queries.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::features::FeatureVector;
use crate::core::knowledge::GoldExample;

/// Score weights.
pub mod weights {
    /// Weight per gap id shared between the query and the example.
    pub const GAP_OVERLAP: f64 = 5.0;
    /// Weight for an identical archetype.
    pub const ARCHETYPE: f64 = 1.0;
    /// Weight for an identical star-schema flag.
    pub const STAR_SCHEMA: f64 = 1.0;
    /// Full table-count credit when the counts are equal.
    pub const TABLE_COUNT: f64 = 1.0;
    /// Credit lost per table of difference.
    pub const TABLE_COUNT_DECAY: f64 = 0.2;
}

/// Score one example against a query.
pub fn score(features: &FeatureVector, gaps: &[String], example: &GoldExample) -> f64 {
    let overlap = example
        .gap_ids
        .iter()
        .filter(|g| gaps.contains(g))
        .collect::<BTreeSet<_>>()
        .len();
    let mut total = weights::GAP_OVERLAP * overlap as f64;

    if let (Some(a), Some(b)) = (
        features.text("archetype"),
        example.features.text("archetype"),
    ) {
        if a == b {
            total += weights::ARCHETYPE;
        }
    }

    if let (Some(a), Some(b)) = (
        features.flag("is_star_schema"),
        example.features.flag("is_star_schema"),
    ) {
        if a == b {
            total += weights::STAR_SCHEMA;
        }
    }

    if let (Some(a), Some(b)) = (
        features.number("table_count"),
        example.features.number("table_count"),
    ) {
        total += (weights::TABLE_COUNT - weights::TABLE_COUNT_DECAY * (a - b).abs()).max(0.0);
    }

    total
}

/// An example with its computed score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredExample {
    pub example: GoldExample,
    pub score: f64,
}

impl ScoredExample {
    pub fn new(example: GoldExample, score: f64) -> Self {
        Self { example, score }
    }
}

/// Rank active examples for a query.
///
/// Returns the top `k` by score descending, ties broken by example id
/// ascending. Zero-scored examples are kept; an engine's examples are
/// all candidates.
pub fn rank(
    features: &FeatureVector,
    gaps: &[String],
    examples: &[GoldExample],
    k: usize,
) -> Vec<ScoredExample> {
    let mut scored: Vec<ScoredExample> = examples
        .iter()
        .filter(|e| e.is_active())
        .map(|e| ScoredExample::new(e.clone(), score(features, gaps, e)))
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.example.id.cmp(&b.example.id))
    });
    scored.truncate(k);
    scored
}

/// Rank and return only the examples.
pub fn rank_examples(
    features: &FeatureVector,
    gaps: &[String],
    examples: &[GoldExample],
    k: usize,
) -> Vec<GoldExample> {
    rank(features, gaps, examples, k)
        .into_iter()
        .map(|s| s.example)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::FeatureVocabulary;
    use crate::core::knowledge::ExampleStatus;
    use chrono::Utc;

    fn vector(archetype: Option<&str>, star: Option<bool>, tables: Option<i64>) -> FeatureVector {
        let vocab = FeatureVocabulary::standard();
        let mut builder = vocab.builder();
        if let Some(a) = archetype {
            builder = builder.set("archetype", a).unwrap();
        }
        if let Some(s) = star {
            builder = builder.set("is_star_schema", s).unwrap();
        }
        if let Some(t) = tables {
            builder = builder.set("table_count", t).unwrap();
        }
        builder.build()
    }

    fn example(id: &str, gaps: &[&str], features: FeatureVector) -> GoldExample {
        GoldExample {
            id: id.to_string(),
            engine: "duckdb".into(),
            query_id: format!("q-{}", id),
            original_sql: "SELECT 1".into(),
            optimized_sql: "SELECT 1".into(),
            speedup: 2.0,
            transform: None,
            gap_ids: gaps.iter().map(|s| s.to_string()).collect(),
            source_patterns: vec!["P-000001".into()],
            source_outcome: None,
            features,
            status: ExampleStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn gaps(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_full_score() {
        let query = vector(Some("star_join"), Some(true), Some(6));
        let ex = example("G-000001", &["g1", "g2"], vector(Some("star_join"), Some(true), Some(4)));
        let s = score(&query, &gaps(&["g1", "g2", "g3"]), &ex);
        // 2 gaps * 5 + archetype + star + (1 - 0.4)
        assert!((s - 12.6).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_gap_ids_count_once() {
        let query = vector(None, None, None);
        let ex = example("G-000001", &["g1", "g1", "g2"], vector(None, None, None));
        assert_eq!(score(&query, &gaps(&["g1"]), &ex), 5.0);
        assert_eq!(score(&query, &gaps(&["g1", "g1", "g2"]), &ex), 10.0);
    }

    #[test]
    fn test_unset_features_contribute_nothing() {
        let query = vector(None, None, None);
        let ex = example("G-000001", &[], vector(Some("star_join"), Some(true), Some(4)));
        assert_eq!(score(&query, &[], &ex), 0.0);

        let query = vector(Some("star_join"), Some(false), Some(4));
        let ex = example("G-000001", &[], vector(None, None, None));
        assert_eq!(score(&query, &[], &ex), 0.0);
    }

    #[test]
    fn test_star_schema_false_matches_false() {
        let query = vector(None, Some(false), None);
        let ex = example("G-000001", &[], vector(None, Some(false), None));
        assert!((score(&query, &[], &ex) - weights::STAR_SCHEMA).abs() < 1e-9);
    }

    #[test]
    fn test_table_count_term_floors_at_zero() {
        let query = vector(None, None, Some(2));
        let ex = example("G-000001", &[], vector(None, None, Some(20)));
        assert_eq!(score(&query, &[], &ex), 0.0);
    }

    #[test]
    fn test_rank_orders_by_score_then_id() {
        let query = vector(Some("star_join"), None, None);
        let examples = vec![
            example("G-000003", &[], vector(Some("star_join"), None, None)),
            example("G-000001", &[], vector(Some("star_join"), None, None)),
            example("G-000002", &["g1"], vector(None, None, None)),
            example("G-000004", &[], vector(None, None, None)),
        ];

        let ranked = rank(&query, &gaps(&["g1"]), &examples, 3);
        let ids: Vec<&str> = ranked.iter().map(|s| s.example.id.as_str()).collect();
        assert_eq!(ids, vec!["G-000002", "G-000001", "G-000003"]);
    }

    #[test]
    fn test_rank_skips_inactive() {
        let query = vector(None, None, None);
        let mut retired = example("G-000001", &[], vector(None, None, None));
        retired.status = ExampleStatus::Superseded {
            by: "G-000002".into(),
        };
        let examples = vec![retired, example("G-000002", &[], vector(None, None, None))];
        let ranked = rank_examples(&query, &[], &examples, 5);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, "G-000002");
    }

    #[test]
    fn test_rank_empty_and_zero_k() {
        let query = vector(None, None, None);
        assert!(rank(&query, &[], &[], 3).is_empty());
        let examples = vec![example("G-000001", &[], vector(None, None, None))];
        assert!(rank(&query, &[], &examples, 0).is_empty());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Property: ranking is deterministic and independent of input order
            #[test]
            fn prop_rank_is_order_independent(
                specs in prop::collection::vec((0u8..4, any::<bool>(), 0i64..12), 1..12),
                qt in 0i64..12,
            ) {
                let examples: Vec<GoldExample> = specs
                    .iter()
                    .enumerate()
                    .map(|(i, (g, star, t))| {
                        let gap = format!("g{}", g);
                        example(&format!("G-{:06}", i + 1), &[gap.as_str()], vector(None, Some(*star), Some(*t)))
                    })
                    .collect();
                let query = vector(None, Some(true), Some(qt));
                let triggered = gaps(&["g1"]);

                let forward = rank(&query, &triggered, &examples, 5);
                let mut reversed_input = examples.clone();
                reversed_input.reverse();
                let backward = rank(&query, &triggered, &reversed_input, 5);

                let a: Vec<&str> = forward.iter().map(|s| s.example.id.as_str()).collect();
                let b: Vec<&str> = backward.iter().map(|s| s.example.id.as_str()).collect();
                prop_assert_eq!(a, b);
                for pair in forward.windows(2) {
                    prop_assert!(pair[0].score >= pair[1].score);
                }
            }
        }
    }
}
