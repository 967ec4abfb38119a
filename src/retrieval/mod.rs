//! Gold-example retrieval.

pub mod scorer;

pub use scorer::{rank, rank_examples, score, weights, ScoredExample};
