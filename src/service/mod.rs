//! Service boundaries: the query path and the ingest path.

pub mod cache;
pub mod fallback;
pub mod ingest;
pub mod query;

pub use cache::SnapshotCache;
pub use fallback::{
    FallbackContext, KnowledgeClient, KnowledgeOrigin, ServedKnowledge, StaticKnowledge,
    StaticKnowledgeSource, StaticProfiles,
};
pub use ingest::{IngestAck, IngestService};
pub use query::{KnowledgeQuery, KnowledgeResponse, QueryService};
