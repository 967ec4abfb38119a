//! Per-engine snapshot cache for the query path.
//!
//! Each engine maps to one `Arc<KnowledgeSnapshot>`. A promotion commit
//! installs a new `Arc` in place of the old one; readers holding the old
//! `Arc` keep a consistent view. Entries older than the TTL are refreshed
//! from the layer store's published snapshot on the next read.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::core::knowledge::{KnowledgeSnapshot, KnowledgeVersion};
use crate::storage::layers::LayerStore;

#[derive(Debug, Clone)]
struct Cached {
    snapshot: Arc<KnowledgeSnapshot>,
    loaded_at: Instant,
}

/// Snapshot cache keyed by engine.
#[derive(Debug)]
pub struct SnapshotCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, Cached>>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_seconds))
    }

    /// Swap in a snapshot for its engine.
    ///
    /// A snapshot older than the one already cached is ignored, so a slow
    /// refresh can never roll readers back.
    pub fn install(&self, snapshot: Arc<KnowledgeSnapshot>) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            tracing::warn!(engine = %snapshot.engine, "snapshot cache lock poisoned");
            return false;
        };
        if let Some(current) = entries.get(&snapshot.engine) {
            if current.snapshot.version > snapshot.version {
                tracing::debug!(
                    engine = %snapshot.engine,
                    cached = %current.snapshot.version,
                    offered = %snapshot.version,
                    "ignoring older snapshot"
                );
                return false;
            }
        }
        tracing::debug!(engine = %snapshot.engine, version = %snapshot.version, "snapshot installed");
        entries.insert(
            snapshot.engine.clone(),
            Cached {
                snapshot,
                loaded_at: Instant::now(),
            },
        );
        true
    }

    /// Cached snapshot regardless of age.
    pub fn get(&self, engine: &str) -> Option<Arc<KnowledgeSnapshot>> {
        self.entries
            .read()
            .ok()?
            .get(engine)
            .map(|c| Arc::clone(&c.snapshot))
    }

    /// Cached snapshot, refreshed from `layers` once the TTL has passed.
    ///
    /// A stale entry is still served when the store has nothing newer.
    pub fn get_or_refresh(&self, engine: &str, layers: &LayerStore) -> Option<Arc<KnowledgeSnapshot>> {
        let cached = self
            .entries
            .read()
            .ok()
            .and_then(|entries| entries.get(engine).cloned());

        if let Some(cached) = &cached {
            if cached.loaded_at.elapsed() < self.ttl {
                return Some(Arc::clone(&cached.snapshot));
            }
        }

        match layers.published(engine) {
            Some(fresh) => {
                self.install(Arc::clone(&fresh));
                self.get(engine).or(Some(fresh))
            }
            None => cached.map(|c| c.snapshot),
        }
    }

    /// Version currently cached for an engine.
    pub fn version(&self, engine: &str) -> Option<KnowledgeVersion> {
        self.get(engine).map(|s| s.version)
    }

    /// Drop an engine's entry.
    pub fn invalidate(&self, engine: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(engine);
        }
    }

    /// Engines with a cached snapshot, sorted.
    pub fn engines(&self) -> Vec<String> {
        let mut engines: Vec<String> = self
            .entries
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        engines.sort();
        engines
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::FeatureVocabulary;
    use crate::core::knowledge::EntryKind;
    use crate::core::outcome::StreamId;
    use crate::storage::layers::fixtures::{entry, finding, pattern};

    fn snapshot(engine: &str, version: u64) -> Arc<KnowledgeSnapshot> {
        Arc::new(KnowledgeSnapshot::empty(engine, KnowledgeVersion(version)))
    }

    fn published_store() -> LayerStore {
        let layers = LayerStore::in_memory(FeatureVocabulary::standard());
        let stream = StreamId::new("duckdb", "tpcds");
        layers
            .transact(|state| {
                let f = state.insert_finding(finding(&stream, &["q1"], true));
                state.upsert_pattern(pattern("P-000001", &stream, &[&f]));
                state.upsert_entry(entry("K-000001", "duckdb", EntryKind::Gap, &["P-000001"]))?;
                state.bump_knowledge_version("duckdb");
                Ok(())
            })
            .unwrap();
        layers.publish("duckdb").unwrap();
        layers
    }

    #[test]
    fn test_install_and_get() {
        let cache = SnapshotCache::default();
        assert!(cache.get("duckdb").is_none());
        assert!(cache.install(snapshot("duckdb", 1)));
        assert_eq!(cache.version("duckdb"), Some(KnowledgeVersion(1)));
        assert_eq!(cache.engines(), vec!["duckdb"]);
    }

    #[test]
    fn test_older_snapshot_is_ignored() {
        let cache = SnapshotCache::default();
        cache.install(snapshot("duckdb", 5));
        assert!(!cache.install(snapshot("duckdb", 3)));
        assert_eq!(cache.version("duckdb"), Some(KnowledgeVersion(5)));
        assert!(cache.install(snapshot("duckdb", 6)));
    }

    #[test]
    fn test_readers_keep_their_snapshot_across_swap() {
        let cache = SnapshotCache::default();
        cache.install(snapshot("duckdb", 1));
        let held = cache.get("duckdb").unwrap();
        cache.install(snapshot("duckdb", 2));
        assert_eq!(held.version, KnowledgeVersion(1));
        assert_eq!(cache.version("duckdb"), Some(KnowledgeVersion(2)));
    }

    #[test]
    fn test_expired_entry_refreshes_from_store() {
        let layers = published_store();
        let cache = SnapshotCache::new(Duration::ZERO);
        cache.install(snapshot("duckdb", 0));

        let got = cache.get_or_refresh("duckdb", &layers).unwrap();
        assert_eq!(got.version, KnowledgeVersion(1));
        assert_eq!(got.profile.gaps.len(), 1);
    }

    #[test]
    fn test_cold_engine_loads_from_store() {
        let layers = published_store();
        let cache = SnapshotCache::default();
        assert!(cache.get_or_refresh("duckdb", &layers).is_some());
        assert!(cache.get_or_refresh("postgres", &layers).is_none());
    }

    #[test]
    fn test_fresh_entry_skips_store() {
        let layers = LayerStore::in_memory(FeatureVocabulary::standard());
        let cache = SnapshotCache::default();
        cache.install(snapshot("duckdb", 9));
        assert_eq!(
            cache.get_or_refresh("duckdb", &layers).unwrap().version,
            KnowledgeVersion(9)
        );
    }

    #[test]
    fn test_concurrent_install_and_read_is_monotonic() {
        let cache = Arc::new(SnapshotCache::default());
        cache.install(snapshot("duckdb", 0));

        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for v in 1..=200 {
                    cache.install(snapshot("duckdb", v));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..500 {
                        let v = cache.get("duckdb").unwrap().version.0;
                        assert!(v >= last, "version went backwards: {} < {}", v, last);
                        last = v;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(cache.version("duckdb"), Some(KnowledgeVersion(200)));
    }
}
