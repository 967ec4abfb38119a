//! Layer store for derived knowledge (Layers 2 through 4).
//!
//! All derived records live in id-indexed arenas inside one [`LayerState`],
//! together with the derivation cursors, dead letters and published
//! knowledge versions. Every change goes through [`LayerStore::transact`]:
//! the closure edits a private copy of the state, the copy is persisted
//! atomically to `knowledge.json`, and only then does it replace the live
//! state. A failing closure or a failing write leaves nothing behind, so a
//! stage's output and its advanced cursor commit together or not at all.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::features::FeatureVocabulary;
use crate::core::knowledge::{
    format_id, Constraint, EngineProfile, EntryKind, Finding, GoldExample, KnowledgeEntry,
    KnowledgeSnapshot, KnowledgeVersion, Pattern, ENTRY_PREFIX, EXAMPLE_PREFIX, FINDING_PREFIX,
    PATTERN_PREFIX,
};
use crate::core::outcome::{OutcomeKey, StreamId};
use crate::core::rules;
use crate::error::{Result, StratumError};
use crate::util::{read_to_string_limited, write_json_atomic};

/// Schema version of `knowledge.json`.
pub const LAYER_SCHEMA_VERSION: u32 = 1;

/// Id prefix for dead letters.
pub const DEAD_LETTER_PREFIX: &str = "D";

/// A layer transition, one per derivation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Layer 1 → Layer 2.
    Extract,
    /// Layer 2 → Layer 3.
    Mine,
    /// Layer 3 → Layer 4.
    Promote,
}

impl Transition {
    pub const ALL: [Transition; 3] = [Transition::Extract, Transition::Mine, Transition::Promote];

    pub fn as_str(self) -> &'static str {
        match self {
            Transition::Extract => "extract",
            Transition::Mine => "mine",
            Transition::Promote => "promote",
        }
    }

    /// Name of the derivation stage run by this transition.
    pub fn stage_name(self) -> &'static str {
        match self {
            Transition::Extract => "extraction",
            Transition::Mine => "mining",
            Transition::Promote => "promotion",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn cursor_key(transition: Transition, stream: &StreamId) -> String {
    format!("{}:{}", transition, stream)
}

/// Position of one transition on one stream.
///
/// The unit depends on the transition: outcome sequence for extraction,
/// finding sequence for mining, pattern revision for promotion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub position: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

/// A batch parked after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub transition: Transition,
    pub engine: String,
    pub benchmark: String,
    /// Cursor position the batch started after.
    pub from_position: u64,
    /// Last position the batch covered.
    pub to_position: u64,
    pub attempts: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn stream(&self) -> StreamId {
        StreamId::new(&self.engine, &self.benchmark)
    }
}

/// Monotonic counters behind ids, sequences and versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    pub finding: u64,
    pub pattern: u64,
    pub entry: u64,
    pub example: u64,
    pub dead_letter: u64,
    /// Store-wide revision bumped on every pattern or entry upsert.
    pub revision: u64,
    pub knowledge_version: u64,
}

/// Everything derived from the outcome log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerState {
    pub schema_version: u32,
    pub counters: Counters,
    pub findings: BTreeMap<String, Finding>,
    pub patterns: BTreeMap<String, Pattern>,
    pub entries: BTreeMap<String, KnowledgeEntry>,
    pub examples: BTreeMap<String, GoldExample>,
    pub cursors: BTreeMap<String, Cursor>,
    pub dead_letters: BTreeMap<String, DeadLetter>,
    /// Latest published knowledge version per engine.
    pub published: BTreeMap<String, KnowledgeVersion>,
}

impl Default for LayerState {
    fn default() -> Self {
        Self {
            schema_version: LAYER_SCHEMA_VERSION,
            counters: Counters::default(),
            findings: BTreeMap::new(),
            patterns: BTreeMap::new(),
            entries: BTreeMap::new(),
            examples: BTreeMap::new(),
            cursors: BTreeMap::new(),
            dead_letters: BTreeMap::new(),
            published: BTreeMap::new(),
        }
    }
}

impl LayerState {
    // -------------------------------------------------------------------------
    // Cursors
    // -------------------------------------------------------------------------

    pub fn cursor(&self, transition: Transition, stream: &StreamId) -> Cursor {
        self.cursors
            .get(&cursor_key(transition, stream))
            .copied()
            .unwrap_or_default()
    }

    /// Move a cursor forward and stamp the run time.
    ///
    /// Moving backwards is a state violation; staying put is allowed so a
    /// run that consumed nothing can still record its time.
    pub fn advance_cursor(
        &mut self,
        transition: Transition,
        stream: &StreamId,
        position: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let cursor = self.cursors.entry(cursor_key(transition, stream)).or_default();
        if position < cursor.position {
            return Err(StratumError::invalid_state(format!(
                "{} cursor for {} cannot move from {} back to {}",
                transition, stream, cursor.position, position
            )));
        }
        cursor.position = position;
        cursor.last_run_at = Some(now);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Findings
    // -------------------------------------------------------------------------

    /// Assign id and sequence to a new finding and store it.
    pub fn insert_finding(&mut self, mut finding: Finding) -> String {
        self.counters.finding += 1;
        finding.id = format_id(FINDING_PREFIX, self.counters.finding);
        finding.seq = self.counters.finding;
        let id = finding.id.clone();
        self.findings.insert(id.clone(), finding);
        id
    }

    /// Mark active findings covering any of `keys` as superseded by `by`.
    ///
    /// Returns the ids that were superseded.
    pub fn supersede_covering(&mut self, keys: &[OutcomeKey], by: &str) -> Vec<String> {
        let mut superseded = Vec::new();
        for finding in self.findings.values_mut() {
            if finding.id == by || !finding.is_active() {
                continue;
            }
            if finding.outcome_keys.iter().any(|k| keys.contains(k)) {
                finding.superseded_by = Some(by.to_string());
                superseded.push(finding.id.clone());
            }
        }
        superseded
    }

    /// Active findings of a stream with `seq > after`, in sequence order.
    pub fn findings_since(&self, stream: &StreamId, after: u64) -> Vec<&Finding> {
        let mut found: Vec<&Finding> = self
            .findings
            .values()
            .filter(|f| f.is_active() && f.seq > after && f.stream() == *stream)
            .collect();
        found.sort_by_key(|f| f.seq);
        found
    }

    /// Active findings of a stream.
    pub fn active_findings(&self, stream: &StreamId) -> Vec<&Finding> {
        self.findings_since(stream, 0)
    }

    // -------------------------------------------------------------------------
    // Patterns
    // -------------------------------------------------------------------------

    /// Next store-wide revision.
    pub fn bump_revision(&mut self) -> u64 {
        self.counters.revision += 1;
        self.counters.revision
    }

    pub fn next_pattern_id(&mut self) -> String {
        self.counters.pattern += 1;
        format_id(PATTERN_PREFIX, self.counters.pattern)
    }

    /// Store a pattern, stamping a fresh revision.
    pub fn upsert_pattern(&mut self, mut pattern: Pattern) -> String {
        pattern.revision = self.bump_revision();
        let id = pattern.id.clone();
        self.patterns.insert(id.clone(), pattern);
        id
    }

    pub fn pattern_by_mechanism(&self, stream: &StreamId, mechanism: &str) -> Option<&Pattern> {
        self.patterns
            .values()
            .find(|p| p.stream() == *stream && p.mechanism.eq_ignore_ascii_case(mechanism))
    }

    pub fn patterns_of(&self, stream: &StreamId) -> Vec<&Pattern> {
        self.patterns
            .values()
            .filter(|p| p.stream() == *stream)
            .collect()
    }

    // -------------------------------------------------------------------------
    // Entries and examples
    // -------------------------------------------------------------------------

    pub fn next_entry_id(&mut self) -> String {
        self.counters.entry += 1;
        format_id(ENTRY_PREFIX, self.counters.entry)
    }

    pub fn next_example_id(&mut self) -> String {
        self.counters.example += 1;
        format_id(EXAMPLE_PREFIX, self.counters.example)
    }

    /// Store an entry, stamping a fresh revision.
    ///
    /// Refuses entries without evidence; this is the last line of the
    /// evidence gate and holds whatever the caller checked before.
    pub fn upsert_entry(&mut self, mut entry: KnowledgeEntry) -> Result<String> {
        if !entry.has_evidence() {
            return Err(StratumError::validation(
                "source_patterns",
                format!("entry '{}' cites no pattern or finding", entry.title),
            ));
        }
        entry.revision = self.bump_revision();
        let id = entry.id.clone();
        self.entries.insert(id.clone(), entry);
        Ok(id)
    }

    pub fn find_entry(&self, engine: &str, kind: EntryKind, title: &str) -> Option<&KnowledgeEntry> {
        self.entries
            .values()
            .find(|e| e.same_claim(engine, kind, title))
    }

    /// Whether an evidence id names an existing pattern or finding.
    pub fn evidence_exists(&self, id: &str) -> bool {
        self.patterns.contains_key(id) || self.findings.contains_key(id)
    }

    // -------------------------------------------------------------------------
    // Dead letters
    // -------------------------------------------------------------------------

    pub fn add_dead_letter(&mut self, mut letter: DeadLetter) -> String {
        self.counters.dead_letter += 1;
        letter.id = format_id(DEAD_LETTER_PREFIX, self.counters.dead_letter);
        let id = letter.id.clone();
        self.dead_letters.insert(id.clone(), letter);
        id
    }

    /// An open dead letter parks its transition on that stream.
    pub fn parked(&self, transition: Transition, stream: &StreamId) -> Option<&DeadLetter> {
        self.dead_letters
            .values()
            .find(|d| d.transition == transition && d.stream() == *stream)
    }

    pub fn remove_dead_letter(&mut self, id: &str) -> Option<DeadLetter> {
        self.dead_letters.remove(id)
    }

    /// Put a released dead letter back under its own id.
    pub fn reinstate_dead_letter(&mut self, letter: DeadLetter) {
        self.dead_letters.insert(letter.id.clone(), letter);
    }

    // -------------------------------------------------------------------------
    // Publication
    // -------------------------------------------------------------------------

    /// Assign the next knowledge version to an engine.
    pub fn bump_knowledge_version(&mut self, engine: &str) -> KnowledgeVersion {
        self.counters.knowledge_version += 1;
        let version = KnowledgeVersion(self.counters.knowledge_version);
        self.published.insert(engine.to_string(), version);
        version
    }

    /// Engines that appear anywhere in the derived layers.
    pub fn engines(&self) -> Vec<String> {
        let mut engines: Vec<String> = self
            .findings
            .values()
            .map(|f| f.engine.clone())
            .chain(self.entries.values().map(|e| e.engine.clone()))
            .chain(self.published.keys().cloned())
            .collect();
        engines.sort();
        engines.dedup();
        engines
    }

    /// Build the immutable snapshot of an engine's committed knowledge.
    ///
    /// Rules that no longer validate against `vocabulary` are left out.
    pub fn build_snapshot(
        &self,
        engine: &str,
        version: KnowledgeVersion,
        vocabulary: &FeatureVocabulary,
        committed_at: DateTime<Utc>,
    ) -> KnowledgeSnapshot {
        let mut profile = EngineProfile::default();
        let mut entries: Vec<&KnowledgeEntry> =
            self.entries.values().filter(|e| e.engine == engine).collect();
        entries.sort_by(|a, b| {
            (a.priority.rank(), &a.id).cmp(&(b.priority.rank(), &b.id))
        });

        let mut compiled = Vec::new();
        let mut constraints: BTreeMap<String, Vec<Constraint>> = BTreeMap::new();
        for entry in &entries {
            match entry.kind {
                EntryKind::Strength => profile.strengths.push((*entry).clone()),
                EntryKind::TuningRule => profile.tuning_rules.push((*entry).clone()),
                EntryKind::Gap => profile.gaps.push((*entry).clone()),
            }
            if entry.kind != EntryKind::Gap {
                continue;
            }
            let Some(gap_id) = &entry.gap_id else {
                continue;
            };
            for pattern_id in &entry.source_patterns {
                let Some(pattern) = self.patterns.get(pattern_id) else {
                    continue;
                };
                for ci in &pattern.counter_indications {
                    constraints.entry(gap_id.clone()).or_default().push(Constraint {
                        gap_id: gap_id.clone(),
                        pattern_id: pattern.id.clone(),
                        pattern: ci.pattern.clone(),
                        reason: ci.reason.clone(),
                        regressed_example_ids: ci.regressed_example_ids.clone(),
                    });
                }
            }
        }

        // Rules keep declaration (entry id) order; evaluation sorts by priority.
        let mut gaps_by_id: Vec<&KnowledgeEntry> = profile.gaps.iter().collect();
        gaps_by_id.sort_by(|a, b| a.id.cmp(&b.id));
        for entry in gaps_by_id {
            let Some(raw) = &entry.detection_rule else {
                continue;
            };
            match rules::validate(raw, vocabulary) {
                Ok(rule) => compiled.push(rule),
                Err(errors) => tracing::warn!(
                    entry = %entry.id,
                    errors = errors.len(),
                    "stored detection rule no longer validates; skipped"
                ),
            }
        }

        let examples: Vec<GoldExample> = self
            .examples
            .values()
            .filter(|g| g.engine == engine && g.is_active())
            .cloned()
            .collect();

        let mut runtime_findings: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for finding in self
            .findings
            .values()
            .filter(|f| f.engine == engine && f.is_active())
        {
            for query_id in &finding.query_ids {
                runtime_findings
                    .entry(query_id.clone())
                    .or_default()
                    .push(finding.observation.clone());
            }
        }

        KnowledgeSnapshot {
            engine: engine.to_string(),
            version,
            committed_at,
            profile,
            examples,
            rules: compiled,
            constraints,
            runtime_findings,
        }
    }
}

/// Owner of the layer state and the published snapshots.
#[derive(Debug)]
pub struct LayerStore {
    /// `knowledge.json`; `None` for a purely in-memory store.
    path: Option<PathBuf>,
    vocabulary: FeatureVocabulary,
    state: RwLock<Arc<LayerState>>,
    snapshots: RwLock<HashMap<String, Arc<KnowledgeSnapshot>>>,
}

impl LayerStore {
    /// A store that never touches disk.
    pub fn in_memory(vocabulary: FeatureVocabulary) -> Self {
        Self {
            path: None,
            vocabulary,
            state: RwLock::new(Arc::new(LayerState::default())),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Open `<data_dir>/knowledge.json`, creating an empty state if absent,
    /// and republish every engine that had published knowledge.
    pub fn open(data_dir: impl AsRef<Path>, vocabulary: FeatureVocabulary) -> Result<Self> {
        let path = data_dir.as_ref().join("knowledge.json");
        let state = if path.exists() {
            let content = read_to_string_limited(&path)?;
            let state: LayerState = serde_json::from_str(&content)?;
            if state.schema_version > LAYER_SCHEMA_VERSION {
                return Err(StratumError::invalid_state(format!(
                    "{} has schema version {}, newer than supported {}",
                    path.display(),
                    state.schema_version,
                    LAYER_SCHEMA_VERSION
                )));
            }
            state
        } else {
            LayerState::default()
        };

        let store = Self {
            path: Some(path),
            vocabulary,
            state: RwLock::new(Arc::new(state)),
            snapshots: RwLock::new(HashMap::new()),
        };

        let engines: Vec<String> = store.state()?.published.keys().cloned().collect();
        for engine in engines {
            store.publish(&engine)?;
        }
        Ok(store)
    }

    pub fn vocabulary(&self) -> &FeatureVocabulary {
        &self.vocabulary
    }

    /// Current committed state. Cheap: clones an `Arc`.
    pub fn state(&self) -> Result<Arc<LayerState>> {
        self.state
            .read()
            .map(|s| Arc::clone(&s))
            .map_err(|_| StratumError::invalid_state("layer state lock poisoned"))
    }

    /// Apply `change` to a copy of the state and commit it atomically.
    ///
    /// Writers are serialized. Readers keep seeing the previous state until
    /// the new one is durable.
    pub fn transact<R>(&self, change: impl FnOnce(&mut LayerState) -> Result<R>) -> Result<R> {
        let mut guard = self
            .state
            .write()
            .map_err(|_| StratumError::invalid_state("layer state lock poisoned"))?;

        let mut next = LayerState::clone(&guard);
        let result = change(&mut next)?;

        if let Some(path) = &self.path {
            write_json_atomic(path, &next)?;
        }
        *guard = Arc::new(next);
        Ok(result)
    }

    /// Build and publish the snapshot for an engine at its recorded version.
    pub fn publish(&self, engine: &str) -> Result<Arc<KnowledgeSnapshot>> {
        let state = self.state()?;
        let version = state.published.get(engine).copied().ok_or_else(|| {
            StratumError::not_found("published knowledge", engine.to_string())
        })?;
        let snapshot = Arc::new(state.build_snapshot(engine, version, &self.vocabulary, Utc::now()));

        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| StratumError::invalid_state("snapshot lock poisoned"))?;
        snapshots.insert(engine.to_string(), Arc::clone(&snapshot));
        tracing::debug!(engine, version = %version, "snapshot published");
        Ok(snapshot)
    }

    /// Latest published snapshot for an engine.
    pub fn published(&self, engine: &str) -> Option<Arc<KnowledgeSnapshot>> {
        self.snapshots
            .read()
            .ok()
            .and_then(|s| s.get(engine).cloned())
    }
}
