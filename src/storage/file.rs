//! File-based outcome storage.
//!
//! Outcomes are stored as JSONL, one file per physical partition:
//! `<root>/outcomes/<engine>/<benchmark>/<YYYY-MM-DD>.jsonl`. Appends are
//! fsync'd before the ack is returned. The in-memory index is rebuilt from
//! the partition files on open. Retention rewrites aged partitions
//! atomically via temp file + rename and keeps rollups in
//! `<root>/outcomes/rollups.json`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};

use crate::core::features::FeatureVocabulary;
use crate::core::outcome::{Outcome, OutcomeKey, StoredOutcome, StreamId};
use crate::error::{Result, StratumError};
use crate::storage::memory::{poisoned, OutcomeIndex};
use crate::storage::retention::{DailyRollup, RetentionReport};
use crate::storage::traits::{AppendAck, OutcomeStore};
use crate::util::{
    append_jsonl, read_to_string_limited, truncate_jsonl, write_atomic, write_json_atomic,
};

/// File-based outcome store.
#[derive(Debug)]
pub struct FileOutcomeStore {
    /// `<data>/outcomes`.
    root: PathBuf,
    vocabulary: FeatureVocabulary,
    index: RwLock<OutcomeIndex>,
}

impl FileOutcomeStore {
    /// Open (or create) a store under `data_dir` with the standard vocabulary.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_vocabulary(data_dir, FeatureVocabulary::standard())
    }

    /// Open (or create) a store, rebuilding the index from disk.
    pub fn open_with_vocabulary(
        data_dir: impl AsRef<Path>,
        vocabulary: FeatureVocabulary,
    ) -> Result<Self> {
        let root = data_dir.as_ref().join("outcomes");
        if !root.exists() {
            fs::create_dir_all(&root).map_err(|e| StratumError::storage(&root, e))?;
        }

        let index = rebuild_index(&root)?;
        tracing::debug!(
            root = %root.display(),
            records = index.len(),
            "outcome index rebuilt"
        );

        Ok(Self {
            root,
            vocabulary,
            index: RwLock::new(index),
        })
    }

    /// Path of a partition file.
    pub fn partition_path(&self, stream: &StreamId, date: NaiveDate) -> PathBuf {
        self.root
            .join(&stream.engine)
            .join(&stream.benchmark)
            .join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    fn rollups_path(&self) -> PathBuf {
        self.root.join("rollups.json")
    }

    fn rewrite_partition(
        &self,
        stream: &StreamId,
        date: NaiveDate,
        records: &[StoredOutcome],
    ) -> Result<()> {
        let mut body = String::new();
        for record in records {
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }
        write_atomic(&self.partition_path(stream, date), body.as_bytes())
    }
}

/// Walk `<root>/<engine>/<benchmark>/*.jsonl` and rebuild the index.
fn rebuild_index(root: &Path) -> Result<OutcomeIndex> {
    let mut per_stream: BTreeMap<StreamId, Vec<StoredOutcome>> = BTreeMap::new();

    for engine_dir in sub_dirs(root)? {
        for bench_dir in sub_dirs(&engine_dir)? {
            let entries =
                fs::read_dir(&bench_dir).map_err(|e| StratumError::storage(&bench_dir, e))?;
            for entry in entries {
                let path = entry.map_err(|e| StratumError::storage(&bench_dir, e))?.path();
                if path.extension().map(|e| e != "jsonl").unwrap_or(true) {
                    continue;
                }
                let content = read_to_string_limited(&path)?;
                for (line_no, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<StoredOutcome>(line) {
                        Ok(record) => per_stream
                            .entry(record.outcome.stream())
                            .or_default()
                            .push(record),
                        Err(e) => tracing::warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            error = %e,
                            "skipping unreadable outcome record"
                        ),
                    }
                }
            }
        }
    }

    let mut index = OutcomeIndex::default();
    for (_, mut records) in per_stream {
        records.sort_by_key(|r| r.seq);
        for record in records {
            if index.existing(&record.outcome.key()).is_some() {
                tracing::warn!(key = %record.outcome.key(), "duplicate key on disk, keeping first");
                continue;
            }
            index.insert_stored(record);
        }
    }

    let rollups_path = root.join("rollups.json");
    if rollups_path.exists() {
        let content = read_to_string_limited(&rollups_path)?;
        index.rollups = serde_json::from_str::<Vec<DailyRollup>>(&content)?;
    }

    Ok(index)
}

fn sub_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| StratumError::storage(dir, e))? {
        let path = entry.map_err(|e| StratumError::storage(dir, e))?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

impl OutcomeStore for FileOutcomeStore {
    fn append(&self, outcome: Outcome) -> Result<AppendAck> {
        self.append_batch(vec![outcome])?
            .pop()
            .ok_or_else(|| StratumError::invalid_state("append produced no ack"))
    }

    /// Validates everything first, then writes one fsync'd append per partition.
    fn append_batch(&self, outcomes: Vec<Outcome>) -> Result<Vec<AppendAck>> {
        let mut validated = Vec::with_capacity(outcomes.len());
        for mut outcome in outcomes {
            outcome.validate(&self.vocabulary)?;
            validated.push(outcome);
        }

        let mut index = self.index.write().map_err(poisoned)?;
        let mut acks = Vec::with_capacity(validated.len());
        let mut pending: BTreeMap<PathBuf, Vec<StoredOutcome>> = BTreeMap::new();
        let mut staged = OutcomeIndex::default();
        let mut new_records = Vec::new();

        for outcome in validated {
            let key = outcome.key();
            if let Some(ack) = index.existing(&key).or_else(|| staged.existing(&key)) {
                acks.push(ack);
                continue;
            }
            let stream = outcome.stream();
            let seq = index.head(&stream).max(staged.head(&stream)) + 1;
            let stored = StoredOutcome { seq, outcome };
            pending
                .entry(self.partition_path(&stream, stored.outcome.partition_date()))
                .or_default()
                .push(stored.clone());
            staged.insert_stored(stored.clone());
            new_records.push(stored);
            acks.push(AppendAck {
                key,
                seq,
                duplicate: false,
            });
        }

        // Durable before visible: write every partition, then publish. A
        // failure undoes the partitions already written so no unindexed line
        // can claim a sequence number the next append will reuse.
        let mut written: Vec<(&PathBuf, u64)> = Vec::with_capacity(pending.len());
        for (path, records) in &pending {
            match append_jsonl(path, records) {
                Ok(start) => written.push((path, start)),
                Err(e) => {
                    for (done, start) in written {
                        if let Err(undo) = truncate_jsonl(done, start) {
                            tracing::error!(
                                path = %done.display(),
                                error = %undo,
                                "could not roll back a partition append"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        for record in new_records {
            index.insert_stored(record);
        }

        Ok(acks)
    }

    fn get(&self, key: &OutcomeKey) -> Result<Option<StoredOutcome>> {
        Ok(self.index.read().map_err(poisoned)?.get(key).cloned())
    }

    fn read_since(
        &self,
        stream: &StreamId,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<StoredOutcome>> {
        Ok(self
            .index
            .read()
            .map_err(poisoned)?
            .read_since(stream, after_seq, limit))
    }

    fn streams(&self) -> Result<Vec<StreamId>> {
        Ok(self.index.read().map_err(poisoned)?.streams())
    }

    fn head(&self, stream: &StreamId) -> Result<u64> {
        Ok(self.index.read().map_err(poisoned)?.head(stream))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.index.read().map_err(poisoned)?.len())
    }

    fn apply_retention(&self, now: DateTime<Utc>, window_days: u32) -> Result<RetentionReport> {
        let mut index = self.index.write().map_err(poisoned)?;
        let (report, touched) = index.apply_retention(now, window_days);

        for (stream, date) in &touched {
            let records = index.partition(stream, *date);
            self.rewrite_partition(stream, *date, &records)?;
        }
        if report.partitions_rolled > 0 {
            write_json_atomic(&self.rollups_path(), &index.rollups)?;
        }

        tracing::info!(
            partitions = report.partitions_rolled,
            stripped = report.records_stripped,
            "retention applied"
        );
        Ok(report)
    }

    fn rollups(&self) -> Result<Vec<DailyRollup>> {
        Ok(self.index.read().map_err(poisoned)?.rollups.clone())
    }
}
