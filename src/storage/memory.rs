//! In-memory outcome storage.
//!
//! [`OutcomeIndex`] is the in-memory view both stores share: per-stream
//! record vectors indexed by sequence number, plus a key index for dedup.
//! [`MemoryOutcomeStore`] wraps it in a lock; the file store rebuilds it on
//! open and keeps it alongside the partition files.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, NaiveDate, Utc};

use crate::core::features::FeatureVocabulary;
use crate::core::outcome::{Outcome, OutcomeKey, StoredOutcome, StreamId};
use crate::error::{Result, StratumError};
use crate::storage::retention::{
    retention_cutoff, roll_partition, upsert_rollup, DailyRollup, RetentionReport,
};
use crate::storage::traits::{AppendAck, OutcomeStore};

/// Map a poisoned lock to a storage-level error.
pub(crate) fn poisoned<T>(_: PoisonError<T>) -> StratumError {
    StratumError::invalid_state("outcome store lock poisoned")
}

/// Where a key lives.
#[derive(Debug, Clone)]
struct Slot {
    stream: StreamId,
    seq: u64,
}

/// In-memory records and indexes.
#[derive(Debug, Default)]
pub struct OutcomeIndex {
    /// Records per stream; `records[stream][seq - 1]`.
    records: BTreeMap<StreamId, Vec<StoredOutcome>>,
    keys: HashMap<OutcomeKey, Slot>,
    pub(crate) rollups: Vec<DailyRollup>,
}

impl OutcomeIndex {
    /// Existing ack for a key, if it was appended before.
    pub fn existing(&self, key: &OutcomeKey) -> Option<AppendAck> {
        self.keys.get(key).map(|slot| AppendAck {
            key: key.clone(),
            seq: slot.seq,
            duplicate: true,
        })
    }

    /// Sequence number the next record of a stream will get.
    pub fn next_seq(&self, stream: &StreamId) -> u64 {
        self.head(stream) + 1
    }

    /// Assign a sequence number and insert. The caller has checked dedup.
    pub fn insert_new(&mut self, outcome: Outcome) -> StoredOutcome {
        let stream = outcome.stream();
        let stored = StoredOutcome {
            seq: self.next_seq(&stream),
            outcome,
        };
        self.insert_stored(stored.clone());
        stored
    }

    /// Insert a record that already carries its sequence number.
    ///
    /// Used when rebuilding from disk; records must arrive in sequence order.
    pub fn insert_stored(&mut self, stored: StoredOutcome) {
        let stream = stored.outcome.stream();
        self.keys.insert(
            stored.outcome.key(),
            Slot {
                stream: stream.clone(),
                seq: stored.seq,
            },
        );
        self.records.entry(stream).or_default().push(stored);
    }

    pub fn get(&self, key: &OutcomeKey) -> Option<&StoredOutcome> {
        let slot = self.keys.get(key)?;
        self.record(&slot.stream, slot.seq)
    }

    fn record(&self, stream: &StreamId, seq: u64) -> Option<&StoredOutcome> {
        let records = self.records.get(stream)?;
        let idx = usize::try_from(seq.checked_sub(1)?).ok()?;
        records.get(idx).filter(|r| r.seq == seq).or_else(|| {
            // Sequence numbers rebuilt from a damaged file may not be dense.
            records.iter().find(|r| r.seq == seq)
        })
    }

    pub fn read_since(&self, stream: &StreamId, after_seq: u64, limit: usize) -> Vec<StoredOutcome> {
        self.records
            .get(stream)
            .map(|records| {
                let start = records.partition_point(|r| r.seq <= after_seq);
                records[start..].iter().take(limit).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn streams(&self) -> Vec<StreamId> {
        self.records
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(stream, _)| stream.clone())
            .collect()
    }

    pub fn head(&self, stream: &StreamId) -> u64 {
        self.records
            .get(stream)
            .and_then(|records| records.last())
            .map_or(0, |r| r.seq)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Roll every partition dated before the cutoff.
    ///
    /// Returns the report and the partitions touched, so a persistent store
    /// can rewrite exactly those files.
    pub fn apply_retention(
        &mut self,
        now: DateTime<Utc>,
        window_days: u32,
    ) -> (RetentionReport, Vec<(StreamId, NaiveDate)>) {
        let cutoff = retention_cutoff(now, window_days);
        let mut report = RetentionReport {
            cutoff: Some(cutoff),
            ..RetentionReport::default()
        };
        let mut touched = Vec::new();

        for (stream, records) in self.records.iter_mut() {
            let mut by_date: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
            for (i, record) in records.iter().enumerate() {
                let date = record.outcome.partition_date();
                if date < cutoff {
                    by_date.entry(date).or_default().push(i);
                }
            }

            for (date, indices) in by_date {
                let mut partition: Vec<StoredOutcome> =
                    indices.iter().map(|&i| records[i].clone()).collect();
                let Some((rollup, stripped)) = roll_partition(&mut partition) else {
                    continue;
                };
                for (i, record) in indices.into_iter().zip(partition) {
                    records[i] = record;
                }
                upsert_rollup(&mut self.rollups, rollup);
                report.partitions_rolled += 1;
                report.records_stripped += stripped;
                if stripped > 0 {
                    touched.push((stream.clone(), date));
                }
            }
        }

        (report, touched)
    }

    /// Records of one physical partition, in sequence order.
    pub fn partition(&self, stream: &StreamId, date: NaiveDate) -> Vec<StoredOutcome> {
        self.records
            .get(stream)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.outcome.partition_date() == date)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory outcome store for tests and embedded use.
///
/// Thread-safe implementation using `RwLock`. Records are lost when the
/// store is dropped.
#[derive(Debug)]
pub struct MemoryOutcomeStore {
    vocabulary: FeatureVocabulary,
    index: RwLock<OutcomeIndex>,
}

impl MemoryOutcomeStore {
    /// Create an empty store using the standard vocabulary.
    pub fn new() -> Self {
        Self::with_vocabulary(FeatureVocabulary::standard())
    }

    /// Create an empty store validating features against `vocabulary`.
    pub fn with_vocabulary(vocabulary: FeatureVocabulary) -> Self {
        Self {
            vocabulary,
            index: RwLock::new(OutcomeIndex::default()),
        }
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.index.read().map(|i| i.is_empty()).unwrap_or(true)
    }
}

impl Default for MemoryOutcomeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeStore for MemoryOutcomeStore {
    fn append(&self, mut outcome: Outcome) -> Result<AppendAck> {
        outcome.validate(&self.vocabulary)?;
        let key = outcome.key();

        let mut index = self.index.write().map_err(poisoned)?;
        if let Some(ack) = index.existing(&key) {
            return Ok(ack);
        }
        let stored = index.insert_new(outcome);
        Ok(AppendAck {
            key,
            seq: stored.seq,
            duplicate: false,
        })
    }

    fn get(&self, key: &OutcomeKey) -> Result<Option<StoredOutcome>> {
        let index = self.index.read().map_err(poisoned)?;
        Ok(index.get(key).cloned())
    }

    fn read_since(
        &self,
        stream: &StreamId,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<StoredOutcome>> {
        let index = self.index.read().map_err(poisoned)?;
        Ok(index.read_since(stream, after_seq, limit))
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
        let (report, _) = index.apply_retention(now, window_days);
        Ok(report)
    }

    fn rollups(&self) -> Result<Vec<DailyRollup>> {
        Ok(self.index.read().map_err(poisoned)?.rollups.clone())
    }
}
