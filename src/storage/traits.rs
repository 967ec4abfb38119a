//! Outcome storage traits for Stratum.
//!
//! This module defines the `OutcomeStore` trait for the Layer-1 log.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::outcome::{Outcome, OutcomeKey, StoredOutcome, StreamId};
use crate::error::Result;
use crate::storage::retention::{DailyRollup, RetentionReport};

/// Acknowledgement of an append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendAck {
    pub key: OutcomeKey,
    /// Sequence number of the stored record (the original one on duplicates).
    pub seq: u64,
    /// True when the key was already present and nothing was written.
    pub duplicate: bool,
}

/// Trait for outcome storage backends.
///
/// Appends are idempotent under the `(query_id, run_id, worker_id)` key and
/// commute, so concurrent producers need no coordination. Any acked append
/// is visible to `get` and `read_since` immediately afterwards.
pub trait OutcomeStore: Send + Sync {
    /// Validate and append an outcome, or no-op if its key already exists.
    fn append(&self, outcome: Outcome) -> Result<AppendAck>;

    /// Append several outcomes.
    ///
    /// The default stops at the first invalid outcome and keeps the earlier
    /// ones; implementations may instead reject the whole batch up front.
    fn append_batch(&self, outcomes: Vec<Outcome>) -> Result<Vec<AppendAck>> {
        outcomes.into_iter().map(|o| self.append(o)).collect()
    }

    /// Look up a stored outcome by key.
    fn get(&self, key: &OutcomeKey) -> Result<Option<StoredOutcome>>;

    /// Records of a stream with `seq > after_seq`, in sequence order.
    fn read_since(
        &self,
        stream: &StreamId,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<StoredOutcome>>;

    /// All streams with at least one record.
    fn streams(&self) -> Result<Vec<StreamId>>;

    /// Highest sequence number of a stream (0 when empty).
    fn head(&self, stream: &StreamId) -> Result<u64>;

    /// Total stored records.
    fn len(&self) -> Result<usize>;

    /// Roll partitions older than the window into daily rollups.
    fn apply_retention(&self, now: DateTime<Utc>, window_days: u32) -> Result<RetentionReport>;

    /// Daily rollups produced so far.
    fn rollups(&self) -> Result<Vec<DailyRollup>>;
}

impl<T: OutcomeStore + ?Sized> OutcomeStore for Arc<T> {
    fn append(&self, outcome: Outcome) -> Result<AppendAck> {
        (**self).append(outcome)
    }

    fn append_batch(&self, outcomes: Vec<Outcome>) -> Result<Vec<AppendAck>> {
        (**self).append_batch(outcomes)
    }

    fn get(&self, key: &OutcomeKey) -> Result<Option<StoredOutcome>> {
        (**self).get(key)
    }

    fn read_since(
        &self,
        stream: &StreamId,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<StoredOutcome>> {
        (**self).read_since(stream, after_seq, limit)
    }

    fn streams(&self) -> Result<Vec<StreamId>> {
        (**self).streams()
    }

    fn head(&self, stream: &StreamId) -> Result<u64> {
        (**self).head(stream)
    }

    fn len(&self) -> Result<usize> {
        (**self).len()
    }

    fn apply_retention(&self, now: DateTime<Utc>, window_days: u32) -> Result<RetentionReport> {
        (**self).apply_retention(now, window_days)
    }

    fn rollups(&self) -> Result<Vec<DailyRollup>> {
        (**self).rollups()
    }
}

/// Test utilities for OutcomeStore implementations.
#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::core::outcome::fixtures;
    use chrono::Duration;

    /// Append/dedup/read-your-write contract every store must honor.
    pub fn test_outcome_store_contract<S: OutcomeStore>(store: &S) {
        let stream = StreamId::new("duckdb", "tpcds");
        assert_eq!(store.head(&stream).unwrap(), 0);

        let first = store.append(fixtures::win("q1", "r1")).unwrap();
        assert_eq!(first.seq, 1);
        assert!(!first.duplicate);

        // Read-your-write
        let read = store.get(&first.key).unwrap().unwrap();
        assert_eq!(read.seq, 1);
        assert_eq!(read.outcome.query_id, "q1");

        // Duplicate is a no-op that reports the original seq
        let dup = store.append(fixtures::win("q1", "r1")).unwrap();
        assert!(dup.duplicate);
        assert_eq!(dup.seq, 1);
        assert_eq!(store.len().unwrap(), 1);

        let second = store.append(fixtures::regression("q2", "r1")).unwrap();
        assert_eq!(second.seq, 2);

        let on_postgres = |query: &str| {
            let mut o = fixtures::win(query, "r1");
            o.engine = "postgres".into();
            o
        };
        let other = store.append(on_postgres("q9")).unwrap();
        assert_eq!(other.seq, 1, "sequences are per stream");
        assert!(!other.duplicate);

        // The dedup key does not include the stream
        let cross = store.append(on_postgres("q1")).unwrap();
        assert!(cross.duplicate);
        assert_eq!(cross.key, first.key);

        let all = store.read_since(&stream, 0, 10).unwrap();
        assert_eq!(all.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2]);
        let tail = store.read_since(&stream, 1, 10).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].outcome.query_id, "q2");
        assert_eq!(store.read_since(&stream, 0, 1).unwrap().len(), 1);

        assert_eq!(store.head(&stream).unwrap(), 2);
        assert_eq!(store.streams().unwrap().len(), 2);

        // Validation failures are caller errors and store nothing
        let err = store.append(fixtures::win("", "r9")).unwrap_err();
        assert!(err.is_caller_error());
        assert_eq!(store.len().unwrap(), 3);
    }

    /// Retention contract every store must honor.
    pub fn test_outcome_store_retention<S: OutcomeStore>(store: &S) {
        let now = Utc::now();
        let old = now - Duration::days(40);
        let stream = StreamId::new("duckdb", "tpcds");

        store
            .append(fixtures::win("q1", "r1").with_recorded_at(old))
            .unwrap();
        store
            .append(fixtures::win("q2", "r1").with_recorded_at(old))
            .unwrap();
        store.append(fixtures::win("q3", "r1").with_recorded_at(now)).unwrap();

        let report = store.apply_retention(now, 30).unwrap();
        assert_eq!(report.partitions_rolled, 1);
        assert_eq!(report.records_stripped, 2);

        let rollups = store.rollups().unwrap();
        assert_eq!(rollups.len(), 1);
        assert_eq!(rollups[0].total, 2);

        let records = store.read_since(&stream, 0, 10).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].outcome.original_sql.is_none());
        assert!(records[2].outcome.original_sql.is_some());

        // Dedup still works on rolled records
        let dup = store
            .append(fixtures::win("q1", "r1").with_recorded_at(old))
            .unwrap();
        assert!(dup.duplicate);

        // A second pass is a no-op on the text but keeps the rollup
        let again = store.apply_retention(now, 30).unwrap();
        assert_eq!(again.records_stripped, 0);
        assert_eq!(store.rollups().unwrap().len(), 1);
    }
}
