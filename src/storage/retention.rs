//! Retention rollups for aged outcome partitions.
//!
//! Once a partition `(engine, benchmark, date)` falls outside the retention
//! window it is summarized into a [`DailyRollup`] and its records lose their
//! bulky free text (SQL, reasoning, error). Identity, status, speedup and
//! sequence numbers survive, so dedup and derivation cursors stay valid.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::core::outcome::{OutcomeKey, StoredOutcome, StreamId};

/// Statistics for one stream on one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRollup {
    pub engine: String,
    pub benchmark: String,
    pub date: NaiveDate,
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub wins: u64,
    pub speedup_sum: f64,
    pub speedup_count: u64,
    pub max_speedup: Option<f64>,
    pub query_ids: BTreeSet<String>,
    pub outcome_keys: Vec<OutcomeKey>,
    pub first_seq: u64,
    pub last_seq: u64,
}

impl DailyRollup {
    pub fn stream(&self) -> StreamId {
        StreamId::new(&self.engine, &self.benchmark)
    }

    pub fn mean_speedup(&self) -> Option<f64> {
        (self.speedup_count > 0).then(|| self.speedup_sum / self.speedup_count as f64)
    }
}

/// Daily rollups folded by ISO week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyRollup {
    pub engine: String,
    pub benchmark: String,
    pub iso_year: i32,
    pub iso_week: u32,
    pub days: u32,
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub wins: u64,
    pub mean_speedup: Option<f64>,
    pub max_speedup: Option<f64>,
    pub distinct_queries: usize,
}

/// What one retention pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub cutoff: Option<NaiveDate>,
    pub partitions_rolled: usize,
    pub records_stripped: usize,
}

/// First day still inside the window. Partitions dated before it are rolled.
pub fn retention_cutoff(now: DateTime<Utc>, window_days: u32) -> NaiveDate {
    let today = now.date_naive();
    today
        .checked_sub_days(Days::new(u64::from(window_days)))
        .unwrap_or(NaiveDate::MIN)
}

/// Summarize one partition and strip its records.
///
/// `records` must all belong to the same stream and day. Returns `None` for
/// an empty slice.
pub fn roll_partition(records: &mut [StoredOutcome]) -> Option<(DailyRollup, usize)> {
    let first = records.first()?;
    let mut rollup = DailyRollup {
        engine: first.outcome.engine.clone(),
        benchmark: first.outcome.benchmark.clone(),
        date: first.outcome.partition_date(),
        total: 0,
        by_status: BTreeMap::new(),
        wins: 0,
        speedup_sum: 0.0,
        speedup_count: 0,
        max_speedup: None,
        query_ids: BTreeSet::new(),
        outcome_keys: Vec::with_capacity(records.len()),
        first_seq: first.seq,
        last_seq: first.seq,
    };

    let mut stripped = 0;
    for record in records.iter_mut() {
        let outcome = &record.outcome;
        rollup.total += 1;
        *rollup
            .by_status
            .entry(outcome.status.as_str().to_string())
            .or_insert(0) += 1;
        if outcome.status.is_success() {
            rollup.wins += 1;
        }
        if let Some(speedup) = outcome.speedup {
            rollup.speedup_sum += speedup;
            rollup.speedup_count += 1;
            rollup.max_speedup = Some(rollup.max_speedup.map_or(speedup, |m| m.max(speedup)));
        }
        rollup.query_ids.insert(outcome.query_id.clone());
        rollup.outcome_keys.push(outcome.key());
        rollup.first_seq = rollup.first_seq.min(record.seq);
        rollup.last_seq = rollup.last_seq.max(record.seq);

        if record.outcome.strip_bulk_text() {
            stripped += 1;
        }
    }

    Some((rollup, stripped))
}

/// Insert or replace the rollup for the same stream and day.
pub fn upsert_rollup(rollups: &mut Vec<DailyRollup>, rollup: DailyRollup) {
    match rollups.iter_mut().find(|r| {
        r.date == rollup.date && r.engine == rollup.engine && r.benchmark == rollup.benchmark
    }) {
        Some(existing) => *existing = rollup,
        None => rollups.push(rollup),
    }
    rollups.sort_by(|a, b| {
        (&a.engine, &a.benchmark, a.date).cmp(&(&b.engine, &b.benchmark, b.date))
    });
}

/// Fold daily rollups by stream and ISO week.
pub fn weekly_rollups(daily: &[DailyRollup]) -> Vec<WeeklyRollup> {
    struct Acc {
        days: u32,
        total: u64,
        by_status: BTreeMap<String, u64>,
        wins: u64,
        speedup_sum: f64,
        speedup_count: u64,
        max_speedup: Option<f64>,
        queries: BTreeSet<String>,
    }

    let mut groups: BTreeMap<(String, String, i32, u32), Acc> = BTreeMap::new();
    for day in daily {
        let week = day.date.iso_week();
        let acc = groups
            .entry((day.engine.clone(), day.benchmark.clone(), week.year(), week.week()))
            .or_insert_with(|| Acc {
                days: 0,
                total: 0,
                by_status: BTreeMap::new(),
                wins: 0,
                speedup_sum: 0.0,
                speedup_count: 0,
                max_speedup: None,
                queries: BTreeSet::new(),
            });
        acc.days += 1;
        acc.total += day.total;
        for (status, count) in &day.by_status {
            *acc.by_status.entry(status.clone()).or_insert(0) += count;
        }
        acc.wins += day.wins;
        acc.speedup_sum += day.speedup_sum;
        acc.speedup_count += day.speedup_count;
        acc.max_speedup = match (acc.max_speedup, day.max_speedup) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        acc.queries.extend(day.query_ids.iter().cloned());
    }

    groups
        .into_iter()
        .map(|((engine, benchmark, iso_year, iso_week), acc)| WeeklyRollup {
            engine,
            benchmark,
            iso_year,
            iso_week,
            days: acc.days,
            total: acc.total,
            by_status: acc.by_status,
            wins: acc.wins,
            mean_speedup: (acc.speedup_count > 0)
                .then(|| acc.speedup_sum / acc.speedup_count as f64),
            max_speedup: acc.max_speedup,
            distinct_queries: acc.queries.len(),
        })
        .collect()
}
