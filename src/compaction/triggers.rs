//! Trigger conditions and batch collection for each transition.

use chrono::{DateTime, Duration, Utc};

use crate::config::TriggerConfig;
use crate::core::knowledge::{Finding, Pattern, PatternStatus};
use crate::core::outcome::{OutcomeKey, StoredOutcome, StreamId};
use crate::storage::layers::{Cursor, LayerState};

/// Terminal outcomes after an extraction cursor.
#[derive(Debug, Clone, Default)]
pub struct OutcomeBatch {
    pub from: u64,
    /// Cursor position once the batch is consumed.
    pub to: u64,
    pub records: Vec<StoredOutcome>,
    /// Pending outcomes past their grace period, skipped.
    pub abandoned: Vec<OutcomeKey>,
    /// A pending outcome inside its grace period stopped the walk.
    pub halted: bool,
}

impl OutcomeBatch {
    /// Nothing to consume and nothing to skip.
    pub fn is_empty(&self) -> bool {
        self.to == self.from
    }
}

/// Walk records after the cursor in sequence order.
///
/// Terminal records are taken. A pending record younger than `grace` halts
/// the walk just before it. An older pending record is abandoned: its run
/// is dead and waiting longer would block the stream forever.
pub fn collect_outcomes(
    from: u64,
    records: Vec<StoredOutcome>,
    now: DateTime<Utc>,
    grace: Duration,
) -> OutcomeBatch {
    let mut batch = OutcomeBatch {
        from,
        to: from,
        ..OutcomeBatch::default()
    };

    for record in records {
        if record.outcome.is_terminal() {
            batch.to = record.seq;
            batch.records.push(record);
        } else if now.signed_duration_since(record.outcome.recorded_at) >= grace {
            batch.to = record.seq;
            batch.abandoned.push(record.outcome.key());
        } else {
            batch.halted = true;
            break;
        }
    }
    batch
}

/// L1 → L2: enough new terminal outcomes, or the oldest one has waited
/// longer than the maximum age.
///
/// The age is measured from the last run, or from the oldest record in the
/// batch when the stream never ran.
pub fn extraction_due(
    batch: &OutcomeBatch,
    cursor: &Cursor,
    triggers: &TriggerConfig,
    now: DateTime<Utc>,
) -> bool {
    if batch.records.is_empty() {
        return false;
    }
    if batch.records.len() >= triggers.extract_min_entries as usize {
        return true;
    }

    let since = cursor.last_run_at.or_else(|| {
        batch
            .records
            .iter()
            .map(|r| r.outcome.recorded_at)
            .min()
    });
    let max_age = Duration::hours(i64::from(triggers.extract_max_age_hours));
    since.is_some_and(|t| now.signed_duration_since(t) >= max_age)
}

/// Active findings of a stream after the mining cursor.
pub fn collect_findings<'a>(state: &'a LayerState, stream: &StreamId, cursor: &Cursor) -> Vec<&'a Finding> {
    state.findings_since(stream, cursor.position)
}

/// L2 → L3: enough new findings.
pub fn mining_due(new_findings: usize, triggers: &TriggerConfig) -> bool {
    new_findings > 0 && new_findings >= triggers.mine_min_findings as usize
}

/// Whether a pattern meets the promotion thresholds.
pub fn promotable(pattern: &Pattern, triggers: &TriggerConfig) -> bool {
    pattern.status == PatternStatus::Candidate
        && pattern.wins >= triggers.promote_min_wins
        && pattern.success_rate >= triggers.promote_min_success_rate
        && !pattern.finding_ids.is_empty()
}

/// Candidate patterns changed since the promotion cursor.
#[derive(Debug, Clone, Default)]
pub struct PatternBatch {
    pub from: u64,
    /// Highest revision among the stream's patterns when collected.
    pub to: u64,
    pub patterns: Vec<Pattern>,
}

/// L3 → L4: collect patterns of a stream that changed since the cursor and
/// meet the promotion thresholds. An empty batch means not due.
pub fn collect_patterns(
    state: &LayerState,
    stream: &StreamId,
    cursor: &Cursor,
    triggers: &TriggerConfig,
) -> PatternBatch {
    let stream_patterns = state.patterns_of(stream);
    let to = stream_patterns
        .iter()
        .map(|p| p.revision)
        .max()
        .unwrap_or(cursor.position)
        .max(cursor.position);

    let patterns = stream_patterns
        .into_iter()
        .filter(|p| p.revision > cursor.position && promotable(p, triggers))
        .cloned()
        .collect();

    PatternBatch {
        from: cursor.position,
        to,
        patterns,
    }
}
