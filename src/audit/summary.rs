//! Audit summary materialized from the audit log.
//!
//! The log is the source of truth. The summary is rebuilt when its processed
//! count no longer matches the number of log lines.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::log::{AuditEvent, AuditEventType, AuditLog};
use crate::error::Result;
use crate::storage::layers::Transition;
use crate::util::{read_to_string_limited, write_json_atomic};

/// Counters for one derivation stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub commits: u32,
    /// Records produced across all commits.
    pub produced: u64,
    pub retries: u32,
    pub dead_letters: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<DateTime<Utc>>,
}

/// Evidence gate counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStats {
    pub entries_rejected: u32,
    pub rules_rejected: u32,
    pub examples_rejected: u32,
    pub conflicts: u32,
    /// Rejection reasons with counts.
    pub rejection_reasons: BTreeMap<String, u32>,
}

/// Retention counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionStats {
    pub passes: u32,
    pub partitions_rolled: u64,
    pub records_stripped: u64,
}

/// Aggregated view of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub generated_at: DateTime<Utc>,
    pub log_entries_processed: usize,
    /// Keyed by transition name.
    pub stages: BTreeMap<String, StageStats>,
    pub gate: GateStats,
    pub retention: RetentionStats,
    pub pending_abandoned: u32,
    pub dead_letters_released: u32,
}

impl Default for AuditSummary {
    fn default() -> Self {
        Self {
            generated_at: Utc::now(),
            log_entries_processed: 0,
            stages: BTreeMap::new(),
            gate: GateStats::default(),
            retention: RetentionStats::default(),
            pending_abandoned: 0,
            dead_letters_released: 0,
        }
    }
}

impl AuditSummary {
    /// Build a summary from a list of events.
    pub fn from_events(events: &[AuditEvent]) -> Self {
        let mut summary = Self::default();
        for event in events {
            summary.process_event(event);
        }
        summary.log_entries_processed = events.len();
        summary
    }

    fn process_event(&mut self, event: &AuditEvent) {
        match &event.data {
            AuditEventType::EvidenceRejected { reason, .. } => {
                self.gate.entries_rejected += 1;
                *self
                    .gate
                    .rejection_reasons
                    .entry(reason.clone())
                    .or_insert(0) += 1;
            }
            AuditEventType::RuleRejected { .. } => self.gate.rules_rejected += 1,
            AuditEventType::ExampleRejected { .. } => self.gate.examples_rejected += 1,
            AuditEventType::ConflictRecorded { .. } => self.gate.conflicts += 1,
            AuditEventType::StageRetried { transition, .. } => {
                self.stage(*transition).retries += 1;
            }
            AuditEventType::DeadLettered { transition, .. } => {
                self.stage(*transition).dead_letters += 1;
            }
            AuditEventType::DeadLetterReleased { .. } => self.dead_letters_released += 1,
            AuditEventType::Committed {
                transition,
                produced,
                ..
            } => {
                let stats = self.stage(*transition);
                stats.commits += 1;
                stats.produced += u64::from(*produced);
                stats.last_commit = Some(stats.last_commit.map_or(event.ts, |t| t.max(event.ts)));
            }
            AuditEventType::PendingAbandoned { .. } => self.pending_abandoned += 1,
            AuditEventType::RetentionApplied {
                partitions_rolled,
                records_stripped,
            } => {
                self.retention.passes += 1;
                self.retention.partitions_rolled += *partitions_rolled as u64;
                self.retention.records_stripped += *records_stripped as u64;
            }
        }
    }

    fn stage(&mut self, transition: Transition) -> &mut StageStats {
        self.stages.entry(transition.as_str().to_string()).or_default()
    }

    /// Stats for one stage, if it ever ran.
    pub fn stage_stats(&self, transition: Transition) -> Option<&StageStats> {
        self.stages.get(transition.as_str())
    }

    /// Check if the summary is stale compared to the log.
    pub fn is_stale(&self, log_line_count: usize) -> bool {
        self.log_entries_processed != log_line_count
    }

    /// Dead letters parked minus dead letters released.
    pub fn outstanding_dead_letters(&self) -> u32 {
        let parked: u32 = self.stages.values().map(|s| s.dead_letters).sum();
        parked.saturating_sub(self.dead_letters_released)
    }
}

/// Loads, saves and rebuilds the summary next to its log.
#[derive(Debug, Clone)]
pub struct AuditSummaryManager {
    summary_path: PathBuf,
    log: AuditLog,
}

impl AuditSummaryManager {
    pub fn new(summary_path: impl AsRef<Path>, log_path: impl AsRef<Path>) -> Self {
        Self {
            summary_path: summary_path.as_ref().to_path_buf(),
            log: AuditLog::new(log_path),
        }
    }

    /// Manager for `audit-summary.json` and `audit.log` in a data directory.
    pub fn in_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        Self::new(dir.join("audit-summary.json"), dir.join("audit.log"))
    }

    pub fn load(&self) -> Result<Option<AuditSummary>> {
        if !self.summary_path.exists() {
            return Ok(None);
        }
        let content = read_to_string_limited(&self.summary_path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, summary: &AuditSummary) -> Result<()> {
        write_json_atomic(&self.summary_path, summary)
    }

    /// Rebuild the summary from the log and save it.
    pub fn rebuild(&self) -> Result<AuditSummary> {
        let events = self.log.read_all()?;
        let summary = AuditSummary::from_events(&events);
        self.save(&summary)?;
        Ok(summary)
    }

    /// Load the saved summary, rebuilding it when stale or unreadable.
    pub fn load_or_rebuild(&self) -> Result<AuditSummary> {
        let count = self.log.count()?;
        if let Ok(Some(summary)) = self.load() {
            if !summary.is_stale(count) {
                return Ok(summary);
            }
        }
        self.rebuild()
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }
}
