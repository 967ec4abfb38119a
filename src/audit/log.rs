//! Audit event types and the JSONL audit log.
//!
//! Operator-facing events from compaction (evidence rejections, retries,
//! dead letters, commits) are appended to `audit.log` in the data
//! directory. They never propagate to pipeline callers.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::outcome::{OutcomeKey, StreamId};
use crate::error::{FailOpen, Result, StratumError};
use crate::storage::layers::Transition;
use crate::util::{append_jsonl, read_to_string_limited};

/// Schema version for audit events.
pub const AUDIT_SCHEMA_VERSION: u8 = 1;

/// An audit event as written to the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub v: u8,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub data: AuditEventType,
}

impl AuditEvent {
    pub fn new(data: AuditEventType) -> Self {
        Self::with_timestamp(data, Utc::now())
    }

    pub fn with_timestamp(data: AuditEventType, ts: DateTime<Utc>) -> Self {
        Self {
            v: AUDIT_SCHEMA_VERSION,
            ts,
            data,
        }
    }
}

/// The kind of audit event and its data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEventType {
    /// A proposed entry failed the evidence gate and was left out.
    EvidenceRejected {
        engine: String,
        title: String,
        reason: String,
    },

    /// A proposed detection rule failed validation and was stripped.
    RuleRejected {
        engine: String,
        gap_id: String,
        errors: Vec<String>,
    },

    /// A proposed gold example was left out.
    ExampleRejected {
        engine: String,
        query_id: String,
        reason: String,
    },

    /// A proposal collided with a human-reviewed entry.
    ConflictRecorded {
        entry_id: String,
        engine: String,
        reason: String,
    },

    /// A stage attempt failed and will be retried.
    StageRetried {
        transition: Transition,
        engine: String,
        benchmark: String,
        attempt: u32,
        error: String,
    },

    /// A batch exhausted its retries and was parked.
    DeadLettered {
        id: String,
        transition: Transition,
        engine: String,
        benchmark: String,
        attempts: u32,
        error: String,
    },

    /// An operator released a dead letter for another run.
    DeadLetterReleased { id: String },

    /// A stage committed its output and advanced its cursor.
    Committed {
        transition: Transition,
        engine: String,
        benchmark: String,
        cursor: u64,
        produced: u32,
    },

    /// A pending outcome outlived its grace period and was skipped.
    PendingAbandoned {
        engine: String,
        benchmark: String,
        key: OutcomeKey,
    },

    /// A retention pass rolled aged partitions.
    RetentionApplied {
        partitions_rolled: usize,
        records_stripped: usize,
    },
}

impl AuditEventType {
    pub fn evidence_rejected(
        engine: impl Into<String>,
        title: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::EvidenceRejected {
            engine: engine.into(),
            title: title.into(),
            reason: reason.into(),
        }
    }

    pub fn rule_rejected(
        engine: impl Into<String>,
        gap_id: impl Into<String>,
        errors: Vec<String>,
    ) -> Self {
        Self::RuleRejected {
            engine: engine.into(),
            gap_id: gap_id.into(),
            errors,
        }
    }

    pub fn example_rejected(
        engine: impl Into<String>,
        query_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ExampleRejected {
            engine: engine.into(),
            query_id: query_id.into(),
            reason: reason.into(),
        }
    }

    pub fn conflict(
        entry_id: impl Into<String>,
        engine: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ConflictRecorded {
            entry_id: entry_id.into(),
            engine: engine.into(),
            reason: reason.into(),
        }
    }

    pub fn stage_retried(
        transition: Transition,
        stream: &StreamId,
        attempt: u32,
        error: impl Into<String>,
    ) -> Self {
        Self::StageRetried {
            transition,
            engine: stream.engine.clone(),
            benchmark: stream.benchmark.clone(),
            attempt,
            error: error.into(),
        }
    }

    pub fn dead_lettered(
        id: impl Into<String>,
        transition: Transition,
        stream: &StreamId,
        attempts: u32,
        error: impl Into<String>,
    ) -> Self {
        Self::DeadLettered {
            id: id.into(),
            transition,
            engine: stream.engine.clone(),
            benchmark: stream.benchmark.clone(),
            attempts,
            error: error.into(),
        }
    }

    pub fn committed(transition: Transition, stream: &StreamId, cursor: u64, produced: u32) -> Self {
        Self::Committed {
            transition,
            engine: stream.engine.clone(),
            benchmark: stream.benchmark.clone(),
            cursor,
            produced,
        }
    }

    pub fn pending_abandoned(stream: &StreamId, key: OutcomeKey) -> Self {
        Self::PendingAbandoned {
            engine: stream.engine.clone(),
            benchmark: stream.benchmark.clone(),
            key,
        }
    }

    /// Get the event name as a string.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::EvidenceRejected { .. } => "evidence_rejected",
            Self::RuleRejected { .. } => "rule_rejected",
            Self::ExampleRejected { .. } => "example_rejected",
            Self::ConflictRecorded { .. } => "conflict_recorded",
            Self::StageRetried { .. } => "stage_retried",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::DeadLetterReleased { .. } => "dead_letter_released",
            Self::Committed { .. } => "committed",
            Self::PendingAbandoned { .. } => "pending_abandoned",
            Self::RetentionApplied { .. } => "retention_applied",
        }
    }
}

/// Destination for audit events.
///
/// Recording never fails from the caller's point of view; sinks that can
/// fail log the problem and drop the event.
pub trait AuditSink: Send + Sync {
    fn record(&self, data: AuditEventType);
}

/// JSONL audit log on disk.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// The audit log inside a data directory.
    pub fn in_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join("audit.log"))
    }

    /// Append an event.
    pub fn append(&self, event: &AuditEvent) -> Result<()> {
        append_jsonl(&self.path, std::slice::from_ref(event)).map(|_| ())
    }

    /// Read all events from the log.
    pub fn read_all(&self) -> Result<Vec<AuditEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = read_to_string_limited(&self.path)?;

        let mut events = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(line).map_err(|e| {
                StratumError::serde(format!(
                    "failed to parse audit event on line {}: {}",
                    line_num + 1,
                    e
                ))
            })?;
            events.push(event);
        }
        Ok(events)
    }

    /// Count the events in the log.
    pub fn count(&self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let content = read_to_string_limited(&self.path)?;
        Ok(content.lines().filter(|l| !l.trim().is_empty()).count())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for AuditLog {
    fn record(&self, data: AuditEventType) {
        tracing::debug!(event = data.event_name(), "audit");
        self.append(&AuditEvent::new(data))
            .fail_open_default("failed to write audit event");
    }
}

/// Audit sink that keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of recorded events with the given name.
    pub fn count_of(&self, name: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.data.event_name() == name)
            .count()
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, data: AuditEventType) {
        if let Ok(mut events) = self.events.lock() {
            events.push(AuditEvent::new(data));
        }
    }
}
