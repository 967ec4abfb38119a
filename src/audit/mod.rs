//! Audit trail for compaction.
//!
//! The audit log (`<data>/audit.log`) is an append-only JSONL record of
//! operator-facing events. A summary (`<data>/audit-summary.json`) is
//! materialized from it for `stratum status`.

pub mod log;
pub mod summary;

pub use log::{AuditEvent, AuditEventType, AuditLog, AuditSink, MemoryAudit, AUDIT_SCHEMA_VERSION};
pub use summary::{AuditSummary, AuditSummaryManager, GateStats, RetentionStats, StageStats};
