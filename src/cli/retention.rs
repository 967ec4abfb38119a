//! Retention command for Stratum.
//!
//! Rolls outcome partitions older than the retention window into daily
//! summaries and strips their bulk text. Keys and sequence numbers stay, so
//! derived records keep resolving.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEventType, AuditSink};
use crate::cli::Stores;
use crate::config::Config;
use crate::storage::{weekly_rollups, OutcomeStore, RetentionReport, WeeklyRollup};

/// Options for the retention command.
#[derive(Debug, Clone, Default)]
pub struct RetentionOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
    /// Override `retention.window_days`.
    pub window_days: Option<u32>,
}

/// Output format for the retention command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionOutput {
    pub success: bool,
    pub window_days: u32,
    pub report: RetentionReport,
    /// Weekly view over every rollup so far.
    pub weekly: Vec<WeeklyRollup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The retention command implementation.
pub struct RetentionCommand {
    config: Config,
    project_path: PathBuf,
}

impl RetentionCommand {
    /// Create a new retention command.
    pub fn new(config: Config, project_path: impl AsRef<Path>) -> Self {
        Self {
            config,
            project_path: project_path.as_ref().to_path_buf(),
        }
    }

    /// Run one retention pass.
    pub fn run(&self, options: &RetentionOptions) -> RetentionOutput {
        let window_days = options.window_days.unwrap_or(self.config.retention.window_days);
        let mut output = RetentionOutput {
            success: false,
            window_days,
            report: RetentionReport::default(),
            weekly: Vec::new(),
            error: None,
        };

        let result = Stores::open(&self.config, &self.project_path).and_then(|stores| {
            let report = stores.outcomes.apply_retention(Utc::now(), window_days)?;
            if report.partitions_rolled > 0 {
                stores.audit.record(AuditEventType::RetentionApplied {
                    partitions_rolled: report.partitions_rolled,
                    records_stripped: report.records_stripped,
                });
            }
            let weekly = weekly_rollups(&stores.outcomes.rollups()?);
            Ok((report, weekly))
        });

        match result {
            Ok((report, weekly)) => {
                output.success = true;
                output.report = report;
                output.weekly = weekly;
            }
            Err(e) => output.error = Some(e.to_string()),
        }
        output
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &RetentionOutput, options: &RetentionOptions) -> String {
        if options.quiet {
            return String::new();
        }

        if options.json {
            serde_json::to_string_pretty(output).unwrap_or_else(|_| "{}".to_string())
        } else {
            self.format_human_readable(output)
        }
    }

    fn format_human_readable(&self, output: &RetentionOutput) -> String {
        if let Some(error) = &output.error {
            return format!("Retention failed: {}", error);
        }

        let mut lines = vec![format!(
            "Retention ({} day window): {} partition(s) rolled, {} record(s) stripped",
            output.window_days, output.report.partitions_rolled, output.report.records_stripped
        )];
        if let Some(cutoff) = output.report.cutoff {
            lines.push(format!("Cutoff: {}", cutoff));
        }

        if !output.weekly.is_empty() {
            lines.push("Weekly rollups:".to_string());
            for w in &output.weekly {
                let speedup = w
                    .mean_speedup
                    .map(|s| format!("{:.2}x mean", s))
                    .unwrap_or_else(|| "no speedups".to_string());
                lines.push(format!(
                    "  {}/{} {}-W{:02}: {} outcome(s), {} win(s), {}",
                    w.engine, w.benchmark, w.iso_year, w.iso_week, w.total, w.wins, speedup
                ));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::outcome::{fixtures, OutcomeKey, StreamId};
    use crate::storage::FileOutcomeStore;
    use chrono::Duration;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = Some(temp.path().join("data"));
        config
    }

    #[test]
    fn test_rolls_old_partitions_and_audits() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        {
            let store = FileOutcomeStore::open(&data).unwrap();
            let old = Utc::now() - Duration::days(60);
            store
                .append(fixtures::win("q1", "r1").with_recorded_at(old))
                .unwrap();
            store.append(fixtures::win("q2", "r1")).unwrap();
        }

        let cmd = RetentionCommand::new(config(&temp), temp.path());
        let output = cmd.run(&RetentionOptions::default());
        assert!(output.success, "{:?}", output.error);
        assert_eq!(output.window_days, 30);
        assert_eq!(output.report.partitions_rolled, 1);
        assert_eq!(output.report.records_stripped, 1);
        assert_eq!(output.weekly.len(), 1);
        assert_eq!(output.weekly[0].total, 1);

        let store = FileOutcomeStore::open(&data).unwrap();
        let old = store
            .get(&OutcomeKey::new("q1", "r1", "w1"))
            .unwrap()
            .expect("key survives retention");
        assert!(old.outcome.original_sql.is_none());
        assert_eq!(store.head(&StreamId::new("duckdb", "tpcds")).unwrap(), 2);

        let audit = std::fs::read_to_string(data.join("audit.log")).unwrap();
        assert!(audit.contains(r#""event":"retention_applied""#));
    }

    #[test]
    fn test_window_override_and_nothing_to_do() {
        let temp = TempDir::new().unwrap();
        let cmd = RetentionCommand::new(config(&temp), temp.path());
        let output = cmd.run(&RetentionOptions {
            window_days: Some(7),
            ..RetentionOptions::default()
        });
        assert!(output.success);
        assert_eq!(output.window_days, 7);
        assert_eq!(output.report.partitions_rolled, 0);
        assert!(!temp.path().join("data").join("audit.log").exists());

        let human = cmd.format_output(&output, &RetentionOptions::default());
        assert!(human.contains("7 day window"));
    }
}
