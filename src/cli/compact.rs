//! Compact command for Stratum.
//!
//! Runs one compaction cycle over every stream with the heuristic oracle.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cli::Stores;
use crate::compaction::{CycleReport, SkipReason, StageOutcome};
use crate::config::Config;
use crate::storage::Transition;

/// Options for the compact command.
#[derive(Debug, Clone, Default)]
pub struct CompactOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
    /// Ignore count and age triggers for extraction and mining.
    pub force: bool,
}

/// One stage run, flattened for output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRunInfo {
    pub transition: Transition,
    pub engine: String,
    pub benchmark: String,
    /// `committed`, `dead_lettered`, `cancelled`, or `skipped:<reason>`.
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub produced: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<String>,
}

/// Output format for the compact command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactOutput {
    /// Whether the cycle ran without storage errors.
    pub success: bool,
    pub committed: usize,
    pub dead_lettered: usize,
    pub errors: usize,
    pub cancelled: bool,
    pub runs: Vec<StageRunInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompactOutput {
    fn from_report(report: &CycleReport) -> Self {
        let runs = report
            .runs
            .iter()
            .map(|run| {
                let mut info = StageRunInfo {
                    transition: run.transition,
                    engine: run.stream.engine.clone(),
                    benchmark: run.stream.benchmark.clone(),
                    result: String::new(),
                    cursor: None,
                    produced: None,
                    dead_letter: None,
                };
                info.result = match &run.outcome {
                    StageOutcome::Committed { cursor, produced } => {
                        info.cursor = Some(*cursor);
                        info.produced = Some(*produced);
                        "committed".to_string()
                    }
                    StageOutcome::DeadLettered { id } => {
                        info.dead_letter = Some(id.clone());
                        "dead_lettered".to_string()
                    }
                    StageOutcome::Cancelled => "cancelled".to_string(),
                    StageOutcome::Skipped(reason) => format!("skipped:{}", skip_label(reason)),
                };
                info
            })
            .collect();

        Self {
            success: report.errors == 0,
            committed: report.committed(),
            dead_lettered: report.dead_lettered(),
            errors: report.errors,
            cancelled: report.cancelled,
            runs,
            error: None,
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            committed: 0,
            dead_lettered: 0,
            errors: 0,
            cancelled: false,
            runs: Vec::new(),
            error: Some(error.into()),
        }
    }
}

fn skip_label(reason: &SkipReason) -> String {
    match reason {
        SkipReason::Busy => "busy".to_string(),
        SkipReason::Parked(id) => format!("parked({})", id),
        SkipReason::NotDue => "not_due".to_string(),
    }
}

/// The compact command implementation.
pub struct CompactCommand {
    config: Config,
    project_path: PathBuf,
}

impl CompactCommand {
    /// Create a new compact command.
    pub fn new(config: Config, project_path: impl AsRef<Path>) -> Self {
        Self {
            config,
            project_path: project_path.as_ref().to_path_buf(),
        }
    }

    /// Run one cycle. `cancel` stops it between stage runs.
    pub async fn run(&self, options: &CompactOptions, cancel: &CancellationToken) -> CompactOutput {
        let stores = match Stores::open(&self.config, &self.project_path) {
            Ok(s) => s,
            Err(e) => return CompactOutput::failure(e.to_string()),
        };
        let engine = stores.engine(&self.config);

        match engine.run_cycle(options.force, cancel).await {
            Ok(report) => {
                tracing::info!(
                    committed = report.committed(),
                    dead_lettered = report.dead_lettered(),
                    errors = report.errors,
                    force = options.force,
                    "compaction finished"
                );
                CompactOutput::from_report(&report)
            }
            Err(e) => CompactOutput::failure(e.to_string()),
        }
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &CompactOutput, options: &CompactOptions) -> String {
        if options.quiet {
            return String::new();
        }

        if options.json {
            serde_json::to_string_pretty(output).unwrap_or_else(|_| "{}".to_string())
        } else {
            self.format_human_readable(output)
        }
    }

    fn format_human_readable(&self, output: &CompactOutput) -> String {
        if let Some(error) = &output.error {
            return format!("Compaction failed: {}", error);
        }

        let mut lines = Vec::new();
        for run in output.runs.iter().filter(|r| r.result != "skipped:not_due") {
            let mut line = format!(
                "  {:<8} {}/{}  {}",
                run.transition.as_str(),
                run.engine,
                run.benchmark,
                run.result
            );
            if let (Some(cursor), Some(produced)) = (run.cursor, run.produced) {
                line.push_str(&format!(" (cursor {}, produced {})", cursor, produced));
            }
            if let Some(id) = &run.dead_letter {
                line.push_str(&format!(" ({})", id));
            }
            lines.push(line);
        }
        if lines.is_empty() {
            lines.push("Nothing to compact".to_string());
        } else {
            lines.insert(0, "Stage runs:".to_string());
        }

        lines.push(format!(
            "{} committed, {} dead-lettered, {} error(s){}",
            output.committed,
            output.dead_lettered,
            output.errors,
            if output.cancelled { " (cancelled)" } else { "" }
        ));
        lines.join("\n")
    }
}
