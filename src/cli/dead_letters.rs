//! Dead-letters command for Stratum.
//!
//! Lists parked batches and releases one for another run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cli::Stores;
use crate::compaction::StageOutcome;
use crate::config::Config;
use crate::storage::DeadLetter;

/// Options for the dead-letters command.
#[derive(Debug, Clone, Default)]
pub struct DeadLettersOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
    /// Release this dead letter and rerun its batch.
    pub retry: Option<String>,
}

/// What a retry did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryResult {
    pub id: String,
    /// `committed`, `dead_lettered`, `skipped` or `cancelled`.
    pub result: String,
    /// The new dead letter when the rerun failed again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<String>,
}

impl RetryResult {
    fn new(id: &str, outcome: &StageOutcome) -> Self {
        let (result, dead_letter) = match outcome {
            StageOutcome::Committed { .. } => ("committed", None),
            StageOutcome::DeadLettered { id } => ("dead_lettered", Some(id.clone())),
            StageOutcome::Skipped(_) => ("skipped", None),
            StageOutcome::Cancelled => ("cancelled", None),
        };
        Self {
            id: id.to_string(),
            result: result.to_string(),
            dead_letter,
        }
    }
}

/// Output format for the dead-letters command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLettersOutput {
    pub success: bool,
    /// Dead letters still parked after the command ran.
    pub dead_letters: Vec<DeadLetter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retried: Option<RetryResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeadLettersOutput {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            dead_letters: Vec::new(),
            retried: None,
            error: Some(error.into()),
        }
    }
}

/// The dead-letters command implementation.
pub struct DeadLettersCommand {
    config: Config,
    project_path: PathBuf,
}

impl DeadLettersCommand {
    /// Create a new dead-letters command.
    pub fn new(config: Config, project_path: impl AsRef<Path>) -> Self {
        Self {
            config,
            project_path: project_path.as_ref().to_path_buf(),
        }
    }

    /// List dead letters, retrying one first if asked.
    pub async fn run(&self, options: &DeadLettersOptions, cancel: &CancellationToken) -> DeadLettersOutput {
        let stores = match Stores::open(&self.config, &self.project_path) {
            Ok(s) => s,
            Err(e) => return DeadLettersOutput::failure(e.to_string()),
        };

        let mut retried = None;
        let mut error = None;
        if let Some(id) = &options.retry {
            let engine = stores.engine(&self.config);
            match engine.retry_dead_letter(id, cancel).await {
                Ok(outcome) => retried = Some(RetryResult::new(id, &outcome)),
                Err(e) => error = Some(e.to_string()),
            }
        }

        match stores.layers.state() {
            Ok(state) => DeadLettersOutput {
                success: error.is_none(),
                dead_letters: state.dead_letters.values().cloned().collect(),
                retried,
                error,
            },
            Err(e) => DeadLettersOutput::failure(e.to_string()),
        }
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &DeadLettersOutput, options: &DeadLettersOptions) -> String {
        if options.quiet {
            return String::new();
        }

        if options.json {
            serde_json::to_string_pretty(output).unwrap_or_else(|_| "{}".to_string())
        } else {
            self.format_human_readable(output)
        }
    }

    fn format_human_readable(&self, output: &DeadLettersOutput) -> String {
        let mut lines = Vec::new();
        if let Some(error) = &output.error {
            lines.push(format!("Error: {}", error));
        }
        if let Some(retried) = &output.retried {
            lines.push(format!("Retried {}: {}", retried.id, retried.result));
            if let Some(id) = &retried.dead_letter {
                lines.push(format!("  failed again, parked as {}", id));
            }
        }

        if output.dead_letters.is_empty() {
            lines.push("No dead letters".to_string());
        } else {
            lines.push(format!("{} dead letter(s):", output.dead_letters.len()));
            for d in &output.dead_letters {
                lines.push(format!(
                    "  {} {} {}/{} positions {}..={} after {} attempt(s): {}",
                    d.id,
                    d.transition,
                    d.engine,
                    d.benchmark,
                    d.from_position + 1,
                    d.to_position,
                    d.attempts,
                    d.last_error
                ));
            }
        }
        lines.join("\n")
    }
}
