//! Ingest command for Stratum.
//!
//! Reads outcomes from a JSONL file (one outcome per line) and feeds them
//! through the ingest service, so the CLI applies exactly the validation a
//! producer would see.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::cli::Stores;
use crate::config::Config;
use crate::core::features::FeatureVocabulary;
use crate::core::outcome::Outcome;
use crate::service::IngestService;
use crate::util::read_to_string_limited;

/// Options for the ingest command.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
}

/// A line that was not accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedLine {
    /// 1-based line number.
    pub line: usize,
    pub error: String,
}

/// Output format for the ingest command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutput {
    /// Whether every line was accepted and written.
    pub success: bool,
    pub file: PathBuf,
    pub accepted: usize,
    pub rejected: Vec<RejectedLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestOutput {
    fn failure(file: &Path, error: impl Into<String>) -> Self {
        Self {
            success: false,
            file: file.to_path_buf(),
            accepted: 0,
            rejected: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// The ingest command implementation.
pub struct IngestCommand {
    config: Config,
    project_path: PathBuf,
}

impl IngestCommand {
    /// Create a new ingest command.
    pub fn new(config: Config, project_path: impl AsRef<Path>) -> Self {
        Self {
            config,
            project_path: project_path.as_ref().to_path_buf(),
        }
    }

    /// Run the ingest command.
    pub async fn run(&self, file: &Path, _options: &IngestOptions) -> IngestOutput {
        let content = match read_to_string_limited(file) {
            Ok(c) => c,
            Err(e) => return IngestOutput::failure(file, e.to_string()),
        };
        let stores = match Stores::open(&self.config, &self.project_path) {
            Ok(s) => s,
            Err(e) => return IngestOutput::failure(file, e.to_string()),
        };

        let (service, writer) = IngestService::start(
            stores.outcomes,
            FeatureVocabulary::standard(),
            &self.config.ingest,
            Arc::new(Notify::new()),
        );

        let mut accepted = 0;
        let mut rejected = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let result = match serde_json::from_str::<Outcome>(line) {
                Ok(outcome) => service.ingest(outcome).await.map_err(|e| e.to_string()),
                Err(e) => Err(format!("malformed outcome: {}", e)),
            };
            match result {
                Ok(_) => accepted += 1,
                Err(error) => rejected.push(RejectedLine {
                    line: index + 1,
                    error,
                }),
            }
        }

        let flushed = service.flush().await;
        drop(service);
        if let Err(e) = writer.await {
            tracing::warn!(error = %e, "ingest writer did not exit cleanly");
        }

        tracing::info!(accepted, rejected = rejected.len(), file = %file.display(), "ingest finished");

        let error = flushed.err().map(|e| e.to_string());
        IngestOutput {
            success: error.is_none() && rejected.is_empty(),
            file: file.to_path_buf(),
            accepted,
            rejected,
            error,
        }
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &IngestOutput, options: &IngestOptions) -> String {
        if options.quiet {
            return String::new();
        }

        if options.json {
            serde_json::to_string_pretty(output).unwrap_or_else(|_| "{}".to_string())
        } else {
            self.format_human_readable(output)
        }
    }

    fn format_human_readable(&self, output: &IngestOutput) -> String {
        let mut lines = Vec::new();
        if output.accepted > 0 || output.rejected.is_empty() {
            lines.push(format!(
                "Ingested {} outcome(s) from {}",
                output.accepted,
                output.file.display()
            ));
        }
        for rejected in &output.rejected {
            lines.push(format!("  line {}: {}", rejected.line, rejected.error));
        }
        if !output.rejected.is_empty() {
            lines.push(format!("{} line(s) rejected", output.rejected.len()));
        }
        if let Some(error) = &output.error {
            lines.push(format!("Error: {}", error));
        }
        lines.join("\n")
    }
}
