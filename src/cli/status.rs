//! Status command for Stratum.
//!
//! Shows per-stream cursors against the outcome log head, layer record
//! counts, published knowledge versions and the audit summary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audit::{AuditSummary, AuditSummaryManager};
use crate::cli::Stores;
use crate::config::Config;
use crate::core::knowledge::KnowledgeVersion;
use crate::storage::{LayerState, OutcomeStore, Transition};

/// Options for the status command.
#[derive(Debug, Clone, Default)]
pub struct StatusOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
    /// Rebuild the audit summary from the log.
    pub rebuild: bool,
}

/// Progress of one stream through the layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub engine: String,
    pub benchmark: String,
    /// Last outcome sequence in the log.
    pub head: u64,
    pub extract_cursor: u64,
    pub mine_cursor: u64,
    pub promote_cursor: u64,
    /// Dead letters parking this stream.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parked_by: Vec<String>,
}

/// Record counts per layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerCounts {
    pub findings: usize,
    pub active_findings: usize,
    pub patterns: usize,
    pub entries: usize,
    pub examples: usize,
    pub active_examples: usize,
}

impl LayerCounts {
    fn from_state(state: &LayerState) -> Self {
        Self {
            findings: state.findings.len(),
            active_findings: state.findings.values().filter(|f| f.is_active()).count(),
            patterns: state.patterns.len(),
            entries: state.entries.len(),
            examples: state.examples.len(),
            active_examples: state.examples.values().filter(|e| e.is_active()).count(),
        }
    }
}

/// Output format for the status command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusOutput {
    pub success: bool,
    pub data_dir: PathBuf,
    pub outcomes: usize,
    pub streams: Vec<StreamStatus>,
    pub layers: LayerCounts,
    pub published: BTreeMap<String, KnowledgeVersion>,
    pub dead_letters: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusOutput {
    fn failure(data_dir: PathBuf, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data_dir,
            outcomes: 0,
            streams: Vec::new(),
            layers: LayerCounts::default(),
            published: BTreeMap::new(),
            dead_letters: 0,
            audit: None,
            warnings: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// The status command implementation.
pub struct StatusCommand {
    config: Config,
    project_path: PathBuf,
}

impl StatusCommand {
    /// Create a new status command.
    pub fn new(config: Config, project_path: impl AsRef<Path>) -> Self {
        Self {
            config,
            project_path: project_path.as_ref().to_path_buf(),
        }
    }

    /// Run the status command.
    pub fn run(&self, options: &StatusOptions) -> StatusOutput {
        let stores = match Stores::open(&self.config, &self.project_path) {
            Ok(s) => s,
            Err(e) => {
                return StatusOutput::failure(self.config.data_dir(&self.project_path), e.to_string())
            }
        };
        match self.collect(&stores, options) {
            Ok(output) => output,
            Err(e) => StatusOutput::failure(stores.data_dir, e.to_string()),
        }
    }

    fn collect(&self, stores: &Stores, options: &StatusOptions) -> crate::error::Result<StatusOutput> {
        let state = stores.layers.state()?;

        let mut streams = Vec::new();
        for stream in stores.outcomes.streams()? {
            streams.push(StreamStatus {
                head: stores.outcomes.head(&stream)?,
                extract_cursor: state.cursor(Transition::Extract, &stream).position,
                mine_cursor: state.cursor(Transition::Mine, &stream).position,
                promote_cursor: state.cursor(Transition::Promote, &stream).position,
                parked_by: state
                    .dead_letters
                    .values()
                    .filter(|d| d.stream() == stream)
                    .map(|d| d.id.clone())
                    .collect(),
                engine: stream.engine,
                benchmark: stream.benchmark,
            });
        }

        let mut warnings = Vec::new();
        let manager = AuditSummaryManager::in_data_dir(&stores.data_dir);
        let summary = if options.rebuild {
            manager.rebuild()
        } else {
            manager.load_or_rebuild()
        };
        let audit = match summary {
            Ok(s) => Some(s),
            Err(e) => {
                warnings.push(format!("Failed to load audit summary: {}", e));
                None
            }
        };

        Ok(StatusOutput {
            success: true,
            data_dir: stores.data_dir.clone(),
            outcomes: stores.outcomes.len()?,
            streams,
            layers: LayerCounts::from_state(&state),
            published: state.published.clone(),
            dead_letters: state.dead_letters.len(),
            audit,
            warnings,
            error: None,
        })
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &StatusOutput, options: &StatusOptions) -> String {
        if options.quiet {
            return String::new();
        }

        if options.json {
            serde_json::to_string_pretty(output).unwrap_or_else(|_| "{}".to_string())
        } else {
            self.format_human_readable(output)
        }
    }

    fn format_human_readable(&self, output: &StatusOutput) -> String {
        if let Some(error) = &output.error {
            return format!("Status unavailable: {}", error);
        }

        let mut lines = vec![
            format!("Data directory: {}", output.data_dir.display()),
            format!("Outcomes: {}", output.outcomes),
        ];

        if !output.streams.is_empty() {
            lines.push(String::new());
            lines.push("Streams (head / extract / mine / promote):".to_string());
            for s in &output.streams {
                let mut line = format!(
                    "  {}/{}  {} / {} / {} / {}",
                    s.engine, s.benchmark, s.head, s.extract_cursor, s.mine_cursor, s.promote_cursor
                );
                if !s.parked_by.is_empty() {
                    line.push_str(&format!("  parked by {}", s.parked_by.join(", ")));
                }
                lines.push(line);
            }
        }

        let l = &output.layers;
        lines.push(String::new());
        lines.push(format!(
            "Findings: {} ({} active)  Patterns: {}  Entries: {}  Examples: {} ({} active)",
            l.findings, l.active_findings, l.patterns, l.entries, l.examples, l.active_examples
        ));

        if !output.published.is_empty() {
            let published: Vec<String> = output
                .published
                .iter()
                .map(|(engine, version)| format!("{} v{}", engine, version))
                .collect();
            lines.push(format!("Published: {}", published.join(", ")));
        }
        if output.dead_letters > 0 {
            lines.push(format!(
                "Dead letters: {} (see `stratum dead-letters`)",
                output.dead_letters
            ));
        }

        if let Some(audit) = &output.audit {
            lines.push(String::new());
            lines.push("Audit:".to_string());
            for (stage, stats) in &audit.stages {
                lines.push(format!(
                    "  {:<8} {} commit(s), {} produced, {} retries, {} dead letter(s)",
                    stage, stats.commits, stats.produced, stats.retries, stats.dead_letters
                ));
            }
            let gate = &audit.gate;
            lines.push(format!(
                "  gate     {} entries, {} rules, {} examples rejected; {} conflict(s)",
                gate.entries_rejected, gate.rules_rejected, gate.examples_rejected, gate.conflicts
            ));
        }

        for warning in &output.warnings {
            lines.push(format!("Warning: {}", warning));
        }
        lines.join("\n")
    }
}
