//! Rule command for Stratum.
//!
//! Validates a detection rule file against the feature vocabulary before it
//! is handed to an operator or checked in.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::features::FeatureVocabulary;
use crate::core::rules::{parse_rule, Priority, RuleError};
use crate::util::read_to_string_limited;

/// Options for the rule command.
#[derive(Debug, Clone, Default)]
pub struct RuleOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
}

/// Output format for `rule validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOutput {
    /// Whether the rule is valid.
    pub success: bool,
    pub file: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Every problem found, with its path in the rule tree.
    pub errors: Vec<RuleError>,
    /// Vocabulary version the rule was checked against.
    pub vocabulary_version: u32,
}

/// The rule command implementation.
pub struct RuleCommand {
    #[allow(dead_code)]
    config: Config,
    vocabulary: FeatureVocabulary,
}

impl RuleCommand {
    /// Create a new rule command.
    pub fn new(config: Config, _project_path: impl AsRef<Path>) -> Self {
        Self {
            config,
            vocabulary: FeatureVocabulary::standard(),
        }
    }

    /// Validate the rule in `file`.
    pub fn validate(&self, file: &Path, _options: &RuleOptions) -> RuleOutput {
        let mut output = RuleOutput {
            success: false,
            file: file.to_path_buf(),
            gap_id: None,
            priority: None,
            errors: Vec::new(),
            vocabulary_version: self.vocabulary.version,
        };

        let content = match read_to_string_limited(file) {
            Ok(c) => c,
            Err(e) => {
                output.errors.push(RuleError {
                    path: "<file>".to_string(),
                    message: e.to_string(),
                });
                return output;
            }
        };

        match parse_rule(&content, &self.vocabulary) {
            Ok((raw, compiled)) => {
                output.success = true;
                output.gap_id = Some(compiled.gap_id);
                output.priority = Some(raw.priority);
            }
            Err(errors) => output.errors = errors,
        }
        output
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &RuleOutput, options: &RuleOptions) -> String {
        if options.quiet {
            return String::new();
        }

        if options.json {
            serde_json::to_string_pretty(output).unwrap_or_else(|_| "{}".to_string())
        } else {
            self.format_human_readable(output)
        }
    }

    fn format_human_readable(&self, output: &RuleOutput) -> String {
        if output.success {
            return format!(
                "{}: valid rule for gap '{}' ({})",
                output.file.display(),
                output.gap_id.as_deref().unwrap_or_default(),
                output.priority.map(Priority::label).unwrap_or_default()
            );
        }

        let mut lines = vec![format!(
            "{}: {} problem(s)",
            output.file.display(),
            output.errors.len()
        )];
        for error in &output.errors {
            lines.push(format!("  {}", error));
        }
        lines.join("\n")
    }
}
