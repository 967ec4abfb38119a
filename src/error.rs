//! Unified error types for Stratum.
//!
//! Errors are split along the boundary they cross. [`StratumError`] covers
//! ingestion, storage, configuration and the derivation stages. Query-path
//! failures use the separate [`QueryError`] so callers can route gate
//! failures and timeouts to a fallback without inspecting message strings.
//!
//! Background work (compaction, retention) never propagates errors to the
//! pipeline. Those paths use [`FailOpen`] to log and continue.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for Stratum operations.
#[derive(Error, Debug)]
pub enum StratumError {
    /// I/O errors from partition, snapshot or audit files.
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An ingested record is missing a required field or carries an
    /// out-of-range value. Rejected synchronously; the caller fixes and retries.
    #[error("validation error on '{field}': {message}")]
    Validation { field: String, message: String },

    /// JSON or TOML serialization errors.
    #[error("serialization error: {message}")]
    Serde { message: String },

    /// State machine violations (cursor regression, double run).
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// Configuration loading errors.
    #[error("config error: {message}")]
    Config { message: String },

    /// A derivation stage exhausted its retries.
    #[error("{stage} stage failed after {attempts} attempt(s): {message}")]
    Stage {
        stage: String,
        attempts: u32,
        message: String,
    },

    /// A feature name or value that the vocabulary does not declare.
    #[error("vocabulary error: {message}")]
    Vocabulary { message: String },

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The ingest pipeline has shut down.
    #[error("ingest channel closed")]
    IngestClosed,
}

/// A specialized Result type for Stratum operations.
pub type Result<T> = std::result::Result<T, StratumError>;

impl StratumError {
    /// Create a storage error from an I/O error.
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Create a validation error for a named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error.
    pub fn serde(message: impl Into<String>) -> Self {
        Self::Serde {
            message: message.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a stage failure.
    pub fn stage(stage: impl Into<String>, attempts: u32, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Create a vocabulary error.
    pub fn vocabulary(message: impl Into<String>) -> Self {
        Self::Vocabulary {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the caller caused this error and should fix the input
    /// rather than retry unchanged.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::Vocabulary { .. })
    }
}

impl From<io::Error> for StratumError {
    fn from(err: io::Error) -> Self {
        Self::Storage {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for StratumError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde {
            message: err.to_string(),
        }
    }
}

/// Why a query could not be answered from cached knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateFailureReason {
    /// No snapshot has been committed for the engine yet.
    ColdCache,
    /// The snapshot has no gold examples to offer.
    MissingExamples,
    /// The snapshot has no engine profile entries.
    MissingProfile,
    /// The engine was disabled for this process by the fallback context.
    EngineDisabled,
}

impl fmt::Display for GateFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateFailureReason::ColdCache => write!(f, "no committed knowledge (cold cache)"),
            GateFailureReason::MissingExamples => write!(f, "required field matched_examples is empty"),
            GateFailureReason::MissingProfile => write!(f, "required field engine_profile is empty"),
            GateFailureReason::EngineDisabled => write!(f, "engine disabled by fallback context"),
        }
    }
}

/// Query-path errors. Both variants are fail-fast: neither is retried, and
/// neither carries a partial payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// A required response field could not be produced.
    #[error("gate failure for engine '{engine}': {reason}")]
    GateFailure {
        engine: String,
        reason: GateFailureReason,
    },

    /// The latency budget elapsed before an answer was ready.
    #[error("knowledge query timed out after {budget_ms}ms")]
    Timeout { budget_ms: u64 },
}

impl QueryError {
    /// Create a gate failure.
    pub fn gate(engine: impl Into<String>, reason: GateFailureReason) -> Self {
        Self::GateFailure {
            engine: engine.into(),
            reason,
        }
    }

    /// Check whether this is a gate failure (as opposed to a timeout).
    pub fn is_gate_failure(&self) -> bool {
        matches!(self, Self::GateFailure { .. })
    }
}

/// Trait for fail-open error handling on background paths.
///
/// Compaction and retention must never take the service down. These helpers
/// log the error as a warning and substitute a safe value.
pub trait FailOpen<T> {
    /// Handle an error by logging a warning and returning the default value.
    fn fail_open_default(self, context: &str) -> T
    where
        T: Default;

    /// Handle an error by logging a warning and returning the provided fallback.
    fn fail_open_with(self, context: &str, fallback: T) -> T;
}

impl<T> FailOpen<T> for Result<T> {
    fn fail_open_default(self, context: &str) -> T
    where
        T: Default,
    {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("{}: {} (fail-open: using default)", context, err);
                T::default()
            }
        }
    }

    fn fail_open_with(self, context: &str, fallback: T) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("{}: {} (fail-open: using fallback)", context, err);
                fallback
            }
        }
    }
}

/// Exit codes for the Stratum CLI.
pub mod exit_codes {
    /// The command completed.
    pub const SUCCESS: u8 = 0;

    /// The command failed (bad input, storage error).
    pub const FAILURE: u8 = 1;

    /// A query could not be answered (gate failure or timeout).
    pub const UNAVAILABLE: u8 = 2;
}
