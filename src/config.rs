//! Configuration loading for Stratum.
//!
//! Configuration follows a precedence chain:
//! 1. Environment variables (highest priority)
//! 2. Project config (`.stratum/config.toml`)
//! 3. User config (`~/.stratum/config.toml`)
//! 4. Defaults (lowest priority)
//!
//! All configuration is optional. In the production profile the evidence
//! gate cannot be switched off, whatever the layers say.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FailOpen, Result, StratumError};

/// Name of the per-project directory.
pub const PROJECT_DIR: &str = ".stratum";

/// Main configuration struct for Stratum.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Deployment profile.
    pub profile: Profile,
    /// Where data files live.
    pub storage: StorageConfig,
    /// Compaction trigger thresholds.
    pub triggers: TriggerConfig,
    /// Pattern mining rules.
    pub mining: MiningConfig,
    /// Promotion behavior.
    pub promotion: PromotionConfig,
    /// Evidence gate.
    pub evidence: EvidenceConfig,
    /// Stage retry policy.
    pub retry: RetryConfig,
    /// Snapshot cache.
    pub cache: CacheConfig,
    /// Query path.
    pub query: QueryConfig,
    /// Ingest path.
    pub ingest: IngestConfig,
    /// Outcome retention.
    pub retention: RetentionConfig,
    /// Background compaction worker.
    pub worker: WorkerConfig,
}

/// Deployment profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Production,
    Development,
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "production" => Ok(Profile::Production),
            "development" => Ok(Profile::Development),
            other => Err(format!("unknown profile '{}'", other)),
        }
    }
}

impl Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Profile::Production => write!(f, "production"),
            Profile::Development => write!(f, "development"),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory. Defaults to the project `.stratum/` directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// Compaction trigger thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TriggerConfig {
    /// New terminal outcomes that fire extraction.
    pub extract_min_entries: u32,
    /// Hours since the last extraction that fire it with any new outcome.
    pub extract_max_age_hours: u32,
    /// New findings that fire mining.
    pub mine_min_findings: u32,
    /// Minimum wins for a candidate pattern to fire promotion.
    pub promote_min_wins: u32,
    /// Minimum success rate for a candidate pattern to fire promotion.
    pub promote_min_success_rate: f64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            extract_min_entries: 50,
            extract_max_age_hours: 24,
            mine_min_findings: 10,
            promote_min_wins: 5,
            promote_min_success_rate: 0.70,
        }
    }
}

/// Check that a rate is finite and within [0.0, 1.0].
pub fn is_valid_rate(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

/// Pattern mining rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MiningConfig {
    /// Distinct query ids a pattern must span.
    pub min_distinct_queries: usize,
    /// Success rate under which an observed pattern is deprecated.
    pub deprecate_below: f64,
    /// Observations required before deprecation applies.
    pub min_observations_to_deprecate: u32,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            min_distinct_queries: 3,
            deprecate_below: 0.30,
            min_observations_to_deprecate: 10,
        }
    }
}

/// Promotion behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromotionConfig {
    /// Let promotion overwrite human-reviewed entries.
    pub allow_human_override: bool,
}

/// Evidence gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvidenceConfig {
    /// Require every cited id to exist. Forced on in production.
    pub required: bool,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self { required: true }
    }
}

/// Stage retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before a batch is dead-lettered.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub base_backoff_ms: u64,
    /// Backoff ceiling.
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    /// Backoff after the given zero-based attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 200,
            max_backoff_ms: 10_000,
        }
    }
}

/// Snapshot cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Seconds before a cached snapshot is refreshed from the store.
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_seconds: 300 }
    }
}

/// Query path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    /// Hard latency budget.
    pub timeout_ms: u64,
    /// Examples returned per query.
    pub max_examples: usize,
    /// Engines that expose executable-plan diagnostics.
    pub plan_diagnostics_engines: Vec<String>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            max_examples: 3,
            plan_diagnostics_engines: vec!["postgres".to_string()],
        }
    }
}

/// Ingest path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    /// Bounded queue capacity between callers and the writer.
    pub queue_capacity: usize,
    /// Outcomes written per blocking append.
    pub batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            batch_size: 64,
        }
    }
}

/// Outcome retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Days of full outcome text kept before rollup.
    pub window_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { window_days: 30 }
    }
}

/// Background compaction worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Seconds between cycles when no ingest notification arrives.
    pub interval_seconds: u64,
    /// Maximum records handed to one stage invocation.
    pub batch_limit: usize,
    /// Minutes a pending outcome may stay pending before it is abandoned.
    pub pending_grace_minutes: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            batch_limit: 500,
            pending_grace_minutes: 60,
        }
    }
}

impl Config {
    /// Load configuration with full precedence chain.
    pub fn load() -> Self {
        match env::current_dir() {
            Ok(cwd) => Self::load_from_cwd(&cwd),
            Err(_) => {
                let mut config = Config::default();
                if let Some(user_config) = Self::load_user_config() {
                    config = config.merge(user_config);
                }
                config.apply_env_overrides();
                config.enforce_profile();
                config
            }
        }
    }

    /// Load configuration with a specific working directory.
    pub fn load_from_cwd(cwd: &Path) -> Self {
        let mut config = Config::default();

        if let Some(user_config) = Self::load_user_config() {
            config = config.merge(user_config);
        }

        if let Some(project_config) = Self::load_project_config(cwd) {
            config = config.merge(project_config);
        }

        config.apply_env_overrides();
        config.enforce_profile();

        config
    }

    /// Load config with fail-open behavior.
    pub fn load_fail_open() -> Self {
        let result: Result<Self> = Ok(Self::load());
        result.fail_open_default("loading config")
    }

    fn load_user_config() -> Option<Config> {
        let home = stratum_home()?;
        Self::load_from_file(&home.join("config.toml")).ok()
    }

    fn load_project_config(cwd: &Path) -> Option<Config> {
        Self::load_from_file(&project_dir(cwd).join("config.toml")).ok()
    }

    /// Load config from a specific file path.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path).map_err(|e| StratumError::storage(path, e))?;
        toml::from_str(&content).map_err(|e| StratumError::config(e.to_string()))
    }

    /// The evidence gate in production is not negotiable.
    fn enforce_profile(&mut self) {
        if self.profile == Profile::Production && !self.evidence.required {
            tracing::warn!("evidence.required=false ignored in production profile");
            self.evidence.required = true;
        }
    }

    /// Resolve the data directory for a working directory.
    pub fn data_dir(&self, cwd: &Path) -> PathBuf {
        match &self.storage.data_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => cwd.join(dir),
            None => project_dir(cwd),
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("STRATUM_PROFILE") {
            match val.parse::<Profile>() {
                Ok(profile) => self.profile = profile,
                Err(_) => eprintln!(
                    "Warning: Invalid STRATUM_PROFILE value '{}'. \
                    Valid values: [\"production\", \"development\"]. Using '{}'.",
                    val, self.profile
                ),
            }
        }

        if let Ok(val) = env::var("STRATUM_DATA_DIR") {
            if val.is_empty() {
                eprintln!("Warning: STRATUM_DATA_DIR is empty. Ignoring.");
            } else {
                self.storage.data_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("STRATUM_EVIDENCE_REQUIRED") {
            self.evidence.required = val == "true" || val == "1";
        }

        if let Ok(val) = env::var("STRATUM_ALLOW_HUMAN_OVERRIDE") {
            self.promotion.allow_human_override = val == "true" || val == "1";
        }

        env_override(
            "STRATUM_EXTRACT_MIN_ENTRIES",
            &mut self.triggers.extract_min_entries,
            |n| *n >= 1,
            "an integer >= 1",
        );
        env_override(
            "STRATUM_MINE_MIN_FINDINGS",
            &mut self.triggers.mine_min_findings,
            |n| *n >= 1,
            "an integer >= 1",
        );
        env_override(
            "STRATUM_PROMOTE_MIN_SUCCESS_RATE",
            &mut self.triggers.promote_min_success_rate,
            |r| is_valid_rate(*r),
            "a number in [0.0, 1.0]",
        );
        env_override(
            "STRATUM_RETRY_MAX_ATTEMPTS",
            &mut self.retry.max_attempts,
            |n| *n >= 1,
            "an integer >= 1",
        );
        env_override(
            "STRATUM_CACHE_TTL_SECONDS",
            &mut self.cache.ttl_seconds,
            |n| *n >= 1,
            "an integer >= 1",
        );
        env_override(
            "STRATUM_QUERY_TIMEOUT_MS",
            &mut self.query.timeout_ms,
            |n| *n >= 1,
            "an integer >= 1",
        );
        env_override(
            "STRATUM_RETENTION_DAYS",
            &mut self.retention.window_days,
            |n| *n >= 1,
            "an integer >= 1",
        );
        env_override(
            "STRATUM_WORKER_INTERVAL_SECONDS",
            &mut self.worker.interval_seconds,
            |n| *n >= 1,
            "an integer >= 1",
        );
    }

    /// Merge another config into this one.
    ///
    /// The `other` config takes precedence field by field: every value in
    /// `other` that differs from the default replaces the value in `self`.
    ///
    /// # Limitation
    ///
    /// A layer cannot set a value back to its default to undo a lower layer.
    fn merge(mut self, other: Config) -> Self {
        if other.profile != Profile::default() {
            self.profile = other.profile;
        }

        if other.storage.data_dir.is_some() {
            self.storage.data_dir = other.storage.data_dir;
        }

        let d = TriggerConfig::default();
        merge_field(&mut self.triggers.extract_min_entries, other.triggers.extract_min_entries, d.extract_min_entries);
        merge_field(&mut self.triggers.extract_max_age_hours, other.triggers.extract_max_age_hours, d.extract_max_age_hours);
        merge_field(&mut self.triggers.mine_min_findings, other.triggers.mine_min_findings, d.mine_min_findings);
        merge_field(&mut self.triggers.promote_min_wins, other.triggers.promote_min_wins, d.promote_min_wins);
        merge_field(
            &mut self.triggers.promote_min_success_rate,
            other.triggers.promote_min_success_rate,
            d.promote_min_success_rate,
        );

        let d = MiningConfig::default();
        merge_field(&mut self.mining.min_distinct_queries, other.mining.min_distinct_queries, d.min_distinct_queries);
        merge_field(&mut self.mining.deprecate_below, other.mining.deprecate_below, d.deprecate_below);
        merge_field(
            &mut self.mining.min_observations_to_deprecate,
            other.mining.min_observations_to_deprecate,
            d.min_observations_to_deprecate,
        );

        merge_field(
            &mut self.promotion.allow_human_override,
            other.promotion.allow_human_override,
            false,
        );
        merge_field(&mut self.evidence.required, other.evidence.required, true);

        let d = RetryConfig::default();
        merge_field(&mut self.retry.max_attempts, other.retry.max_attempts, d.max_attempts);
        merge_field(&mut self.retry.base_backoff_ms, other.retry.base_backoff_ms, d.base_backoff_ms);
        merge_field(&mut self.retry.max_backoff_ms, other.retry.max_backoff_ms, d.max_backoff_ms);

        merge_field(&mut self.cache.ttl_seconds, other.cache.ttl_seconds, CacheConfig::default().ttl_seconds);

        let d = QueryConfig::default();
        merge_field(&mut self.query.timeout_ms, other.query.timeout_ms, d.timeout_ms);
        merge_field(&mut self.query.max_examples, other.query.max_examples, d.max_examples);
        merge_field(
            &mut self.query.plan_diagnostics_engines,
            other.query.plan_diagnostics_engines,
            d.plan_diagnostics_engines,
        );

        let d = IngestConfig::default();
        merge_field(&mut self.ingest.queue_capacity, other.ingest.queue_capacity, d.queue_capacity);
        merge_field(&mut self.ingest.batch_size, other.ingest.batch_size, d.batch_size);

        merge_field(
            &mut self.retention.window_days,
            other.retention.window_days,
            RetentionConfig::default().window_days,
        );

        let d = WorkerConfig::default();
        merge_field(&mut self.worker.interval_seconds, other.worker.interval_seconds, d.interval_seconds);
        merge_field(&mut self.worker.batch_limit, other.worker.batch_limit, d.batch_limit);
        merge_field(
            &mut self.worker.pending_grace_minutes,
            other.worker.pending_grace_minutes,
            d.pending_grace_minutes,
        );

        self
    }

    /// Save configuration to the project config file.
    ///
    /// Writes `.stratum/config.toml` atomically (temp file, fsync, rename).
    pub fn save_project(&self, cwd: &Path) -> Result<()> {
        let dir = project_dir(cwd);
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| StratumError::storage(&dir, e))?;
        }

        let config_path = dir.join("config.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| StratumError::config(e.to_string()))?;

        let temp_path = dir.join(".config.toml.tmp");
        fs::write(&temp_path, &content).map_err(|e| StratumError::storage(&temp_path, e))?;
        let file = fs::File::open(&temp_path).map_err(|e| StratumError::storage(&temp_path, e))?;
        file.sync_all()
            .map_err(|e| StratumError::storage(&temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, &config_path)
            .map_err(|e| StratumError::storage(&config_path, e))?;

        Ok(())
    }
}

fn merge_field<T: PartialEq>(target: &mut T, value: T, default: T) {
    if value != default {
        *target = value;
    }
}

/// Parse and validate one numeric environment override.
///
/// Invalid values are reported on stderr and leave `target` unchanged.
fn env_override<T>(name: &str, target: &mut T, valid: impl Fn(&T) -> bool, expected: &str)
where
    T: FromStr + Display,
{
    let Ok(val) = env::var(name) else {
        return;
    };
    match val.parse::<T>() {
        Ok(parsed) if valid(&parsed) => *target = parsed,
        _ => eprintln!(
            "Warning: Invalid {} value '{}'. Expected {}. Using '{}'.",
            name, val, expected, target
        ),
    }
}

/// Get the Stratum home directory.
///
/// Checks `STRATUM_HOME` first, then falls back to `~/.stratum`.
pub fn stratum_home() -> Option<PathBuf> {
    if let Ok(home) = env::var("STRATUM_HOME") {
        if home.is_empty() {
            tracing::warn!("STRATUM_HOME is empty, using default");
        } else {
            let path = PathBuf::from(&home);
            if path.is_absolute() {
                return Some(path);
            }
            if let Ok(canonical) = path.canonicalize() {
                return Some(canonical);
            }
            tracing::warn!("STRATUM_HOME is relative and doesn't exist, using as-is");
            return Some(path);
        }
    }

    dirs::home_dir().map(|home| home.join(PROJECT_DIR))
}

/// Find the project root: the nearest ancestor holding `.stratum/`, else `cwd`.
pub fn find_project_root(cwd: &Path) -> PathBuf {
    cwd.ancestors()
        .find(|ancestor| ancestor.join(PROJECT_DIR).is_dir())
        .unwrap_or(cwd)
        .to_path_buf()
}

/// The project `.stratum/` directory for a working directory.
pub fn project_dir(cwd: &Path) -> PathBuf {
    find_project_root(cwd).join(PROJECT_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.profile, Profile::Production);
        assert_eq!(config.triggers.extract_min_entries, 50);
        assert_eq!(config.triggers.extract_max_age_hours, 24);
        assert_eq!(config.triggers.mine_min_findings, 10);
        assert_eq!(config.triggers.promote_min_wins, 5);
        assert!((config.triggers.promote_min_success_rate - 0.70).abs() < f64::EPSILON);
        assert_eq!(config.mining.min_distinct_queries, 3);
        assert!(config.evidence.required);
        assert!(!config.promotion.allow_human_override);
        assert_eq!(config.cache.ttl_seconds, 300);
        assert_eq!(config.query.timeout_ms, 500);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retention.window_days, 30);
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 10,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(800));
        assert_eq!(retry.backoff(4), Duration::from_millis(1_000));
        assert_eq!(retry.backoff(70), Duration::from_millis(1_000));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
profile = "development"

[triggers]
extract_min_entries = 5

[query]
plan_diagnostics_engines = ["postgres", "duckdb"]
"#,
        )
        .unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.profile, Profile::Development);
        assert_eq!(config.triggers.extract_min_entries, 5);
        assert_eq!(config.triggers.mine_min_findings, 10);
        assert_eq!(config.query.plan_diagnostics_engines, vec!["postgres", "duckdb"]);
    }

    #[test]
    fn test_load_from_file_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "this is not valid toml [[[").unwrap();
        assert!(Config::load_from_file(&config_path).is_err());
    }

    #[test]
    #[serial]
    fn test_production_forces_evidence_required() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join(PROJECT_DIR);
        fs::create_dir_all(&project).unwrap();
        fs::write(
            project.join("config.toml"),
            "[evidence]\nrequired = false\n",
        )
        .unwrap();

        let config = Config::load_from_cwd(dir.path());
        assert!(config.evidence.required);
    }

    #[test]
    #[serial]
    fn test_development_may_relax_evidence() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join(PROJECT_DIR);
        fs::create_dir_all(&project).unwrap();
        fs::write(
            project.join("config.toml"),
            "profile = \"development\"\n[evidence]\nrequired = false\n",
        )
        .unwrap();

        let config = Config::load_from_cwd(dir.path());
        assert_eq!(config.profile, Profile::Development);
        assert!(!config.evidence.required);
    }

    #[test]
    #[serial]
    fn test_env_var_precedence() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join(PROJECT_DIR);
        fs::create_dir_all(&project).unwrap();
        fs::write(project.join("config.toml"), "[cache]\nttl_seconds = 60\n").unwrap();

        env::set_var("STRATUM_CACHE_TTL_SECONDS", "900");
        let config = Config::load_from_cwd(dir.path());
        env::remove_var("STRATUM_CACHE_TTL_SECONDS");

        assert_eq!(config.cache.ttl_seconds, 900);
    }

    #[test]
    #[serial]
    fn test_invalid_env_values_are_ignored() {
        env::set_var("STRATUM_QUERY_TIMEOUT_MS", "soon");
        env::set_var("STRATUM_PROMOTE_MIN_SUCCESS_RATE", "1.5");
        env::set_var("STRATUM_PROFILE", "staging");

        let mut config = Config::default();
        config.apply_env_overrides();

        env::remove_var("STRATUM_QUERY_TIMEOUT_MS");
        env::remove_var("STRATUM_PROMOTE_MIN_SUCCESS_RATE");
        env::remove_var("STRATUM_PROFILE");

        assert_eq!(config.query.timeout_ms, 500);
        assert!((config.triggers.promote_min_success_rate - 0.70).abs() < f64::EPSILON);
        assert_eq!(config.profile, Profile::Production);
    }

    #[test]
    #[serial]
    fn test_env_var_overrides() {
        env::set_var("STRATUM_EXTRACT_MIN_ENTRIES", "7");
        env::set_var("STRATUM_RETRY_MAX_ATTEMPTS", "2");
        env::set_var("STRATUM_RETENTION_DAYS", "14");
        env::set_var("STRATUM_DATA_DIR", "/var/lib/stratum");

        let mut config = Config::default();
        config.apply_env_overrides();

        env::remove_var("STRATUM_EXTRACT_MIN_ENTRIES");
        env::remove_var("STRATUM_RETRY_MAX_ATTEMPTS");
        env::remove_var("STRATUM_RETENTION_DAYS");
        env::remove_var("STRATUM_DATA_DIR");

        assert_eq!(config.triggers.extract_min_entries, 7);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retention.window_days, 14);
        assert_eq!(
            config.data_dir(Path::new("/tmp")),
            PathBuf::from("/var/lib/stratum")
        );
    }

    #[test]
    fn test_merge_is_field_by_field() {
        let base = Config {
            retry: RetryConfig {
                max_attempts: 9,
                ..RetryConfig::default()
            },
            ..Config::default()
        };
        let other = Config {
            retry: RetryConfig {
                base_backoff_ms: 50,
                ..RetryConfig::default()
            },
            ..Config::default()
        };

        let merged = base.merge(other);
        assert_eq!(merged.retry.max_attempts, 9);
        assert_eq!(merged.retry.base_backoff_ms, 50);
    }

    #[test]
    fn test_data_dir_defaults_to_project_dir() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        assert_eq!(config.data_dir(dir.path()), dir.path().join(PROJECT_DIR));
    }

    #[test]
    fn test_find_project_root_walks_up() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(PROJECT_DIR)).unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_project_root(&nested), dir.path());
    }

    #[test]
    fn test_save_project_roundtrip() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            profile: Profile::Development,
            ..Config::default()
        };
        config.save_project(dir.path()).unwrap();

        let loaded =
            Config::load_from_file(&dir.path().join(PROJECT_DIR).join("config.toml")).unwrap();
        assert_eq!(loaded.profile, Profile::Development);
        assert!(!dir.path().join(PROJECT_DIR).join(".config.toml.tmp").exists());
    }

    #[test]
    #[serial]
    fn test_stratum_home_with_env() {
        let dir = TempDir::new().unwrap();
        env::set_var("STRATUM_HOME", dir.path().to_str().unwrap());
        let home = stratum_home().unwrap();
        env::remove_var("STRATUM_HOME");
        assert_eq!(home, dir.path());
    }
}
