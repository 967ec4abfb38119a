//! Stratum - layered knowledge compaction for query optimization pipelines
//!
//! CLI entry point with global panic handler.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use stratum::config::{stratum_home, Config};
use stratum::core::rules::Confidence;
use stratum::error::exit_codes;

// =============================================================================
// CLI Definition
// =============================================================================

/// Stratum - layered knowledge compaction for query optimization pipelines
#[derive(Parser)]
#[command(name = "stratum")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest optimization outcomes from a JSONL file
    Ingest {
        /// File with one outcome per line
        file: PathBuf,
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },

    /// Run one compaction cycle over every stream
    Compact {
        /// Ignore count and age triggers for extraction and mining
        #[arg(long)]
        force: bool,
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },

    /// Ask for knowledge about one query
    Query {
        /// Engine the query runs on
        #[arg(long)]
        engine: String,
        /// Query identifier
        #[arg(long, default_value = "adhoc")]
        query_id: String,
        /// Feature vector as a JSON object
        #[arg(long)]
        features: String,
        /// Confidence in the supplied features
        #[arg(long, value_enum, default_value = "medium")]
        confidence: ConfidenceArg,
        /// Static knowledge file to fall back to
        #[arg(long = "static")]
        static_knowledge: Option<PathBuf>,
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },

    /// Work with detection rules
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Show cursors, layer counts and the audit summary
    Status {
        /// Rebuild the audit summary from the log
        #[arg(long)]
        rebuild: bool,
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },

    /// List parked batches, or release one
    DeadLetters {
        /// Dead letter id to release and rerun
        #[arg(long)]
        retry: Option<String>,
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },

    /// Roll aged outcome partitions into summaries
    Retention {
        /// Override the retention window
        #[arg(long)]
        window_days: Option<u32>,
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    /// Validate a rule file against the feature vocabulary
    Validate {
        /// Rule file (JSON)
        file: PathBuf,
        /// Output as JSON
        #[arg(long, short)]
        json: bool,
        /// Suppress output
        #[arg(long, short)]
        quiet: bool,
    },
}

/// Confidence level for `--confidence`.
#[derive(Clone, Copy, ValueEnum)]
enum ConfidenceArg {
    High,
    Medium,
    Low,
}

impl From<ConfidenceArg> for Confidence {
    fn from(arg: ConfidenceArg) -> Self {
        match arg {
            ConfidenceArg::High => Confidence::High,
            ConfidenceArg::Medium => Confidence::Medium,
            ConfidenceArg::Low => Confidence::Low,
        }
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> ExitCode {
    setup_panic_handler();
    init_tracing();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("stratum error: {}", e);
            ExitCode::from(exit_codes::FAILURE)
        }
    }
}

/// Install the tracing subscriber.
///
/// `STRATUM_LOG` wins over `RUST_LOG`; the default level is `info`.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("STRATUM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Set up the global panic handler.
///
/// On panic, appends to ~/.stratum/crash.log before the default unwinding.
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|info| {
        eprintln!("stratum panic: {}", info);

        if let Some(home) = stratum_home() {
            let crash_log = home.join("crash.log");
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&crash_log)
            {
                let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
                let _ = writeln!(file, "[{}] {}", timestamp, info);
            }
        }
    }));
}

/// Run the CLI and return the exit code.
fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Commands::Ingest { file, json, quiet } => runtime.block_on(run_ingest(&file, json, quiet, &cwd)),
        Commands::Compact { force, json, quiet } => {
            runtime.block_on(run_compact(force, json, quiet, &cwd))
        }
        Commands::Query {
            engine,
            query_id,
            features,
            confidence,
            static_knowledge,
            json,
            quiet,
        } => {
            use stratum::cli::query::QueryOptions;
            let options = QueryOptions {
                json,
                quiet,
                engine,
                query_id,
                features,
                confidence: confidence.into(),
                static_knowledge,
            };
            runtime.block_on(run_query(options, &cwd))
        }
        Commands::Rule {
            action: RuleAction::Validate { file, json, quiet },
        } => run_rule_validate(&file, json, quiet, &cwd),
        Commands::Status {
            rebuild,
            json,
            quiet,
        } => run_status(rebuild, json, quiet, &cwd),
        Commands::DeadLetters { retry, json, quiet } => {
            runtime.block_on(run_dead_letters(retry, json, quiet, &cwd))
        }
        Commands::Retention {
            window_days,
            json,
            quiet,
        } => run_retention(window_days, json, quiet, &cwd),
    }
}

// =============================================================================
// Command Implementations
// =============================================================================

/// Cancellation token that fires on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping after the current stage");
            trigger.cancel();
        }
    });
    cancel
}

async fn run_ingest(
    file: &Path,
    json: bool,
    quiet: bool,
    cwd: &Path,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    use stratum::cli::ingest::{IngestCommand, IngestOptions};

    let cmd = IngestCommand::new(Config::load_from_cwd(cwd), cwd);
    let options = IngestOptions { json, quiet };

    let output = cmd.run(file, &options).await;
    print_output(&cmd.format_output(&output, &options));
    Ok(success_to_exit_code(output.success))
}

async fn run_compact(
    force: bool,
    json: bool,
    quiet: bool,
    cwd: &Path,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    use stratum::cli::compact::{CompactCommand, CompactOptions};

    let cmd = CompactCommand::new(Config::load_from_cwd(cwd), cwd);
    let options = CompactOptions { json, quiet, force };

    let output = cmd.run(&options, &cancel_on_ctrl_c()).await;
    print_output(&cmd.format_output(&output, &options));
    Ok(success_to_exit_code(output.success))
}

async fn run_query(
    options: stratum::cli::query::QueryOptions,
    cwd: &Path,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    use stratum::cli::query::QueryCommand;

    let cmd = QueryCommand::new(Config::load_from_cwd(cwd), cwd);

    let output = cmd.run(&options).await;
    print_output(&cmd.format_output(&output, &options));
    if output.unavailable {
        return Ok(ExitCode::from(exit_codes::UNAVAILABLE));
    }
    Ok(success_to_exit_code(output.success))
}

fn run_rule_validate(
    file: &Path,
    json: bool,
    quiet: bool,
    cwd: &Path,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    use stratum::cli::rule::{RuleCommand, RuleOptions};

    let cmd = RuleCommand::new(Config::load_from_cwd(cwd), cwd);
    let options = RuleOptions { json, quiet };

    let output = cmd.validate(file, &options);
    print_output(&cmd.format_output(&output, &options));
    Ok(success_to_exit_code(output.success))
}

fn run_status(
    rebuild: bool,
    json: bool,
    quiet: bool,
    cwd: &Path,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    use stratum::cli::status::{StatusCommand, StatusOptions};

    let cmd = StatusCommand::new(Config::load_from_cwd(cwd), cwd);
    let options = StatusOptions {
        json,
        quiet,
        rebuild,
    };

    let output = cmd.run(&options);
    print_output(&cmd.format_output(&output, &options));
    Ok(success_to_exit_code(output.success))
}

async fn run_dead_letters(
    retry: Option<String>,
    json: bool,
    quiet: bool,
    cwd: &Path,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    use stratum::cli::dead_letters::{DeadLettersCommand, DeadLettersOptions};

    let cmd = DeadLettersCommand::new(Config::load_from_cwd(cwd), cwd);
    let options = DeadLettersOptions { json, quiet, retry };

    let output = cmd.run(&options, &cancel_on_ctrl_c()).await;
    print_output(&cmd.format_output(&output, &options));
    Ok(success_to_exit_code(output.success))
}

fn run_retention(
    window_days: Option<u32>,
    json: bool,
    quiet: bool,
    cwd: &Path,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    use stratum::cli::retention::{RetentionCommand, RetentionOptions};

    let cmd = RetentionCommand::new(Config::load_from_cwd(cwd), cwd);
    let options = RetentionOptions {
        json,
        quiet,
        window_days,
    };

    let output = cmd.run(&options);
    print_output(&cmd.format_output(&output, &options));
    Ok(success_to_exit_code(output.success))
}

// =============================================================================
// Helpers
// =============================================================================

fn print_output(formatted: &str) {
    if !formatted.is_empty() {
        println!("{}", formatted);
    }
}

/// Convert a success boolean to an exit code.
fn success_to_exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::from(exit_codes::SUCCESS)
    } else {
        ExitCode::from(exit_codes::FAILURE)
    }
}

// =============================================================================
// Tests
// =============================================================================
