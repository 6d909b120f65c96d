//! adoptrack - track how much AI-generated code survives
//!
//! Assistants call `adoptrack before` ahead of an edit and `adoptrack after`
//! once it lands. The other subcommands read the resulting totals.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/adoptrack/data.db (~/.local/share/adoptrack/data.db)
//! - Logs: $XDG_STATE_HOME/adoptrack/ (~/.local/state/adoptrack/)
//! - Config: $XDG_CONFIG_HOME/adoptrack/config.toml (~/.config/adoptrack/config.toml)

mod render;

use adoptrack_core::backup::{export_log, import_log};
use adoptrack_core::{AdoptionEngine, Config, Dimension, SnapshotStatus};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "adoptrack")]
#[command(about = "Measure how much AI-generated code is adopted")]
#[command(version)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Text, global = true)]
    format: Format,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Record file content before an AI edit
    Before {
        /// Logical editing session ID
        session: String,
        /// File being edited
        file: String,
        /// Read content from this file instead of stdin
        #[arg(long)]
        content_file: Option<PathBuf>,
    },
    /// Record file content after an AI edit and measure it
    After {
        session: String,
        file: String,
        #[arg(long)]
        content_file: Option<PathBuf>,
        /// Free-form information about the session (model, tool, ...)
        #[arg(long)]
        session_info: Option<String>,
    },
    /// Totals for one file
    File { path: String },
    /// Totals for one session
    Session { id: String },
    /// Totals for one project
    Project { id: String },
    /// Global totals
    Dashboard,
    /// Drill into one edit event
    Show { event_id: i64 },
    /// List every bucket of a dimension
    List {
        #[arg(value_parser = parse_dimension)]
        dimension: Dimension,
    },
    /// List pending or abandoned pairings
    Pairings {
        #[arg(long, default_value = "pending", value_parser = parse_pairing_status)]
        status: SnapshotStatus,
    },
    /// Check live totals against a replay of the log
    Verify,
    /// Recompute every total from the log
    Rebuild,
    /// Write the full log to a JSON file
    Export { path: PathBuf },
    /// Load a JSON log into an empty database
    Import { path: PathBuf },
}

fn parse_dimension(s: &str) -> std::result::Result<Dimension, String> {
    s.parse()
}

fn parse_pairing_status(s: &str) -> std::result::Result<SnapshotStatus, String> {
    match s.parse::<SnapshotStatus>()? {
        SnapshotStatus::Completed => Err("completed pairings are listed with `show`".to_string()),
        status => Ok(status),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging
    let _log_guard =
        adoptrack_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let engine = AdoptionEngine::from_config(&config).context("failed to open database")?;
    let recovered = engine
        .recover()
        .context("failed to recover unmeasured edit events")?;
    if recovered > 0 {
        tracing::info!(recovered, "Measured edit events left over from an earlier run");
    }

    run(&engine, cli.command, cli.format)
}

fn run(engine: &AdoptionEngine, command: Command, format: Format) -> Result<()> {
    let queries = engine.queries();

    match command {
        Command::Before {
            session,
            file,
            content_file,
        } => {
            let content = read_content(content_file.as_deref())?;
            let ack = engine.record_before(&session, &file, &content)?;
            emit(format, &ack, render::before_ack)
        }
        Command::After {
            session,
            file,
            content_file,
            session_info,
        } => {
            let content = read_content(content_file.as_deref())?;
            let summary =
                engine.record_after(&session, &file, &content, session_info.as_deref())?;
            emit(format, &summary, render::after_summary)
        }
        Command::File { path } => emit(format, &queries.by_file(&path)?, render::bucket),
        Command::Session { id } => emit(format, &queries.by_session(&id)?, render::bucket),
        Command::Project { id } => emit(format, &queries.by_project(&id)?, render::bucket),
        Command::Dashboard => emit(format, &queries.global_dashboard()?, render::dashboard),
        Command::Show { event_id } => {
            emit(format, &queries.edit_detail(event_id)?, render::edit_detail)
        }
        Command::List { dimension } => {
            let buckets = queries.list_buckets(dimension)?;
            emit(format, &buckets, |b: &Vec<_>| render::bucket_table(b))
        }
        Command::Pairings { status } => {
            let records = queries.pairings(status)?;
            emit(format, &records, |r: &Vec<_>| render::snapshots(r))
        }
        Command::Verify => {
            let report = engine.aggregator().verify()?;
            emit(format, &report, render::integrity)?;
            if !report.is_consistent() {
                anyhow::bail!(
                    "{} bucket(s) differ from the log; run `adoptrack rebuild`",
                    report.mismatches.len()
                );
            }
            Ok(())
        }
        Command::Rebuild => {
            let written = engine.aggregator().rebuild()?;
            emit(format, &written, |n: &usize| {
                format!("Rebuilt {} buckets from the log\n", n)
            })
        }
        Command::Export { path } => {
            let summary = export_log(engine.database(), &path)
                .with_context(|| format!("failed to export to {}", path.display()))?;
            emit(format, &summary, |s| render::backup("Exported", s))
        }
        Command::Import { path } => {
            let summary = import_log(engine.database(), &path)
                .with_context(|| format!("failed to import from {}", path.display()))?;
            emit(format, &summary, |s| render::backup("Imported", s))
        }
    }
}

/// Snapshot content from a file, or stdin when no file is given
fn read_content(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut content = String::new();
            std::io::stdin()
                .read_to_string(&mut content)
                .context("failed to read content from stdin")?;
            Ok(content)
        }
    }
}

fn emit<T: Serialize>(format: Format, value: &T, text: impl Fn(&T) -> String) -> Result<()> {
    match format {
        Format::Text => print!("{}", text(value)),
        Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}
