//! # chatlab
//!
//! A CLI tool that ingests exported chat histories (QQ, WeChat, Discord)
//! into a per-conversation SQLite store and serves analytic queries over
//! the result.
//!
//! ## What it does
//!
//! Each import streams a platform export into its own database under
//! `~/Documents/ChatLab/databases`, normalizing senders, timestamps and
//! message types along the way. Later runs can top up a session
//! incrementally, merge overlapping exports from several sources, or run
//! read-only analytic queries (activity counts, repeat-message chains,
//! mention graphs, free-form SQL) against what's already imported.
//!
//! ## Architecture
//!
//! - [`chatlab_core::format`] — format sniffing and streaming parsers
//! - [`chatlab_core::import`] — the append-only and incremental import pipelines
//! - [`chatlab_core::merge`] — multi-source conflict detection and merging
//! - [`chatlab_core::query`] — the read-side analytic query layer
//! - [`chatlab_core::worker`] — the single execution context this binary drives
//!
//! Preferences (app name, custom documents directory) can be persisted in
//! `~/.config/chatlab/config.toml`.

use chatlab_core::format::registry::Registry;
use chatlab_core::worker::{Operation, QueryOp, Request, WorkerHost, WorkerMessage};
use chatlab_core::{AppPaths, model::Filter};
use clap::{Parser, Subcommand};
use eyre::{Context, Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "ChatLab";

/// Ingest and query exported chat histories.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Override the documents directory chatlab stores databases under.
    /// Defaults to the OS documents dir (falls back to the data dir).
    #[arg(long, value_name = "PATH", global = true)]
    documents: Option<PathBuf>,

    /// Path to a specific configuration file.
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Suppress progress bars.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a chat export into a new session.
    Import { source: PathBuf },
    /// Top up an existing session with messages from a newer export.
    Incremental {
        session_id: String,
        source: PathBuf,
    },
    /// List every imported session.
    List,
    /// Rename a session.
    Rename { session_id: String, name: String },
    /// Delete a session and its database.
    Delete { session_id: String },
    /// Rebuild a session's gap-based index with an optional threshold override.
    GenerateIndex {
        session_id: String,
        #[arg(long)]
        gap_threshold: Option<i64>,
    },
    /// Run one of the built-in analytic queries over a session.
    Query {
        session_id: String,
        #[arg(value_enum)]
        op: QueryOpArg,
    },
    /// Run a read-only SQL statement against a session's database.
    Sql {
        session_id: String,
        sql: String,
        #[arg(long, default_value_t = 500)]
        row_limit: usize,
    },
    /// Detect conflicts between multiple exports before merging them.
    MergeCheck { sources: Vec<PathBuf> },
    /// Merge multiple exports of the same conversation into one canonical export.
    Merge {
        group_name: String,
        output: PathBuf,
        #[arg(long)]
        reimport: bool,
        sources: Vec<PathBuf>,
    },
    /// Check every stored session for pending schema migrations.
    MigrationCheck,
    /// Apply pending schema migrations to every stored session.
    MigrationRun,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum QueryOpArg {
    MemberActivity,
    Hourly,
    Daily,
    Weekday,
    Monthly,
    Yearly,
    LengthDistribution,
    TypeDistribution,
    Repeat,
    Catchphrase,
    NightOwl,
    DragonKing,
    Diving,
    Monologue,
    Mention,
    MentionGraph,
    Laugh,
    MemeBattle,
    CheckIn,
}

impl From<QueryOpArg> for QueryOp {
    fn from(v: QueryOpArg) -> Self {
        match v {
            QueryOpArg::MemberActivity => QueryOp::MemberActivity,
            QueryOpArg::Hourly => QueryOp::Hourly,
            QueryOpArg::Daily => QueryOp::Daily,
            QueryOpArg::Weekday => QueryOp::Weekday,
            QueryOpArg::Monthly => QueryOp::Monthly,
            QueryOpArg::Yearly => QueryOp::Yearly,
            QueryOpArg::LengthDistribution => QueryOp::LengthDistribution,
            QueryOpArg::TypeDistribution => QueryOp::TypeDistribution,
            QueryOpArg::Repeat => QueryOp::Repeat,
            QueryOpArg::Catchphrase => QueryOp::Catchphrase,
            QueryOpArg::NightOwl => QueryOp::NightOwl,
            QueryOpArg::DragonKing => QueryOp::DragonKing,
            QueryOpArg::Diving => QueryOp::Diving,
            QueryOpArg::Monologue => QueryOp::Monologue,
            QueryOpArg::Mention => QueryOp::Mention,
            QueryOpArg::MentionGraph => QueryOp::MentionGraph,
            QueryOpArg::Laugh => QueryOp::Laugh,
            QueryOpArg::MemeBattle => QueryOp::MemeBattle,
            QueryOpArg::CheckIn => QueryOp::CheckIn,
        }
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    documents: Option<PathBuf>,
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("chatlab/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p).wrap_err_with(|| format!("failed to read config: {}", p.display()))?;
            toml::from_str(&content).wrap_err_with(|| format!("failed to parse config: {}", p.display()))
        }
    }
}

fn submit_and_wait(host: &WorkerHost, op: Operation, quiet: bool) -> Result<serde_json::Value> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let bar = if quiet {
        None
    } else {
        let b = ProgressBar::new_spinner();
        b.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
        Some(b)
    };
    host.submit(
        Request {
            id: "1".to_string(),
            op,
        },
        tx,
    );
    loop {
        match rx.recv() {
            Ok(WorkerMessage::Progress(event)) => {
                if let Some(b) = &bar {
                    b.set_message(format!("{:?}", event.progress));
                    b.tick();
                }
            }
            Ok(WorkerMessage::Response { result, .. }) => {
                if let Some(b) = bar {
                    b.finish_and_clear();
                }
                return result.map_err(|e| eyre!("{:?}: {}", e.code, e.message));
            }
            Err(_) => return Err(eyre!("worker channel closed before a response arrived")),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let file_cfg = load_file_config(cli.config.as_deref())?;

    let documents = cli
        .documents
        .or(file_cfg.documents)
        .or_else(dirs::document_dir)
        .or_else(dirs::data_dir)
        .ok_or_else(|| eyre!("could not determine a documents directory; pass --documents explicitly"))?;

    let paths = AppPaths::new(documents, APP_NAME);
    paths.ensure_dirs().wrap_err("failed to create application directories")?;
    paths.sweep_staging().wrap_err("failed to sweep stale staging files")?;

    let host = WorkerHost::spawn(Registry::standard(), paths);

    let op = match cli.command {
        Command::Import { source } => Operation::ImportStream { source },
        Command::Incremental { session_id, source } => Operation::ImportIncremental { session_id, source },
        Command::List => Operation::SessionList,
        Command::Rename { session_id, name } => Operation::SessionRename { session_id, name },
        Command::Delete { session_id } => Operation::SessionDelete { session_id },
        Command::GenerateIndex {
            session_id,
            gap_threshold,
        } => Operation::SessionGenerateIndex {
            session_id,
            gap_threshold,
        },
        Command::Query { session_id, op } => Operation::Query {
            session_id,
            filter: Filter::default(),
            op: op.into(),
        },
        Command::Sql {
            session_id,
            sql,
            row_limit,
        } => Operation::SqlExecute {
            session_id,
            sql,
            row_limit,
        },
        Command::MergeCheck { sources } => Operation::MergeCheckConflicts {
            merge_id: "cli".to_string(),
            sources,
        },
        Command::Merge {
            group_name,
            output,
            reimport,
            sources,
        } => Operation::MergeMergeFiles {
            merge_id: "cli".to_string(),
            sources,
            group_name,
            output_path: output,
            reimport,
        },
        Command::MigrationCheck => Operation::MigrationCheck,
        Command::MigrationRun => Operation::MigrationRun,
    };

    let result = submit_and_wait(&host, op, cli.quiet)?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    host.shutdown();
    Ok(())
}
