//! # answer-gate CLI (`agate`)
//!
//! ## Usage
//!
//! ```bash
//! agate --config ./config/agate.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `agate update` | Index changed sources; rebuild when no usable index exists |
//! | `agate update --no-rebuild` | Incremental only; fail if a rebuild is required |
//! | `agate rebuild` | Re-index every source from scratch |
//! | `agate ask --identity <id> "<query>"` | Answer one query, print the result as JSON |
//! | `agate status` | Show index size, dimension, and last update |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use answer_gate::audit::JsonlAuditLog;
use answer_gate::cancel::CancellationFlag;
use answer_gate::config::{self, Config};
use answer_gate::embedding::create_embedder;
use answer_gate::extract::DefaultExtractor;
use answer_gate::generation::create_generator;
use answer_gate::index_store::{IndexHandle, IndexStore};
use answer_gate::jobs::{JobKind, JobOutcome, JobStatus, UpdateJob};
use answer_gate::logging;
use answer_gate::pipeline::{AnswerPipeline, AnswerRequest};
use answer_gate::rate_limit::SystemClock;
use answer_gate::sources::create_source;
use answer_gate::updater::{IndexUpdater, UpdatePhase, UpdateReport};

/// answer-gate: grounded question answering over your documents.
#[derive(Parser)]
#[command(name = "agate", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/agate.toml")]
    config: PathBuf,

    /// Debug-level logging (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the index up to date with the document source.
    ///
    /// Only new or modified sources are fetched and embedded. When there is
    /// no usable index on disk a full rebuild runs instead.
    Update {
        /// Do not fall back to a full rebuild.
        #[arg(long)]
        no_rebuild: bool,
    },

    /// Rebuild the index from every source.
    Rebuild,

    /// Answer a query.
    Ask {
        /// Caller identity used for rate limiting and audit.
        #[arg(long, default_value = "cli")]
        identity: String,

        query: String,
    },

    /// Show index status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Update { no_rebuild } => {
            let kind = if no_rebuild {
                JobKind::Incremental
            } else {
                JobKind::Update
            };
            run_job(&cfg, kind).await?;
        }
        Commands::Rebuild => {
            run_job(&cfg, JobKind::Rebuild).await?;
        }
        Commands::Ask { identity, query } => {
            run_ask(&cfg, identity, query).await?;
        }
        Commands::Status => {
            run_status(&cfg)?;
        }
    }

    Ok(())
}

fn index_handle(cfg: &Config) -> Arc<IndexHandle> {
    Arc::new(IndexHandle::new(
        IndexStore::new(&cfg.index.dir),
        Duration::from_secs(cfg.index.cache_ttl_secs),
    ))
}

async fn run_job(cfg: &Config, kind: JobKind) -> Result<()> {
    let updater = Arc::new(IndexUpdater::new(
        create_source(&cfg.source)?,
        Arc::new(DefaultExtractor),
        create_embedder(&cfg.embedding)?,
        index_handle(cfg),
        cfg,
    ));

    let mut phases = updater.subscribe();
    let progress = tokio::spawn(async move {
        while phases.changed().await.is_ok() {
            let phase = phases.borrow_and_update().clone();
            match phase {
                UpdatePhase::Processing { done, total } => {
                    eprint!("\r  processing {} / {} sources", done, total);
                    if done == total {
                        eprintln!();
                    }
                }
                UpdatePhase::Scanning => eprintln!("  scanning sources"),
                UpdatePhase::Merging => eprintln!("  writing index"),
                _ => {}
            }
        }
    });

    let job = UpdateJob::spawn(updater, kind);
    let cancel = job.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    let status = job.wait().await;
    progress.abort();

    match status {
        JobStatus::Succeeded(JobOutcome::Updated(report)) => print_report("update", &report),
        JobStatus::Succeeded(JobOutcome::Unchanged(report)) => {
            print_report("update (no changes persisted)", &report)
        }
        JobStatus::Succeeded(JobOutcome::Rebuilt(report)) => print_report("rebuild", &report),
        JobStatus::Succeeded(JobOutcome::RebuildRequired) => {
            bail!("no usable index at {}; run `agate rebuild`", cfg.index.dir.display())
        }
        JobStatus::Failed(message) => bail!("index update failed: {}", message),
        JobStatus::Pending | JobStatus::Running => bail!("index job ended unexpectedly"),
    }
    Ok(())
}

fn print_report(label: &str, report: &UpdateReport) {
    println!("{}", label);
    println!("  sources listed: {}", report.listed);
    println!("  sources changed: {}", report.changed);
    println!("  processed: {}", report.processed);
    println!("  skipped: {}", report.skipped);
    println!("  chunks added: {}", report.chunks_added);
    println!("  embedding calls: {}", report.embed_calls);
    println!("  index entries: {}", report.total_entries);
    println!("ok");
}

async fn run_ask(cfg: &Config, identity: String, query: String) -> Result<()> {
    let pipeline = AnswerPipeline::from_config(
        cfg,
        create_embedder(&cfg.embedding)?,
        create_generator(&cfg.generation)?,
        index_handle(cfg),
        Arc::new(JsonlAuditLog::new(&cfg.audit.path)),
        Arc::new(SystemClock::new()),
    )?;

    let cancel = CancellationFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let result = pipeline
        .answer(&AnswerRequest::new(identity, query), &cancel)
        .await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_status(cfg: &Config) -> Result<()> {
    let store = IndexStore::new(&cfg.index.dir);
    println!("index: {}", store.dir().display());
    if !store.exists() {
        println!("  status: missing (run `agate rebuild`)");
        return Ok(());
    }

    let (index, state) = match store.load() {
        Ok(loaded) => loaded,
        Err(e) => {
            println!("  status: unreadable ({})", e);
            return Ok(());
        }
    };
    if let Ok(generation) = store.current_dir() {
        println!("  generation: {}", generation.display());
    }
    println!("  entries: {}", index.len());
    println!(
        "  dims: {}",
        index.dims().map_or("-".to_string(), |d| d.to_string())
    );
    println!("  documents: {}", index.source_keys().len());
    println!("  tracked sources: {}", state.processed_files.len());
    match state.last_update {
        Some(ts) => println!("  last update: {}", ts.to_rfc3339()),
        None => println!("  last update: never"),
    }
    Ok(())
}
