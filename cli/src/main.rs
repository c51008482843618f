//! Annotator CLI - runs the annotation loop and inspects its database.
//!
//! ```sh
//! # Annotate pre-segmented scenes, resuming from the latest checkpoint
//! annotator run --scenes scenes.jsonl
//!
//! # Start over against another agent with a smaller window
//! annotator run --scenes scenes.jsonl --no-resume \
//!   --agent-url http://gpu-box:8080 --context-budget 32768
//!
//! # Inspect progress and checkpoints
//! annotator status
//! annotator snapshots list --type checkpoint --limit 5
//! annotator snapshots show 12
//! ```

mod runner;

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use annotator_config::AnnotatorConfig;
use annotator_context::{Glossary, GlossaryStore, ProgressTracker, SnapshotStore, SnapshotType};
use annotator_providers::retry::RetryConfig;
use annotator_providers::{AgentBackend, AgentClient};
use annotator_types::SnapshotId;

use runner::{CancelFlag, RunOptions, Runner};

/// Exit code after a second Ctrl-C.
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(name = "annotator", version, about = "Glossary annotator with bounded context")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Annotate scenes from a JSON-Lines file
    Run(RunArgs),
    /// Show run progress, glossary size and snapshot counts
    Status(DbArgs),
    /// Inspect or delete snapshots
    Snapshots {
        #[command(flatten)]
        db: DbArgs,
        #[command(subcommand)]
        action: SnapshotsCommand,
    },
}

#[derive(Args)]
struct DbArgs {
    /// Config file (default: ~/.annotator/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Annotator database, overriding `[run].annotator_db`
    #[arg(long, global = true)]
    annotator_db: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    /// Pre-segmented scenes, one JSON object per line
    #[arg(long)]
    scenes: PathBuf,

    #[command(flatten)]
    db: DbArgs,

    /// Agent server base URL
    #[arg(long)]
    agent_url: Option<String>,

    /// Context window budget in tokens
    #[arg(long)]
    context_budget: Option<u64>,

    /// Process at most N scenes
    #[arg(long)]
    limit: Option<usize>,

    /// Ignore existing checkpoints
    #[arg(long)]
    no_resume: bool,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum SnapshotsCommand {
    /// Most recent snapshots first
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// checkpoint, curator_fork or manual
        #[arg(long = "type")]
        snapshot_type: Option<SnapshotType>,
    },
    /// Header and captured context of one snapshot
    Show { id: i64 },
    /// Delete a snapshot with its context and entry values
    Delete { id: i64 },
}

fn init_tracing(log_file: Option<&Path>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::try_new("warn").expect("warn filter is valid"));

    let mut warnings = Vec::new();
    let file_layer = log_file.and_then(|path| match open_log_file(path) {
        Ok(file) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        ),
        Err(e) => {
            warnings.push(format!("Failed to open log file {}: {e}", path.display()));
            None
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    if let Some(path) = log_file {
        tracing::debug!(path = %path.display(), "Logging initialized");
    }
    for warning in warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file(path: &Path) -> std::io::Result<fs::File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn load_config(db: &DbArgs) -> Result<AnnotatorConfig> {
    let mut config = AnnotatorConfig::load(db.config.as_deref()).context("failed to load config")?;
    if let Some(path) = &db.annotator_db {
        config.run.annotator_db.clone_from(path);
    }
    Ok(config)
}

/// First Ctrl-C asks the runner to stop after the current scene; the second
/// exits immediately.
fn install_ctrl_c(cancel: Arc<CancelFlag>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            if cancel.is_cancelled() {
                tracing::warn!("Second interrupt, exiting immediately");
                process::exit(FORCED_EXIT_CODE);
            }
            cancel.cancel();
            tracing::warn!("Interrupt received, stopping after the current scene");
        }
    });
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.db)?;
    if let Some(url) = args.agent_url {
        config.agent.url = url;
    }
    if let Some(budget) = args.context_budget {
        config.context.budget = budget;
    }
    if args.log_file.is_some() {
        config.run.log_file = args.log_file;
    }
    config.validate()?;

    init_tracing(config.run.log_file.as_deref());

    let agent: Arc<dyn AgentBackend> = Arc::new(
        AgentClient::new(&config.agent.url, Duration::from_secs(config.agent.timeout_secs))
            .context("failed to build agent client")?
            .with_retry(RetryConfig {
                max_attempts: config.agent.max_retries,
                ..RetryConfig::default()
            }),
    );
    tracing::info!(
        url = %config.agent.url,
        budget = config.context.budget,
        db = %config.run.annotator_db.display(),
        "Starting run"
    );

    let cancel = Arc::new(CancelFlag::default());
    install_ctrl_c(Arc::clone(&cancel));

    let mut runner = Runner::open(&config, agent, cancel)?;
    let summary = runner
        .run(&RunOptions {
            scenes_path: args.scenes,
            limit: args.limit,
            resume: !args.no_resume,
        })
        .await?;

    if let Some(id) = summary.resumed_from {
        println!("Resumed from snapshot {id}");
    }
    println!(
        "Processed {} scenes ({} skipped), {} checkpoints{}",
        summary.scenes_processed,
        summary.scenes_skipped,
        summary.checkpoints_written,
        if summary.interrupted { ", interrupted" } else { "" }
    );
    if let Some(id) = summary.last_snapshot {
        println!("Latest checkpoint: {id}");
    }
    Ok(())
}

fn cmd_status(db: &DbArgs) -> Result<()> {
    let config = load_config(db)?;
    init_tracing(None);
    let path = &config.run.annotator_db;

    let progress = ProgressTracker::open(path).context("failed to open progress tracker")?;
    let glossary = GlossaryStore::open(path).context("failed to open glossary")?;
    let snapshots = SnapshotStore::open(path).context("failed to open snapshot store")?;

    let run = progress.get_state()?;
    println!("Database:        {}", path.display());
    println!(
        "Run started:     {}",
        run.run_started_at.as_deref().unwrap_or("never")
    );
    println!(
        "Last post:       {}",
        run.last_post_id.map_or_else(|| "-".to_string(), |id| id.to_string())
    );
    println!(
        "Last thread:     {}",
        run.last_thread_id.map_or_else(|| "-".to_string(), |id| id.to_string())
    );
    println!("Posts processed: {}", run.total_posts_processed);
    println!("Threads done:    {}", progress.get_completed_threads()?.len());
    println!("Glossary size:   {}", glossary.count()?);
    println!("Snapshots:       {}", snapshots.count()?);
    for (snapshot_type, count) in snapshots.count_by_type()? {
        println!("  {snapshot_type:<13} {count}");
    }
    Ok(())
}

fn cmd_snapshots(db: &DbArgs, action: SnapshotsCommand) -> Result<()> {
    let config = load_config(db)?;
    init_tracing(None);
    let mut snapshots =
        SnapshotStore::open(&config.run.annotator_db).context("failed to open snapshot store")?;

    match action {
        SnapshotsCommand::List {
            limit,
            snapshot_type,
        } => {
            for s in snapshots.list_recent(limit, snapshot_type)? {
                println!(
                    "{:>6}  {:<12}  {}  post={} thread={} pos={} entries={} tokens={}",
                    s.id,
                    s.snapshot_type,
                    s.created_at,
                    s.last_post_id,
                    s.last_thread_id,
                    s.thread_position,
                    s.entry_count,
                    s.token_count.map_or_else(|| "-".to_string(), |t| t.to_string()),
                );
            }
        }
        SnapshotsCommand::Show { id } => {
            let id = SnapshotId::new(id);
            let snapshot = snapshots
                .get(id)?
                .with_context(|| format!("snapshot {id} not found"))?;
            let (context, state) = snapshots.restore_context(id)?;
            let report = serde_json::json!({
                "snapshot": snapshot,
                "turns": context.history().len(),
                "current_thread_id": state.current_thread_id(),
                "current_scene_index": state.current_scene_index(),
                "completed_thread_ids": state.completed_thread_ids(),
                "chunk_summaries": state.chunk_summaries().len(),
                "cumulative_summary": state.cumulative_summary(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        SnapshotsCommand::Delete { id } => {
            let id = SnapshotId::new(id);
            if snapshots.delete(id)? {
                println!("Deleted snapshot {id}");
            } else {
                anyhow::bail!("snapshot {id} not found");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args).await,
        Command::Status(db) => cmd_status(&db),
        Command::Snapshots { db, action } => cmd_snapshots(&db, action),
    }
}
