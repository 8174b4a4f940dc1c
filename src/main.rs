use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shelf_updater::config::Config;
use shelf_updater::models::{CategoryId, ItemStatus, SourceId};
use shelf_updater::notifications::FileErrorLog;
use shelf_updater::scheduler::{
    LibraryGroup, RunStatus, TracingReporter, UpdateJob, UpdateScope, UpdateTarget,
};
use shelf_updater::storage::{LibrarySnapshot, MemoryRepository};

#[derive(Parser)]
#[command(
    name = "shelf-updater",
    version,
    about = "Refresh chapter lists of a tracked library across rate-limited sources",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML). Environment variables are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json), overrides the configuration
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which items a run would update and which it would skip
    Select {
        /// Library snapshot (JSON)
        #[arg(short, long)]
        snapshot: PathBuf,

        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Run a library update against a snapshot
    Run {
        /// Library snapshot (JSON)
        #[arg(short, long)]
        snapshot: PathBuf,

        #[command(flatten)]
        scope: ScopeArgs,

        /// Write the updated library back into the snapshot
        #[arg(long, default_value = "false")]
        write: bool,

        /// Print the run report as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Validate a configuration file
    CheckConfig,
}

#[derive(Args)]
struct ScopeArgs {
    /// Restrict the run to one category
    #[arg(long, conflicts_with_all = ["source", "status"])]
    category: Option<u64>,

    /// Restrict the run to one source
    #[arg(long, conflicts_with = "status")]
    source: Option<u64>,

    /// Restrict the run to one publishing status (e.g. ongoing, on_hiatus)
    #[arg(long)]
    status: Option<String>,

    /// What to refresh
    #[arg(short, long, value_enum, default_value = "chapters")]
    target: TargetArg,
}

#[derive(Clone, Copy, ValueEnum)]
enum TargetArg {
    Chapters,
    Covers,
    Tracking,
}

impl ScopeArgs {
    fn scope(&self) -> Result<UpdateScope> {
        if let Some(id) = self.category {
            return Ok(UpdateScope::Category(CategoryId(id)));
        }
        if let Some(id) = self.source {
            return Ok(UpdateScope::Group(LibraryGroup::Source(SourceId(id))));
        }
        if let Some(status) = &self.status {
            let Some(status) = ItemStatus::parse(status) else {
                bail!("Unknown status: {status}");
            };
            return Ok(UpdateScope::Group(LibraryGroup::Status(status)));
        }
        Ok(UpdateScope::Library)
    }

    fn target(&self) -> UpdateTarget {
        match self.target {
            TargetArg::Chapters => UpdateTarget::Chapters,
            TargetArg::Covers => UpdateTarget::Covers,
            TargetArg::Tracking => UpdateTarget::Tracking,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;

    // Initialize tracing/logging
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&format, &config.logging.level, cli.verbose)?;

    if let Err(e) = shelf_updater::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed");
    }

    match cli.command {
        Commands::Select { snapshot, scope } => {
            tracing::info!(snapshot = %snapshot.display(), "Starting select command");
            select(config, &snapshot, &scope).await?;
        }

        Commands::Run {
            snapshot,
            scope,
            write,
            json,
        } => {
            tracing::info!(
                snapshot = %snapshot.display(),
                write = %write,
                "Starting run command"
            );
            run(config, &snapshot, &scope, write, json).await?;
        }

        Commands::CheckConfig => {
            config.validate()?;
            println!("Configuration is valid");
            println!("  Global concurrency: {}", config.scheduler.global_concurrency);
            println!("  Per-source concurrency: {}", config.scheduler.per_source_concurrency);
            println!("  Throttled sources: {}", config.throttle.sources.len());
            println!("  Error log directory: {}", config.error_log.dir.display());
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("shelf_updater=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("shelf_updater={level},warn"))
            })
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

async fn build_job(config: Config, snapshot: &LibrarySnapshot) -> (UpdateJob, Arc<MemoryRepository>) {
    let (repo, catalog) = snapshot.load().await;
    let error_log = Arc::new(FileErrorLog::new(config.error_log.dir.clone()));
    let job = UpdateJob::builder(repo.clone(), catalog)
        .config(config)
        .reporter(Arc::new(TracingReporter))
        .error_log(error_log)
        .build();
    (job, repo)
}

async fn select(config: Config, path: &Path, args: &ScopeArgs) -> Result<()> {
    let snapshot = LibrarySnapshot::from_file(path)?;
    let (job, _) = build_job(config, &snapshot).await;

    let scope = args.scope()?;
    let selection = job.preview(scope, args.target()).await?;

    println!("Scope: {scope} ({})", args.target());
    println!("Selected {} item(s):", selection.selected.len());
    for item in &selection.selected {
        println!("  + {} [{}]", item.title, item.id);
    }
    println!("Skipped {} item(s):", selection.excluded.len());
    for excluded in &selection.excluded {
        println!("  - {} [{}]: {}", excluded.title, excluded.item_id, excluded.reason);
    }
    Ok(())
}

async fn run(config: Config, path: &Path, args: &ScopeArgs, write: bool, json: bool) -> Result<()> {
    let mut snapshot = LibrarySnapshot::from_file(path)?;
    let (job, repo) = build_job(config, &snapshot).await;

    let handle = job.start_run(args.scope()?, args.target());
    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing items in flight");
            cancel.cancel();
        }
    });

    let report = handle.wait().await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize run report")?
        );
    } else {
        println!("Run {}: {}", report.run_id, report.status);
        println!("  Attempted: {}", report.attempted);
        println!(
            "  Updated: {} item(s), {} new chapter(s)",
            report.succeeded_with_new.len(),
            report.new_chapter_count()
        );
        println!("  Unchanged: {}", report.succeeded_no_change.len());
        println!("  Failed: {}", report.failures.len());
        println!("  Skipped: {}", report.skipped.len());
        if let Some(log) = &report.error_log {
            println!("  Error log: {}", log.display());
        }
        if let Some(reason) = &report.abort_reason {
            let hint = if report.abort_retryable { ", retry later" } else { "" };
            println!("  Aborted: {reason}{hint}");
        }
    }

    if write && report.attempted > 0 {
        snapshot.refresh_from(&repo).await?;
        snapshot.save(path)?;
        tracing::info!(snapshot = %path.display(), "Snapshot updated");
    }

    if report.status == RunStatus::Aborted {
        bail!("Library update aborted");
    }
    Ok(())
}
