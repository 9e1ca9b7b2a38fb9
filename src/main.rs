use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use gitvan::config::Config;
use gitvan::context::{Context, with_context};
use gitvan::daemon::{Daemon, DaemonError, DefinitionCaches, Definitions};
use gitvan::git::Git;
use gitvan::lock::LockManager;
use gitvan::model::{Invocation, JobId};
use gitvan::receipt::{ReceiptFilter, ReceiptStatus, ReceiptStore};
use gitvan::runner::Runner;
use gitvan::telemetry;

/// Git-native automation engine
///
/// GitVan watches a repository's own object graph: new commits trigger
/// event-bound jobs, atomic ref creation guarantees at-most-once execution
/// even with several daemons on the same repo, and every outcome is an
/// append-only receipt in git notes.
///
/// Definitions live in the working tree:
///   jobs/**/*.toml        job definitions (what to run)
///   events/**/*.toml      event definitions (when to run it)
///   schedules/*.toml      static cron schedules
///   gitvan.config.toml    engine configuration
#[derive(Parser)]
#[command(name = "gitvan")]
#[command(version, about)]
#[command(after_help = "See 'gitvan <command> --help' for details on a specific command.")]
struct Cli {
    /// Repository root (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon loop until interrupted
    ///
    /// Exit codes: 0 clean stop, 1 configuration error, 2 git unavailable,
    /// 3 fatal ref conflict on watermark persistence.
    Daemon,

    /// Run exactly one tick, then exit
    Tick,

    /// Inspect and run job definitions
    #[command(subcommand)]
    Jobs(JobsCommands),

    /// Inspect event definitions
    #[command(subcommand)]
    Events(EventsCommands),

    /// Read the receipt ledger
    #[command(subcommand)]
    Receipts(ReceiptsCommands),

    /// Inspect and clean up lock refs
    #[command(subcommand)]
    Locks(LocksCommands),

    /// List the repository's worktrees as the daemon sees them
    Worktrees,

    /// Check all definitions and report problems
    ///
    /// Broken files never affect unrelated definitions; this surfaces them.
    Validate,
}

#[derive(Subcommand)]
enum JobsCommands {
    /// List discovered jobs
    List,
    /// Run one job now, against the current worktree's HEAD
    Run {
        /// Job id (path under jobs/ without extension)
        id: String,
        /// Payload JSON passed to the job
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

#[derive(Subcommand)]
enum EventsCommands {
    /// List discovered events with their predicate kinds
    List,
}

#[derive(Subcommand)]
enum ReceiptsCommands {
    /// List receipts, newest commit first
    List {
        #[arg(long)]
        job: Option<String>,
        #[arg(long)]
        event: Option<String>,
        #[arg(long)]
        status: Option<StatusArg>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print one receipt as JSON
    Show { id: String },
    /// Recompute a receipt's fingerprint and compare
    Verify { id: String },
    /// Counts over the recent window
    ///
    /// Rates are computed over the capped window, so they lean toward
    /// recent history.
    Stats,
}

#[derive(Subcommand)]
enum LocksCommands {
    /// List live lock refs
    List,
    /// Delete stale and orphaned locks
    Gc,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
    Success,
    Error,
    Skipped,
}

impl From<StatusArg> for ReceiptStatus {
    fn from(s: StatusArg) -> Self {
        match s {
            StatusArg::Success => Self::Success,
            StatusArg::Error => Self::Error,
            StatusArg::Skipped => Self::Skipped,
        }
    }
}

fn main() -> ExitCode {
    telemetry::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("gitvan: {e:#}");
            // configuration errors and everything uncategorized exit 1
            let code = e
                .downcast_ref::<DaemonError>()
                .map_or(1, DaemonError::exit_code);
            u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let cwd = cli
        .root
        .map_or_else(std::env::current_dir, Ok)
        .context("cannot resolve working directory")?;
    let config = Config::load(&cwd)?;
    let root = config.root(&cwd);
    let ctx = Arc::new(Context::new(root.clone(), Arc::new(config)));

    match cli.command {
        Commands::Daemon => cmd_daemon(ctx),
        Commands::Tick => cmd_tick(&ctx),
        Commands::Jobs(cmd) => cmd_jobs(&ctx, &root, cmd),
        Commands::Events(cmd) => cmd_events(&ctx, &root, cmd),
        Commands::Receipts(cmd) => cmd_receipts(&ctx, cmd),
        Commands::Locks(cmd) => cmd_locks(&ctx, cmd),
        Commands::Worktrees => cmd_worktrees(&ctx),
        Commands::Validate => cmd_validate(&ctx, &root),
    }
}

fn cmd_daemon(ctx: Arc<Context>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            cancel.store(true, Ordering::SeqCst);
            let _ = shutdown_tx.try_send(());
        })
        .context("cannot install signal handler")?;
    }
    let mut daemon = Daemon::new(ctx, shutdown_rx, cancel)?;
    daemon.run()?;
    Ok(())
}

fn cmd_tick(ctx: &Arc<Context>) -> Result<()> {
    let (_tx, rx) = crossbeam_channel::bounded::<()>(1);
    let cancel = Arc::new(AtomicBool::new(false));
    let mut daemon = Daemon::new(Arc::clone(ctx), rx, cancel)?;
    let report = daemon.tick()?;
    println!(
        "worktrees {}  commits {}  invocations {}  cron {}  deduped {}  definition-errors {}",
        report.worktrees,
        report.commits_seen,
        report.invocations,
        report.cron_fired,
        report.deduped,
        report.definition_errors,
    );
    Ok(())
}

fn load_definitions(ctx: &Context, root: &std::path::Path) -> Result<Definitions> {
    let mut caches = DefinitionCaches::default();
    Ok(Definitions::load(&ctx.config, root, &mut caches)?)
}

fn cmd_jobs(ctx: &Arc<Context>, root: &std::path::Path, cmd: JobsCommands) -> Result<()> {
    let defs = load_definitions(ctx, root)?;
    match cmd {
        JobsCommands::List => {
            let mut jobs: Vec<_> = defs.jobs.values().collect();
            jobs.sort_by(|a, b| a.id.cmp(&b.id));
            for job in jobs {
                let cron = job
                    .cron
                    .as_ref()
                    .map_or(String::new(), |c| format!("  [cron {c}]"));
                println!("{}  {}{cron}", job.id, job.name);
            }
            Ok(())
        }
        JobsCommands::Run { id, payload } => {
            let job_id = JobId::new(&id).map_err(|e| anyhow::anyhow!("{e}"))?;
            let Some(job) = defs.jobs.get(&job_id) else {
                bail!("job not found: {id}");
            };
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;

            with_context(Arc::clone(ctx), || {
                let git = Git::from_context(ctx);
                let repo_root = git.repo_root()?;
                let git = git.at(&repo_root);
                let worktrees = git.list_worktrees()?;
                let Some(worktree) = worktrees
                    .iter()
                    .find(|w| w.path == repo_root)
                    .or_else(|| worktrees.first())
                else {
                    bail!("no usable worktree");
                };
                let store = ReceiptStore::new(&git, ctx.config.receipts.notes_ref.clone());
                let locks = LockManager::new(
                    &git,
                    ctx.config.locks.ref_prefix.clone(),
                    ctx.config.locks.timeout_ms,
                );
                let runner = Runner::new(&store, &locks);
                let invocation = Invocation::new(
                    None,
                    job.id.clone(),
                    worktree.head.clone(),
                    &worktree.path,
                    payload,
                );
                let receipt = runner.run(ctx, worktree, job, &invocation)?;
                println!("{}", serde_json::to_string_pretty(&receipt)?);
                Ok(())
            })
        }
    }
}

fn cmd_events(ctx: &Arc<Context>, root: &std::path::Path, cmd: EventsCommands) -> Result<()> {
    let defs = load_definitions(ctx, root)?;
    match cmd {
        EventsCommands::List => {
            for event in &defs.events {
                let target = match &event.action {
                    gitvan::events::EventAction::Job { job } => format!("job {job}"),
                    gitvan::events::EventAction::Inline { .. } => "inline".to_owned(),
                };
                println!("{}  [{}]  -> {target}", event.id, event.predicate.kind());
            }
            Ok(())
        }
    }
}

fn cmd_receipts(ctx: &Arc<Context>, cmd: ReceiptsCommands) -> Result<()> {
    with_context(Arc::clone(ctx), || {
        let git = Git::from_context(ctx);
        let store = ReceiptStore::new(&git, ctx.config.receipts.notes_ref.clone());
        match cmd {
            ReceiptsCommands::List {
                job,
                event,
                status,
                limit,
            } => {
                let filter = ReceiptFilter {
                    job_id: job.map(|j| JobId::new(&j)).transpose().map_err(|e| anyhow::anyhow!("{e}"))?,
                    event_id: event
                        .map(|e| gitvan::model::EventId::new(&e))
                        .transpose()
                        .map_err(|e| anyhow::anyhow!("{e}"))?,
                    status: status.map(Into::into),
                    limit: Some(limit),
                    ..ReceiptFilter::default()
                };
                let page = store.list(&filter)?;
                for r in &page.receipts {
                    println!(
                        "{:8} {}  {}  {}  {}",
                        r.status.to_string(),
                        r.started_at,
                        r.job_id.as_ref().map_or("-", |j| j.as_str()),
                        r.commit.abbrev(),
                        r.id,
                    );
                }
                if page.skipped_lines > 0 {
                    eprintln!("({} unparsable note lines skipped)", page.skipped_lines);
                }
                Ok(())
            }
            ReceiptsCommands::Show { id } => {
                let Some(receipt) = store.get(&id)? else {
                    bail!("receipt not found in the recent window: {id}");
                };
                println!("{}", serde_json::to_string_pretty(&receipt)?);
                Ok(())
            }
            ReceiptsCommands::Verify { id } => {
                let Some(receipt) = store.get(&id)? else {
                    bail!("receipt not found in the recent window: {id}");
                };
                let verdict = receipt.verify();
                if verdict.valid {
                    println!("{id}: valid");
                } else {
                    println!(
                        "{id}: INVALID — {}",
                        verdict.reason.unwrap_or_else(|| "unknown".to_owned())
                    );
                }
                Ok(())
            }
            ReceiptsCommands::Stats => {
                let stats = store.stats(&ReceiptFilter::default())?;
                println!(
                    "total {}  success {}  error {}  skipped {}  success-rate {:.1}%",
                    stats.total,
                    stats.success,
                    stats.error,
                    stats.skipped,
                    stats.success_rate * 100.0,
                );
                Ok(())
            }
        }
    })
}

fn cmd_locks(ctx: &Arc<Context>, cmd: LocksCommands) -> Result<()> {
    with_context(Arc::clone(ctx), || {
        let git = Git::from_context(ctx);
        let locks = LockManager::new(
            &git,
            ctx.config.locks.ref_prefix.clone(),
            ctx.config.locks.timeout_ms,
        );
        match cmd {
            LocksCommands::List => {
                for info in locks.list()? {
                    println!(
                        "{}  {}  holder {}  acquired {}",
                        info.ref_name,
                        info.commit.abbrev(),
                        info.holder.as_deref().unwrap_or("-"),
                        info.acquired_at
                            .map_or("unknown".to_owned(), |t| t.to_rfc3339()),
                    );
                }
                Ok(())
            }
            LocksCommands::Gc => {
                let worktrees = git.list_worktrees()?;
                let report = locks.gc(&worktrees, ctx.now())?;
                println!(
                    "examined {}  removed-stale {}  removed-orphaned {}",
                    report.examined, report.removed_stale, report.removed_orphaned,
                );
                Ok(())
            }
        }
    })
}

fn cmd_worktrees(ctx: &Arc<Context>) -> Result<()> {
    with_context(Arc::clone(ctx), || {
        let git = Git::from_context(ctx);
        for wt in git.list_worktrees()? {
            println!(
                "{}  {}  {}{}",
                wt.path.display(),
                wt.head.abbrev(),
                wt.branch_or_detached(),
                if wt.is_main { "  (main)" } else { "" },
            );
        }
        Ok(())
    })
}

fn cmd_validate(ctx: &Arc<Context>, root: &std::path::Path) -> Result<()> {
    let defs = load_definitions(ctx, root)?;
    println!(
        "jobs {}  events {}  schedules {}",
        defs.jobs.len(),
        defs.events.len(),
        defs.schedules.len(),
    );
    for err in &defs.errors {
        println!("error: {err}");
    }
    for (event, job) in defs.unknown_job_references() {
        println!("warning: event '{event}' references unknown job '{job}'");
    }
    if defs.errors.is_empty() {
        println!("definitions ok");
    } else {
        println!("{} definition error(s)", defs.errors.len());
    }
    Ok(())
}
