//! The daemon: poll loop, watermarks, cron dispatch, parallel worktrees.
//!
//! One long-running loop drives everything. Per tick:
//!
//! 1. Probe git, enumerate worktrees.
//! 2. Load definitions through the content-hash cache (definition errors are
//!    counted and logged, never fatal).
//! 3. Fan worktrees out over a bounded rayon pool. Per worktree: route new
//!    commits since the watermark, run each invocation, dispatch due cron
//!    sources, then advance the watermark ref.
//! 4. Sleep until the next tick or a shutdown signal.
//!
//! Failure posture follows the error taxonomy: invocation failures become
//! receipts; transient ref conflicts retry up to 3 times then demote the
//! worktree for one tick; git unavailability pauses the loop with
//! exponential backoff capped at 60 s and exits with code 2 when it never
//! recovers; a watermark ref that cannot be persisted after retries is fatal
//! (exit code 3).
//!
//! Cancellation is cooperative: the flag is checked between invocations and
//! between worktrees, the current receipt write and lock release always
//! complete, then the loop exits cleanly.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::SecondsFormat;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use rayon::prelude::*;
use serde_json::json;
use tracing::{debug, error, info, info_span, warn};

use crate::config::Config;
use crate::context::{Context, with_context};
use crate::cron::CronExpr;
use crate::discovery::{self, DefinitionError, LoadCache};
use crate::events::{EventAction, EventDef, ScheduleDef};
use crate::git::{Git, GitError};
use crate::jobs::JobDef;
use crate::lock::LockManager;
use crate::model::{CommitId, EventId, Invocation, JobId, Worktree};
use crate::receipt::{Receipt, ReceiptStatus, ReceiptStore};
use crate::refs;
use crate::router::{Router, RouterError};
use crate::runner::Runner;

/// Transient failures are retried this many times within a tick.
const TRANSIENT_RETRIES: usize = 3;

/// Consecutive git-unavailable ticks before the daemon gives up (exit 2).
const MAX_GIT_FAILURES: u32 = 8;

/// Operational backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Fatal daemon failures, mapped to process exit codes.
#[derive(Debug)]
pub enum DaemonError {
    /// The git binary or the repository is not usable (exit code 2).
    GitUnavailable { detail: String },
    /// A watermark ref could not be persisted after retries (exit code 3).
    WatermarkPersist { ref_name: String, detail: String },
    /// Internal setup failure (exit code 1).
    Internal { detail: String },
}

impl DaemonError {
    /// The process exit code this failure maps to.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Internal { .. } => 1,
            Self::GitUnavailable { .. } => 2,
            Self::WatermarkPersist { .. } => 3,
        }
    }
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GitUnavailable { detail } => {
                write!(f, "git is unavailable: {detail}")
            }
            Self::WatermarkPersist { ref_name, detail } => {
                write!(
                    f,
                    "fatal ref conflict persisting watermark '{ref_name}': {detail}"
                )
            }
            Self::Internal { detail } => write!(f, "daemon setup failed: {detail}"),
        }
    }
}

impl std::error::Error for DaemonError {}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Per-process definition caches, invalidated by content hash.
#[derive(Debug, Default)]
pub struct DefinitionCaches {
    jobs: LoadCache<JobDef>,
    events: LoadCache<EventDef>,
    schedules: LoadCache<ScheduleDef>,
}

/// Everything discovery produced for one tick.
#[derive(Debug, Default)]
pub struct Definitions {
    pub jobs: HashMap<JobId, Arc<JobDef>>,
    /// In discovery order.
    pub events: Vec<EventDef>,
    pub schedules: Vec<ScheduleDef>,
    /// Definition errors, one per broken file; unrelated files still load.
    pub errors: Vec<DefinitionError>,
}

impl Definitions {
    /// Scan and load all definitions under the configured roots.
    ///
    /// # Errors
    /// Only scanning failures; individual file failures land in `errors`.
    pub fn load(
        config: &Config,
        root: &Path,
        caches: &mut DefinitionCaches,
    ) -> Result<Self, DefinitionError> {
        let mut defs = Self::default();

        for descriptor in discovery::scan(&config.jobs_dir(root))? {
            let id = match JobId::new(&descriptor.id) {
                Ok(id) => id,
                Err(e) => {
                    defs.errors.push(DefinitionError::InvalidId {
                        path: descriptor.path,
                        detail: e.to_string(),
                    });
                    continue;
                }
            };
            match caches.jobs.load(&descriptor.path, |text| {
                JobDef::parse(id.clone(), &descriptor.path, text)
            }) {
                Ok(job) => {
                    defs.jobs.insert(job.id.clone(), job);
                }
                Err(e) => defs.errors.push(e),
            }
        }

        for descriptor in discovery::scan(&config.events_dir(root))? {
            let id = match EventId::new(&descriptor.id) {
                Ok(id) => id,
                Err(e) => {
                    defs.errors.push(DefinitionError::InvalidId {
                        path: descriptor.path,
                        detail: e.to_string(),
                    });
                    continue;
                }
            };
            match caches.events.load(&descriptor.path, |text| {
                EventDef::parse(id.clone(), &descriptor.path, text)
            }) {
                Ok(event) => defs.events.push((*event).clone()),
                Err(e) => defs.errors.push(e),
            }
        }

        for descriptor in discovery::scan_flat(&config.schedules_dir(root))? {
            match caches.schedules.load(&descriptor.path, |text| {
                ScheduleDef::parse(&descriptor.id, &descriptor.path, text)
            }) {
                Ok(schedule) => defs.schedules.push((*schedule).clone()),
                Err(e) => defs.errors.push(e),
            }
        }

        Ok(defs)
    }

    /// Events whose `job` target is not a discovered job — a validation
    /// finding, not a load failure.
    #[must_use]
    pub fn unknown_job_references(&self) -> Vec<(EventId, JobId)> {
        self.events
            .iter()
            .filter_map(|e| match &e.action {
                EventAction::Job { job } if !self.jobs.contains_key(job) => {
                    Some((e.id.clone(), job.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tick reporting
// ---------------------------------------------------------------------------

/// What one tick did, summed over worktrees.
#[derive(Clone, Debug, Default)]
pub struct TickReport {
    pub worktrees: usize,
    pub commits_seen: usize,
    pub invocations: usize,
    pub cron_fired: usize,
    pub deduped: usize,
    pub definition_errors: usize,
    /// Worktrees demoted for the next tick after unresolved transient
    /// failures.
    pub demoted: usize,
}

#[derive(Debug, Default)]
struct WorktreeOutcome {
    commits_seen: usize,
    invocations: usize,
    cron_fired: usize,
    deduped: usize,
    demote: Option<String>,
    watermark_fatal: Option<(String, String)>,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// The long-running engine loop.
pub struct Daemon {
    ctx: Arc<Context>,
    shutdown: Receiver<()>,
    cancel: Arc<AtomicBool>,
    caches: DefinitionCaches,
    watermarks: Mutex<HashMap<String, CommitId>>,
    demoted: Mutex<HashSet<String>>,
    pool: rayon::ThreadPool,
}

impl Daemon {
    /// Build a daemon over the given context. `shutdown` ends the loop at
    /// the next safe point; `cancel` is also checked mid-tick.
    ///
    /// # Errors
    /// Fails when the worker pool cannot be built.
    pub fn new(
        ctx: Arc<Context>,
        shutdown: Receiver<()>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, DaemonError> {
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
        let threads = ctx.config.daemon.max_concurrency.clamp(1, cpus);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("gitvan-worker-{i}"))
            .build()
            .map_err(|e| DaemonError::Internal {
                detail: e.to_string(),
            })?;
        Ok(Self {
            ctx,
            shutdown,
            cancel,
            caches: DefinitionCaches::default(),
            watermarks: Mutex::new(HashMap::new()),
            demoted: Mutex::new(HashSet::new()),
            pool,
        })
    }

    /// Run until shutdown. Clean stop returns `Ok(())` (exit code 0).
    ///
    /// # Errors
    /// Fatal failures per the taxonomy; the caller maps them to exit codes.
    pub fn run(&mut self) -> Result<(), DaemonError> {
        let poll = Duration::from_millis(self.ctx.config.daemon.poll_ms);
        let mut git_failures: u32 = 0;
        let mut pause = Duration::from_secs(1);

        info!(poll_ms = self.ctx.config.daemon.poll_ms, "daemon started");
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }
            match self.tick() {
                Ok(report) => {
                    git_failures = 0;
                    pause = Duration::from_secs(1);
                    debug!(
                        worktrees = report.worktrees,
                        invocations = report.invocations,
                        cron = report.cron_fired,
                        "tick complete"
                    );
                }
                Err(e @ DaemonError::GitUnavailable { .. }) => {
                    git_failures += 1;
                    if git_failures >= MAX_GIT_FAILURES {
                        error!(%e, "git did not come back; giving up");
                        return Err(e);
                    }
                    warn!(%e, pause_s = pause.as_secs(), "git unavailable; backing off");
                    if self.wait(pause) {
                        break;
                    }
                    pause = (pause * 2).min(MAX_BACKOFF);
                    continue;
                }
                Err(fatal) => return Err(fatal),
            }
            if self.wait(poll) {
                break;
            }
        }
        info!("daemon stopped");
        Ok(())
    }

    /// Sleep for `duration` or until shutdown; returns `true` on shutdown.
    fn wait(&self, duration: Duration) -> bool {
        match self.shutdown.recv_timeout(duration) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.cancel.store(true, Ordering::SeqCst);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// One tick: route, run, schedule, advance — across all worktrees.
    ///
    /// # Errors
    /// Fatal failures only; everything else is absorbed into the report.
    pub fn tick(&mut self) -> Result<TickReport, DaemonError> {
        let span = info_span!("tick");
        let _entered = span.enter();

        let git = Git::from_context(&self.ctx);
        git.version().map_err(|e| DaemonError::GitUnavailable {
            detail: e.to_string(),
        })?;
        let worktrees = match git.list_worktrees() {
            Ok(wts) => wts,
            Err(e) => {
                return Err(DaemonError::GitUnavailable {
                    detail: e.to_string(),
                });
            }
        };

        let root = self.ctx.config.root(&self.ctx.cwd);
        let defs = Definitions::load(&self.ctx.config, &root, &mut self.caches).map_err(|e| {
            DaemonError::Internal {
                detail: e.to_string(),
            }
        })?;
        for err in &defs.errors {
            warn!(definition = %err.path().display(), %err, "definition error");
        }

        let skip: HashSet<String> = {
            let mut demoted = self.demoted.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *demoted)
        };

        let mut report = TickReport {
            worktrees: worktrees.len(),
            definition_errors: defs.errors.len(),
            ..TickReport::default()
        };

        let outcomes: Vec<WorktreeOutcome> = self.pool.install(|| {
            worktrees
                .par_iter()
                .map(|wt| {
                    let slug = refs::worktree_slug(&wt.path);
                    if skip.contains(&slug) {
                        debug!(worktree = %wt.path.display(), "demoted this tick; skipping");
                        return WorktreeOutcome::default();
                    }
                    if self.cancel.load(Ordering::SeqCst) {
                        return WorktreeOutcome::default();
                    }
                    self.process_worktree(&git, wt, &defs)
                })
                .collect()
        });

        for outcome in outcomes {
            if let Some((ref_name, detail)) = outcome.watermark_fatal {
                return Err(DaemonError::WatermarkPersist { ref_name, detail });
            }
            report.commits_seen += outcome.commits_seen;
            report.invocations += outcome.invocations;
            report.cron_fired += outcome.cron_fired;
            report.deduped += outcome.deduped;
            if outcome.demote.is_some() {
                report.demoted += 1;
            }
        }
        Ok(report)
    }

    /// One worktree's share of the tick: route → run → cron → watermark.
    fn process_worktree(&self, git: &Git, worktree: &Worktree, defs: &Definitions) -> WorktreeOutcome {
        let ctx = Arc::clone(&self.ctx);
        with_context(Arc::clone(&ctx), || {
            let span = info_span!("worktree", path = %worktree.path.display());
            let _entered = span.enter();
            let mut outcome = WorktreeOutcome::default();

            let git = git.at(&worktree.path);
            let config = &ctx.config;
            let store = ReceiptStore::new(&git, config.receipts.notes_ref.clone());
            let locks = LockManager::new(&git, config.locks.ref_prefix.clone(), config.locks.timeout_ms);
            let runner = Runner::new(&store, &locks);
            let slug = refs::worktree_slug(&worktree.path);

            let watermark = match self.watermark_for(&git, &slug) {
                Ok(w) => w,
                Err(e) => {
                    warn!(%e, "cannot read watermark; demoting worktree");
                    outcome.demote = Some(e.to_string());
                    self.demote(&slug);
                    return outcome;
                }
            };

            let lookback = chrono::Duration::seconds(
                i64::try_from(config.daemon.lookback_s).unwrap_or(i64::MAX),
            );
            let floor = ctx.now() - lookback;
            let router = Router::new(&git, &store, &defs.events, config.daemon.max_per_tick);

            let plan = match self.with_transient_retry(|| {
                router.plan(worktree, watermark.as_ref(), Some(floor))
            }) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(%e, "routing failed after retries; demoting worktree");
                    outcome.demote = Some(e.to_string());
                    self.demote(&slug);
                    return outcome;
                }
            };
            outcome.commits_seen = plan.commits_seen;
            outcome.deduped = plan.deduped;

            let mut fatal = false;
            for planned in &plan.invocations {
                if self.cancel.load(Ordering::SeqCst) {
                    fatal = true; // don't advance past work we skipped
                    break;
                }
                let event = &defs.events[planned.event_index];
                let Some(job) = resolve_job(event, defs) else {
                    // unknown job target: the dispatched invocation still
                    // gets its terminal receipt
                    let receipt =
                        unknown_job_receipt(&ctx, worktree, event, &planned.invocation);
                    if store.append(&receipt).is_ok() {
                        outcome.invocations += 1;
                    }
                    continue;
                };
                match runner.run(&ctx, worktree, &job, &planned.invocation) {
                    Ok(receipt) => {
                        outcome.invocations += 1;
                        debug!(id = %receipt.id, status = %receipt.status, "receipt written");
                    }
                    Err(e) => {
                        warn!(%e, "runner infrastructure failure");
                        outcome.demote = Some(e.to_string());
                        self.demote(&slug);
                        fatal = true;
                        break;
                    }
                }
            }

            if !self.cancel.load(Ordering::SeqCst) {
                outcome.cron_fired =
                    self.dispatch_cron(&ctx, worktree, defs, &store, &runner);
            }

            // Advance only after every commit in the tick completed; a capped
            // or cancelled tick re-routes the remainder next time (dedup by
            // fingerprint keeps that cheap).
            if !fatal && !plan.capped {
                if let Err(e) = self.persist_watermark(&git, &slug, &plan.head) {
                    error!(%e, "watermark persistence failed");
                    outcome.watermark_fatal =
                        Some((refs::watermark_ref(refs::WATERMARK_PREFIX, &worktree.path), e.to_string()));
                }
            }
            outcome
        })
    }

    fn demote(&self, slug: &str) {
        self.demoted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(slug.to_owned());
    }

    /// In-memory watermark, falling back to the persisted ref.
    fn watermark_for(&self, git: &Git, slug: &str) -> Result<Option<CommitId>, GitError> {
        if let Some(w) = self
            .watermarks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(slug)
        {
            return Ok(Some(w.clone()));
        }
        let ref_name = format!("{}/{slug}", refs::WATERMARK_PREFIX);
        git.show_ref(&ref_name)
    }

    /// Persist the watermark, retrying transient conflicts; unresolved
    /// failure is the fatal exit-3 condition.
    fn persist_watermark(&self, git: &Git, slug: &str, head: &CommitId) -> Result<(), GitError> {
        let ref_name = format!("{}/{slug}", refs::WATERMARK_PREFIX);
        let mut last_err = None;
        for attempt in 0..TRANSIENT_RETRIES {
            match git.update_ref(&ref_name, head) {
                Ok(()) => {
                    self.watermarks
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .insert(slug.to_owned(), head.clone());
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, %e, "watermark update failed");
                    last_err = Some(e);
                    std::thread::sleep(jitter(attempt));
                }
            }
        }
        Err(last_err.unwrap_or(GitError::Conflict {
            ref_name,
        }))
    }

    /// Fire due cron sources for one worktree: cron events, static
    /// schedules, and jobs that carry their own `cron`.
    fn dispatch_cron(
        &self,
        ctx: &Context,
        worktree: &Worktree,
        defs: &Definitions,
        store: &ReceiptStore<'_>,
        runner: &Runner<'_>,
    ) -> usize {
        let now = ctx.now();
        let lookback = chrono::Duration::seconds(
            i64::try_from(ctx.config.daemon.lookback_s).unwrap_or(i64::MAX),
        );
        let mut fired = 0;

        for source in cron_sources(defs) {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }
            let last = store
                .latest_scheduled(source.event_id.as_ref(), &source.job_id)
                .ok()
                .flatten()
                .and_then(|r| r.scheduled_for());
            let floor = last.unwrap_or(now - lookback);
            let Some(slot) = source.cron.latest_slot_in(floor, now) else {
                continue;
            };

            let payload = json!({
                "scheduled": true,
                "cron": source.cron.as_str(),
                "scheduledFor": slot.to_rfc3339_opts(SecondsFormat::Secs, true),
            });
            let invocation = Invocation::new(
                source.event_id.clone(),
                source.job_id.clone(),
                worktree.head.clone(),
                &worktree.path,
                payload,
            );
            let already = store
                .fingerprints_for(&worktree.head)
                .map(|fps| fps.contains(&invocation.fingerprint))
                .unwrap_or(false);
            if already {
                continue;
            }
            let Some(job) = source.job(defs) else {
                warn!(job = %source.job_id, "cron source references unknown job");
                continue;
            };
            match runner.run(ctx, worktree, &job, &invocation) {
                Ok(receipt) if receipt.status != ReceiptStatus::Skipped => fired += 1,
                Ok(_) => {}
                Err(e) => warn!(%e, "cron dispatch failed"),
            }
        }
        fired
    }

    /// Retry an operation on transient (ref-conflict) failures with small
    /// jittered pauses.
    fn with_transient_retry<T>(
        &self,
        mut op: impl FnMut() -> Result<T, RouterError>,
    ) -> Result<T, RouterError> {
        let mut last = None;
        for attempt in 0..TRANSIENT_RETRIES {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) => {
                    debug!(attempt, %e, "transient failure; retrying");
                    last = Some(e);
                    std::thread::sleep(jitter(attempt));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(RouterError::Git(GitError::Conflict {
            ref_name: "<retry>".to_owned(),
        })))
    }
}

// ---------------------------------------------------------------------------
// Cron sources
// ---------------------------------------------------------------------------

struct CronSource {
    event_id: Option<EventId>,
    job_id: JobId,
    cron: CronExpr,
    inline: Option<(PathBuf, crate::jobs::RunSpec)>,
}

impl CronSource {
    fn job(&self, defs: &Definitions) -> Option<Arc<JobDef>> {
        if let Some((path, run)) = &self.inline {
            return JobDef::inline(self.job_id.clone(), path, run.clone())
                .ok()
                .map(Arc::new);
        }
        defs.jobs.get(&self.job_id).cloned()
    }
}

/// Every schedule the dispatcher watches, in a stable order: cron events,
/// then static schedules, then self-scheduled jobs.
fn cron_sources(defs: &Definitions) -> Vec<CronSource> {
    let mut sources = Vec::new();
    for event in &defs.events {
        if let Some(cron) = event.predicate.cron() {
            let Ok(job_id) = event.target_job_id() else {
                continue;
            };
            let inline = match &event.action {
                EventAction::Inline { run } => Some((event.path.clone(), run.clone())),
                EventAction::Job { .. } => None,
            };
            sources.push(CronSource {
                event_id: Some(event.id.clone()),
                job_id,
                cron: cron.clone(),
                inline,
            });
        }
    }
    for schedule in &defs.schedules {
        if !schedule.enabled {
            continue;
        }
        let Ok(event_id) = EventId::new(&format!("schedules/{}", schedule.id)) else {
            continue;
        };
        sources.push(CronSource {
            event_id: Some(event_id),
            job_id: schedule.job.clone(),
            cron: schedule.cron.clone(),
            inline: None,
        });
    }
    for job in defs.jobs.values() {
        if let Some(cron) = &job.cron {
            sources.push(CronSource {
                event_id: None,
                job_id: job.id.clone(),
                cron: cron.clone(),
                inline: None,
            });
        }
    }
    sources
}

fn is_transient(e: &RouterError) -> bool {
    match e {
        RouterError::Git(g) => g.is_conflict(),
        RouterError::Receipt(crate::receipt::ReceiptError::Git(g)) => g.is_conflict(),
        RouterError::Receipt(_) => false,
    }
}

/// Small randomized pause between retry attempts.
fn jitter(attempt: usize) -> Duration {
    let base = 20u64 << attempt.min(4);
    Duration::from_millis(base + u64::from(rand::random::<u8>()) % base.max(1))
}

/// Resolve the job an event invokes; `None` for an unresolvable reference.
fn resolve_job(event: &EventDef, defs: &Definitions) -> Option<Arc<JobDef>> {
    match &event.action {
        EventAction::Job { job } => defs.jobs.get(job).cloned(),
        EventAction::Inline { run } => {
            let id = event.target_job_id().ok()?;
            JobDef::inline(id, &event.path, run.clone()).ok().map(Arc::new)
        }
    }
}

/// The terminal receipt for an invocation whose job target does not exist.
fn unknown_job_receipt(
    ctx: &Context,
    worktree: &Worktree,
    event: &EventDef,
    invocation: &Invocation,
) -> Receipt {
    let mut meta = std::collections::BTreeMap::new();
    meta.insert("payload".to_owned(), invocation.payload.clone());
    meta.insert("event".to_owned(), json!(event.id));
    Receipt {
        id: format!("{}-{:08x}", invocation.fingerprint, rand::random::<u32>()),
        job_id: Some(invocation.job_id.clone()),
        event_id: invocation.event_id.clone(),
        status: ReceiptStatus::Error,
        commit: invocation.commit.clone(),
        branch: worktree.branch_or_detached().to_owned(),
        worktree: worktree.path_str(),
        started_at: ctx.now_iso(),
        duration_ms: 0,
        result: None,
        error: Some(format!("job not found: {}", invocation.job_id)),
        artifacts: Vec::new(),
        fingerprint: invocation.fingerprint.clone(),
        meta,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
