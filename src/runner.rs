//! The job runner: lock-gated, context-scoped, receipt-terminated.
//!
//! Every invocation handed to the runner ends in exactly one terminal
//! receipt:
//!
//! - lock unavailable        → `skipped`, `meta.reason = "lock-held"`
//! - fingerprint already run → `skipped`, `meta.reason = "duplicate-fingerprint"`
//! - job returned            → `success` with the canonicalized result
//! - job raised or timed out → `error` with a short human string
//!
//! Job failures are isolated — they never abort the tick or affect other
//! invocations. Only infrastructure failures (ledger unwritable, lock refs
//! unreachable) propagate to the daemon.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde_json::{Value, json};
use tracing::{info, info_span, warn};

use crate::context::Context;
use crate::jobs::{JobDef, JobError};
use crate::lock::{LockError, LockManager};
use crate::model::{Invocation, Worktree, canonical_json};
use crate::receipt::{Receipt, ReceiptError, ReceiptStatus, ReceiptStore};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Infrastructure failures around a run. Job failures are not errors here —
/// they become receipts.
#[derive(Debug)]
pub enum RunnerError {
    Lock(LockError),
    Receipt(ReceiptError),
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock(e) => write!(f, "runner lock failure: {e}"),
            Self::Receipt(e) => write!(f, "runner receipt failure: {e}"),
        }
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Lock(e) => Some(e),
            Self::Receipt(e) => Some(e),
        }
    }
}

impl From<LockError> for RunnerError {
    fn from(e: LockError) -> Self {
        Self::Lock(e)
    }
}

impl From<ReceiptError> for RunnerError {
    fn from(e: ReceiptError) -> Self {
        Self::Receipt(e)
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes invocations against one worktree.
pub struct Runner<'a> {
    store: &'a ReceiptStore<'a>,
    locks: &'a LockManager<'a>,
}

impl<'a> Runner<'a> {
    #[must_use]
    pub fn new(store: &'a ReceiptStore<'a>, locks: &'a LockManager<'a>) -> Self {
        Self { store, locks }
    }

    /// Run one invocation to its terminal receipt.
    ///
    /// # Errors
    /// Only infrastructure failures; the returned receipt carries the job's
    /// own outcome.
    pub fn run(
        &self,
        ctx: &Context,
        worktree: &Worktree,
        job: &JobDef,
        invocation: &Invocation,
    ) -> Result<Receipt, RunnerError> {
        let span = info_span!("run", job = %invocation.job_id, commit = %invocation.commit.abbrev());
        let _entered = span.enter();

        let lock_name = format!("job-{}-{}", invocation.job_id, invocation.commit.abbrev());
        let Some(lock) = self
            .locks
            .acquire(&lock_name, &worktree.path, ctx.now())?
        else {
            info!("lock held elsewhere; skipping");
            let receipt = self.skip_receipt(ctx, worktree, invocation, "lock-held");
            self.store.append(&receipt)?;
            return Ok(receipt);
        };

        // Another daemon may have finished this exact invocation between our
        // routing pass and the lock grab. Don't run it twice.
        let already_done = self
            .store
            .fingerprints_for(&invocation.commit)
            .map(|fps| fps.contains(&invocation.fingerprint))
            .unwrap_or(false);
        let outcome = if already_done {
            info!("fingerprint already receipted; skipping");
            None
        } else {
            let env = self.job_env(ctx, worktree, job, invocation);
            let started = Instant::now();
            let started_at = ctx.now_iso();
            let result = job.execute(&worktree.path, &env);
            let duration_ms =
                u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            Some((started_at, duration_ms, result))
        };

        // Receipt first, then release: a crash between the two leaves a
        // stale lock (recovered by TTL), never a run without a receipt.
        let is_duplicate = outcome.is_none();
        let receipt = match outcome {
            None => self.skip_receipt(ctx, worktree, invocation, "duplicate-fingerprint"),
            Some((started_at, duration_ms, result)) => {
                self.terminal_receipt(worktree, invocation, started_at, duration_ms, result)
            }
        };
        // a duplicate's fingerprint already has its receipt on the ledger
        let append_result = if is_duplicate {
            Ok(())
        } else {
            self.store.append(&receipt)
        };

        if let Err(e) = self.locks.release(&lock) {
            warn!(error = %e, "failed to release lock; TTL cleanup will recover it");
        }
        append_result?;
        Ok(receipt)
    }

    /// The `GITVAN_*` environment a job sees, on top of the context's
    /// deterministic child env.
    fn job_env(
        &self,
        ctx: &Context,
        worktree: &Worktree,
        job: &JobDef,
        invocation: &Invocation,
    ) -> Vec<(String, String)> {
        let mut env = ctx.child_env();
        env.push(("GITVAN_JOB".to_owned(), job.id.to_string()));
        env.push((
            "GITVAN_PAYLOAD".to_owned(),
            canonical_json(&invocation.payload),
        ));
        env.push(("GITVAN_COMMIT".to_owned(), invocation.commit.to_string()));
        env.push((
            "GITVAN_BRANCH".to_owned(),
            worktree.branch_or_detached().to_owned(),
        ));
        env.push(("GITVAN_WORKTREE".to_owned(), worktree.path_str()));
        env.push(("GITVAN_NOW".to_owned(), ctx.now_iso()));
        if let Some(event_id) = &invocation.event_id {
            env.push(("GITVAN_EVENT".to_owned(), event_id.to_string()));
        }
        env
    }

    fn base_meta(invocation: &Invocation) -> BTreeMap<String, Value> {
        let mut meta = BTreeMap::new();
        meta.insert("payload".to_owned(), invocation.payload.clone());
        meta
    }

    fn receipt_id(invocation: &Invocation) -> String {
        format!("{}-{:08x}", invocation.fingerprint, rand::random::<u32>())
    }

    fn skip_receipt(
        &self,
        ctx: &Context,
        worktree: &Worktree,
        invocation: &Invocation,
        reason: &str,
    ) -> Receipt {
        let mut meta = Self::base_meta(invocation);
        meta.insert("reason".to_owned(), json!(reason));
        Receipt {
            id: Self::receipt_id(invocation),
            job_id: Some(invocation.job_id.clone()),
            event_id: invocation.event_id.clone(),
            status: ReceiptStatus::Skipped,
            commit: invocation.commit.clone(),
            branch: worktree.branch_or_detached().to_owned(),
            worktree: worktree.path_str(),
            started_at: ctx.now_iso(),
            duration_ms: 0,
            result: None,
            error: None,
            artifacts: Vec::new(),
            fingerprint: invocation.fingerprint.clone(),
            meta,
        }
    }

    fn terminal_receipt(
        &self,
        worktree: &Worktree,
        invocation: &Invocation,
        started_at: String,
        duration_ms: u64,
        result: Result<Value, JobError>,
    ) -> Receipt {
        let mut meta = Self::base_meta(invocation);
        let (status, result, error, artifacts) = match result {
            Ok(value) => {
                let artifacts = extract_artifacts(&value);
                (ReceiptStatus::Success, Some(value), None, artifacts)
            }
            Err(err) => {
                match &err {
                    JobError::Failed { stderr, .. } if !stderr.is_empty() => {
                        meta.insert("stderr".to_owned(), json!(stderr));
                    }
                    JobError::Timeout { limit_ms } => {
                        meta.insert("timedOut".to_owned(), json!(true));
                        meta.insert("timeoutMs".to_owned(), json!(limit_ms));
                    }
                    _ => {}
                }
                (ReceiptStatus::Error, None, Some(err.summary()), Vec::new())
            }
        };
        Receipt {
            id: Self::receipt_id(invocation),
            job_id: Some(invocation.job_id.clone()),
            event_id: invocation.event_id.clone(),
            status,
            commit: invocation.commit.clone(),
            branch: worktree.branch_or_detached().to_owned(),
            worktree: worktree.path_str(),
            started_at,
            duration_ms,
            result,
            error,
            artifacts,
            fingerprint: invocation.fingerprint.clone(),
            meta,
        }
    }
}

/// Jobs can declare artifacts by returning `{"artifacts": ["path", ...]}`;
/// the strings are lifted into the receipt's artifact list.
fn extract_artifacts(result: &Value) -> Vec<String> {
    result
        .get("artifacts")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
