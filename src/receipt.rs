//! The receipt ledger: execution outcomes as git notes.
//!
//! Every terminal invocation outcome becomes exactly one [`Receipt`],
//! serialized as canonical JSON and appended (one object per line) to the
//! triggering commit's note under the results ref. Notes are the
//! authoritative persistence mechanism — append-only, racing writers retry
//! on ref conflicts with a short exponential backoff, and readers tolerate
//! truncated trailing lines by skipping them with a counter.
//!
//! Reads are worktree-scoped: walk commits reachable from HEAD, newest
//! first, parse each note line, filter.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::git::{Git, GitError};
use crate::model::{CommitId, EventId, JobId, fingerprint};

/// Commit-walk bound for ledger reads.
const DEFAULT_COMMIT_WALK: usize = 1000;

/// Receipt bound for `get()` — "a bounded search over the most recent
/// receipts".
pub const DEFAULT_GET_BOUND: usize = 1000;

/// Default page size for `list()`.
pub const DEFAULT_LIST_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Receipt
// ---------------------------------------------------------------------------

/// Terminal status of an invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Error,
    Skipped,
}

impl std::fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Error => f.write_str("error"),
            Self::Skipped => f.write_str("skipped"),
        }
    }
}

/// One immutable execution receipt.
///
/// Field order is the canonical serialization order; absent optionals
/// serialize as explicit `null` so the on-ledger shape is stable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub id: String,
    pub job_id: Option<JobId>,
    pub event_id: Option<EventId>,
    pub status: ReceiptStatus,
    pub commit: CommitId,
    pub branch: String,
    pub worktree: String,
    /// RFC 3339 UTC.
    pub started_at: String,
    pub duration_ms: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub artifacts: Vec<String>,
    pub fingerprint: String,
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl Receipt {
    /// Serialize as one canonical JSON line.
    ///
    /// # Errors
    /// Serialization of a well-formed receipt cannot fail in practice; the
    /// error is propagated for completeness.
    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a ledger line.
    ///
    /// # Errors
    /// Fails on malformed or truncated lines; callers count and skip those.
    pub fn from_json(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Recompute the fingerprint from the receipt's identity-bearing fields
    /// and compare. The triggering payload lives in `meta.payload`, which
    /// makes verification self-contained.
    #[must_use]
    pub fn verify(&self) -> Verification {
        let Some(job_id) = &self.job_id else {
            return Verification::invalid("receipt has no jobId to verify against");
        };
        let Some(payload) = self.meta.get("payload") else {
            return Verification::invalid("receipt has no meta.payload");
        };
        let expected = fingerprint(
            job_id,
            &self.commit,
            std::path::Path::new(&self.worktree),
            payload,
        );
        if expected == self.fingerprint {
            Verification {
                valid: true,
                reason: None,
            }
        } else {
            Verification::invalid(format!(
                "fingerprint mismatch: recorded {}, recomputed {expected}",
                self.fingerprint
            ))
        }
    }

    /// `started_at` parsed back, when well-formed.
    #[must_use]
    pub fn started_at_time(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.started_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// The cron slot this receipt was fired for, when it came from the
    /// scheduler (`payload.scheduledFor`).
    #[must_use]
    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        self.meta
            .get("payload")
            .and_then(|p| p.get("scheduledFor"))
            .and_then(serde_json::Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Outcome of fingerprint verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub reason: Option<String>,
}

impl Verification {
    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Ledger query filter. All fields conjunctive.
#[derive(Clone, Debug, Default)]
pub struct ReceiptFilter {
    pub job_id: Option<JobId>,
    pub event_id: Option<EventId>,
    pub status: Option<ReceiptStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Max receipts returned; defaults to [`DEFAULT_LIST_LIMIT`].
    pub limit: Option<usize>,
}

impl ReceiptFilter {
    fn accepts(&self, receipt: &Receipt) -> bool {
        if let Some(job_id) = &self.job_id
            && receipt.job_id.as_ref() != Some(job_id)
        {
            return false;
        }
        if let Some(event_id) = &self.event_id
            && receipt.event_id.as_ref() != Some(event_id)
        {
            return false;
        }
        if let Some(status) = self.status
            && receipt.status != status
        {
            return false;
        }
        if self.since.is_some() || self.until.is_some() {
            let Some(t) = receipt.started_at_time() else {
                return false;
            };
            if let Some(since) = self.since
                && t < since
            {
                return false;
            }
            if let Some(until) = self.until
                && t > until
            {
                return false;
            }
        }
        true
    }
}

/// A page of receipts, newest-commit-first, plus the number of unparsable
/// lines skipped along the way.
#[derive(Clone, Debug, Default)]
pub struct ReceiptList {
    pub receipts: Vec<Receipt>,
    pub skipped_lines: usize,
}

/// Aggregate counts over a receipt window.
///
/// Rates are computed over the capped recent window, so they are biased
/// toward recent history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ReceiptStats {
    pub total: usize,
    pub success: usize,
    pub error: usize,
    pub skipped: usize,
    pub success_rate: f64,
}

// ---------------------------------------------------------------------------
// ReceiptStore
// ---------------------------------------------------------------------------

/// Errors from the receipt store.
#[derive(Debug)]
pub enum ReceiptError {
    Git(GitError),
    Serialize(serde_json::Error),
}

impl std::fmt::Display for ReceiptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Git(e) => write!(f, "receipt ledger git failure: {e}"),
            Self::Serialize(e) => write!(f, "failed to serialize receipt: {e}"),
        }
    }
}

impl std::error::Error for ReceiptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Git(e) => Some(e),
            Self::Serialize(e) => Some(e),
        }
    }
}

impl From<GitError> for ReceiptError {
    fn from(e: GitError) -> Self {
        Self::Git(e)
    }
}

impl From<serde_json::Error> for ReceiptError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialize(e)
    }
}

/// Append-only receipt persistence over one worktree's git handle.
#[derive(Debug)]
pub struct ReceiptStore<'a> {
    git: &'a Git,
    notes_ref: String,
}

impl<'a> ReceiptStore<'a> {
    #[must_use]
    pub fn new(git: &'a Git, notes_ref: impl Into<String>) -> Self {
        Self {
            git,
            notes_ref: notes_ref.into(),
        }
    }

    #[must_use]
    pub fn notes_ref(&self) -> &str {
        &self.notes_ref
    }

    /// Append a receipt to its commit's note.
    ///
    /// Concurrent appends from other processes can lose the notes-ref race;
    /// those conflicts are retried with a short exponential backoff before
    /// giving up.
    ///
    /// # Errors
    /// Serialization failures and non-transient git failures.
    pub fn append(&self, receipt: &Receipt) -> Result<(), ReceiptError> {
        let line = receipt.to_canonical_json()?;
        let policy = ExponentialBackoffBuilder::default()
            .with_initial_interval(Duration::from_millis(25))
            .with_max_elapsed_time(Some(Duration::from_secs(5)))
            .build();
        let op = || {
            self.git
                .note_append(&self.notes_ref, &receipt.commit, &line)
                .map_err(|e| {
                    if e.is_conflict() {
                        debug!(target: "gitvan::receipt", commit = %receipt.commit, "notes append conflict, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
        };
        backoff::retry(policy, op).map_err(|e| match e {
            backoff::Error::Permanent(err) | backoff::Error::Transient { err, .. } => {
                ReceiptError::Git(err)
            }
        })
    }

    /// All receipt lines already attached to one commit, parsed. Unparsable
    /// lines are skipped.
    ///
    /// # Errors
    /// Propagates git failures.
    pub fn for_commit(&self, commit: &CommitId) -> Result<Vec<Receipt>, ReceiptError> {
        let Some(note) = self.git.note_show(&self.notes_ref, commit)? else {
            return Ok(Vec::new());
        };
        Ok(note
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter_map(|l| Receipt::from_json(l).ok())
            .collect())
    }

    /// Fingerprints already recorded on one commit — the dedup set.
    ///
    /// # Errors
    /// Propagates git failures.
    pub fn fingerprints_for(&self, commit: &CommitId) -> Result<HashSet<String>, ReceiptError> {
        Ok(self
            .for_commit(commit)?
            .into_iter()
            .map(|r| r.fingerprint)
            .collect())
    }

    /// List receipts reachable from this worktree's HEAD, newest commit
    /// first, filtered.
    ///
    /// # Errors
    /// Propagates git failures.
    pub fn list(&self, filter: &ReceiptFilter) -> Result<ReceiptList, ReceiptError> {
        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let mut out = ReceiptList::default();
        for (_, lines) in self.git.log_with_notes(&self.notes_ref, DEFAULT_COMMIT_WALK)? {
            for line in lines {
                match Receipt::from_json(&line) {
                    Ok(receipt) => {
                        if filter.accepts(&receipt) {
                            out.receipts.push(receipt);
                            if out.receipts.len() >= limit {
                                return Ok(out);
                            }
                        }
                    }
                    Err(_) => out.skipped_lines += 1,
                }
            }
        }
        Ok(out)
    }

    /// Find a receipt by id, searching the most recent
    /// [`DEFAULT_GET_BOUND`] receipts.
    ///
    /// # Errors
    /// Propagates git failures.
    pub fn get(&self, id: &str) -> Result<Option<Receipt>, ReceiptError> {
        let page = self.list(&ReceiptFilter {
            limit: Some(DEFAULT_GET_BOUND),
            ..ReceiptFilter::default()
        })?;
        Ok(page.receipts.into_iter().find(|r| r.id == id))
    }

    /// The most recent scheduled receipt for an event or job — the cron
    /// dispatcher's `lastFire` source.
    ///
    /// # Errors
    /// Propagates git failures.
    pub fn latest_scheduled(
        &self,
        event_id: Option<&EventId>,
        job_id: &JobId,
    ) -> Result<Option<Receipt>, ReceiptError> {
        let filter = ReceiptFilter {
            event_id: event_id.cloned(),
            job_id: event_id.is_none().then(|| job_id.clone()),
            limit: Some(DEFAULT_GET_BOUND),
            ..ReceiptFilter::default()
        };
        Ok(self
            .list(&filter)?
            .receipts
            .into_iter()
            .filter(|r| r.scheduled_for().is_some())
            .max_by_key(Receipt::scheduled_for))
    }

    /// Aggregate counts over the most recent window.
    ///
    /// # Errors
    /// Propagates git failures.
    pub fn stats(&self, filter: &ReceiptFilter) -> Result<ReceiptStats, ReceiptError> {
        let page = self.list(filter)?;
        let mut stats = ReceiptStats {
            total: page.receipts.len(),
            ..ReceiptStats::default()
        };
        for r in &page.receipts {
            match r.status {
                ReceiptStatus::Success => stats.success += 1,
                ReceiptStatus::Error => stats.error += 1,
                ReceiptStatus::Skipped => stats.skipped += 1,
            }
        }
        let attempted = stats.success + stats.error;
        if attempted > 0 {
            #[allow(clippy::cast_precision_loss)]
            {
                stats.success_rate = stats.success as f64 / attempted as f64;
            }
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
