//! Named locks as atomically created git refs.
//!
//! Mutual exclusion per lock name within a repository rides on git's
//! per-ref update atomicity: whoever creates
//! `refs/gitvan/locks/<slug(name)>-<worktree-slug>-<short8(name)>` first
//! holds the lock. The ref's value is the HEAD commit at acquisition.
//! Acquisition is non-blocking — callers that want to wait implement their
//! own retry.
//!
//! The ref value alone cannot say *when* the lock was taken, so acquisition
//! metadata (`holder`, `acquiredAt`, `timeoutMs`) is appended as a sidecar
//! note on the locked commit. That makes TTL reclamation exact; when the
//! sidecar is missing (crashed writer), cleanup falls back to the pointed
//! commit's committer time, which is approximate but safe.
//!
//! A process crash after acquisition leaves a stale ref; [`LockManager::gc`]
//! recovers it by TTL, and collects locks whose worktree no longer exists.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::git::{Git, GitError};
use crate::model::{CommitId, Worktree};
use crate::refs;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A held lock, returned by a successful acquisition.
#[derive(Clone, Debug, PartialEq)]
pub struct Lock {
    pub name: String,
    pub ref_name: String,
    /// HEAD at acquisition — the ref's value.
    pub commit: CommitId,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// Sidecar metadata line attached to the locked commit.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockMeta {
    r#ref: String,
    holder: String,
    acquired_at: String,
    timeout_ms: u64,
}

/// One lock ref as seen by `list()`/`gc()`.
#[derive(Clone, Debug)]
pub struct LockInfo {
    pub ref_name: String,
    pub commit: CommitId,
    pub holder: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
}

/// What a cleanup pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub examined: usize,
    pub removed_stale: usize,
    pub removed_orphaned: usize,
}

/// Errors from the lock manager.
#[derive(Debug)]
pub enum LockError {
    Git(GitError),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Git(e) => write!(f, "lock ref operation failed: {e}"),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Git(e) => Some(e),
        }
    }
}

impl From<GitError> for LockError {
    fn from(e: GitError) -> Self {
        Self::Git(e)
    }
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

/// Acquires and releases named locks through one git handle.
#[derive(Debug)]
pub struct LockManager<'a> {
    git: &'a Git,
    prefix: String,
    timeout_ms: u64,
    holder: String,
}

impl<'a> LockManager<'a> {
    #[must_use]
    pub fn new(git: &'a Git, prefix: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            git,
            prefix: prefix.into(),
            timeout_ms,
            holder: format!("{}-{:08x}", std::process::id(), rand::random::<u32>()),
        }
    }

    /// This manager's holder id, recorded in sidecar metadata.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Try to take the named lock for a worktree. `Ok(None)` means someone
    /// else holds it — not an error.
    ///
    /// # Errors
    /// Fails only on git failures unrelated to losing the race.
    pub fn acquire(
        &self,
        name: &str,
        worktree: &Path,
        now: DateTime<Utc>,
    ) -> Result<Option<Lock>, LockError> {
        let ref_name = refs::lock_ref(&self.prefix, name, worktree);
        let head = self.git.head()?;
        if !self.git.update_ref_create_atomic(&ref_name, &head)? {
            debug!(target: "gitvan::lock", %ref_name, "lock held elsewhere");
            return Ok(None);
        }

        let lock = Lock {
            name: name.to_owned(),
            ref_name,
            commit: head,
            holder: self.holder.clone(),
            acquired_at: now,
        };

        // The sidecar is what makes TTL reclamation exact. Losing it (e.g.
        // a notes race that outlasts its retries) degrades cleanup to the
        // commit-time fallback, so a failure here is logged, not fatal.
        if let Err(e) = self.write_sidecar(&lock) {
            warn!(target: "gitvan::lock", ref_name = %lock.ref_name, error = %e,
                "failed to record lock metadata; TTL cleanup will approximate");
        }
        Ok(Some(lock))
    }

    fn write_sidecar(&self, lock: &Lock) -> Result<(), LockError> {
        let meta = LockMeta {
            r#ref: lock.ref_name.clone(),
            holder: lock.holder.clone(),
            acquired_at: lock.acquired_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            timeout_ms: self.timeout_ms,
        };
        let line = serde_json::to_string(&meta).unwrap_or_default();
        // one quick retry on a notes race; beyond that the fallback covers us
        for attempt in 0..2 {
            match self.git.note_append(refs::LOCK_META_REF, &lock.commit, &line) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() && attempt == 0 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Release a held lock. Idempotent: releasing twice (or a lock already
    /// collected by gc) returns `false` with no side effects.
    ///
    /// # Errors
    /// Propagates git failures.
    pub fn release(&self, lock: &Lock) -> Result<bool, LockError> {
        Ok(self.git.update_ref_delete(&lock.ref_name)?)
    }

    /// Release by name, without a [`Lock`] in hand.
    ///
    /// # Errors
    /// Propagates git failures.
    pub fn release_named(&self, name: &str, worktree: &Path) -> Result<bool, LockError> {
        let ref_name = refs::lock_ref(&self.prefix, name, worktree);
        Ok(self.git.update_ref_delete(&ref_name)?)
    }

    /// Serialize work by lock name: acquire, run `f`, release on every exit
    /// path. `Ok(None)` means the lock was held and `f` never ran.
    ///
    /// # Errors
    /// Lock infrastructure failures only; `f`'s own result passes through.
    pub fn run_with_lock<T>(
        &self,
        name: &str,
        worktree: &Path,
        now: DateTime<Utc>,
        f: impl FnOnce() -> T,
    ) -> Result<Option<T>, LockError> {
        let Some(lock) = self.acquire(name, worktree, now)? else {
            return Ok(None);
        };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
        let released = self.release(&lock);
        match result {
            Ok(value) => {
                released?;
                Ok(Some(value))
            }
            Err(panic) => {
                // release already happened; let the panic keep propagating
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// All lock refs under the prefix, with whatever metadata the sidecar
    /// still has for them.
    ///
    /// # Errors
    /// Propagates git failures.
    pub fn list(&self) -> Result<Vec<LockInfo>, LockError> {
        let pattern = format!("{}/*", self.prefix.trim_end_matches('/'));
        let mut out = Vec::new();
        for (ref_name, commit) in self.git.for_each_ref(&pattern)? {
            let meta = self.read_sidecar(&ref_name, &commit)?;
            out.push(LockInfo {
                acquired_at: meta
                    .as_ref()
                    .and_then(|m| DateTime::parse_from_rfc3339(&m.acquired_at).ok())
                    .map(|t| t.with_timezone(&Utc)),
                holder: meta.map(|m| m.holder),
                ref_name,
                commit,
            });
        }
        Ok(out)
    }

    fn read_sidecar(
        &self,
        ref_name: &str,
        commit: &CommitId,
    ) -> Result<Option<LockMeta>, LockError> {
        let Some(note) = self.git.note_show(refs::LOCK_META_REF, commit)? else {
            return Ok(None);
        };
        // last matching line wins — re-acquisitions append
        Ok(note
            .lines()
            .rev()
            .filter_map(|l| serde_json::from_str::<LockMeta>(l.trim()).ok())
            .find(|m| m.r#ref == ref_name))
    }

    /// Collect stale locks (acquired longer than `timeout_ms` ago) and
    /// orphans (worktree no longer enumerated).
    ///
    /// # Errors
    /// Propagates git failures; a ref that vanishes mid-pass is fine.
    pub fn gc(&self, live: &[Worktree], now: DateTime<Utc>) -> Result<GcReport, LockError> {
        let live_slugs: Vec<String> = live.iter().map(|w| refs::worktree_slug(&w.path)).collect();
        let mut report = GcReport::default();

        for info in self.list()? {
            report.examined += 1;
            if self.is_orphan(&info.ref_name, &live_slugs) {
                if self.git.update_ref_delete(&info.ref_name)? {
                    debug!(target: "gitvan::lock", ref_name = %info.ref_name, "collected orphaned lock");
                    report.removed_orphaned += 1;
                }
                continue;
            }
            let acquired_at = match info.acquired_at {
                Some(t) => Some(t),
                None => self.git.commit_time(&info.commit).ok(),
            };
            let stale = acquired_at.is_some_and(|t| {
                now.signed_duration_since(t)
                    .num_milliseconds()
                    .try_into()
                    .map(|elapsed: u64| elapsed > self.timeout_ms)
                    .unwrap_or(false)
            });
            if stale && self.git.update_ref_delete(&info.ref_name)? {
                debug!(target: "gitvan::lock", ref_name = %info.ref_name, "collected stale lock");
                report.removed_stale += 1;
            }
        }
        Ok(report)
    }

    /// Whether a lock ref belongs to none of the live worktrees.
    ///
    /// The ref basename is `<slug(name)>-<worktree-slug>-<short8(name)>`;
    /// stripping the trailing hash leaves something that ends with the
    /// worktree slug.
    fn is_orphan(&self, ref_name: &str, live_slugs: &[String]) -> bool {
        let Some(basename) = ref_name.rsplit('/').next() else {
            return false;
        };
        let Some(without_hash) = basename.rfind('-').map(|i| &basename[..i]) else {
            return false;
        };
        !live_slugs
            .iter()
            .any(|slug| without_hash.ends_with(&format!("-{slug}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn repo() -> (TempDir, Git) {
        let dir = TempDir::new().unwrap();
        let git = Git::new(dir.path());
        git.run(&["init"]).unwrap();
        git.run(&["config", "user.name", "Test"]).unwrap();
        git.run(&["config", "user.email", "test@localhost"]).unwrap();
        git.run(&["config", "commit.gpgsign", "false"]).unwrap();
        git.run(&["checkout", "-B", "main"]).unwrap();
        fs::write(dir.path().join("f"), "x").unwrap();
        git.run(&["add", "-A"]).unwrap();
        git.run(&["commit", "-m", "initial"]).unwrap();
        (dir, git)
    }

    fn worktree_of(git: &Git) -> Worktree {
        Worktree {
            path: git.workdir().to_path_buf(),
            head: git.head().unwrap(),
            branch: Some("main".to_owned()),
            is_main: true,
        }
    }

    #[test]
    fn acquire_then_contend() {
        let (_dir, git) = repo();
        let locks = LockManager::new(&git, refs::LOCK_PREFIX, 30_000);
        let wt = git.workdir().to_path_buf();

        let lock = locks.acquire("job-build", &wt, Utc::now()).unwrap().unwrap();
        assert_eq!(lock.commit, git.head().unwrap());
        assert!(locks.acquire("job-build", &wt, Utc::now()).unwrap().is_none());

        // a different name is independent
        assert!(locks.acquire("job-test", &wt, Utc::now()).unwrap().is_some());
    }

    #[test]
    fn release_is_idempotent() {
        let (_dir, git) = repo();
        let locks = LockManager::new(&git, refs::LOCK_PREFIX, 30_000);
        let wt = git.workdir().to_path_buf();

        let lock = locks.acquire("once", &wt, Utc::now()).unwrap().unwrap();
        assert!(locks.release(&lock).unwrap());
        assert!(!locks.release(&lock).unwrap());
        // and it can be taken again
        assert!(locks.acquire("once", &wt, Utc::now()).unwrap().is_some());
    }

    #[test]
    fn sidecar_metadata_is_recorded() {
        let (_dir, git) = repo();
        let locks = LockManager::new(&git, refs::LOCK_PREFIX, 30_000);
        let wt = git.workdir().to_path_buf();

        let lock = locks.acquire("meta-check", &wt, Utc::now()).unwrap().unwrap();
        let infos = locks.list().unwrap();
        let info = infos.iter().find(|i| i.ref_name == lock.ref_name).unwrap();
        assert_eq!(info.holder.as_deref(), Some(locks.holder()));
        assert!(info.acquired_at.is_some());
    }

    #[test]
    fn gc_collects_stale_locks() {
        let (_dir, git) = repo();
        // timeout 0: everything is instantly stale
        let locks = LockManager::new(&git, refs::LOCK_PREFIX, 0);
        let wt = worktree_of(&git);

        let past = Utc::now() - chrono::Duration::seconds(60);
        locks.acquire("stale-one", &wt.path, past).unwrap().unwrap();
        let report = locks.gc(std::slice::from_ref(&wt), Utc::now()).unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.removed_stale, 1);
        assert!(locks.list().unwrap().is_empty());
    }

    #[test]
    fn gc_keeps_fresh_locks() {
        let (_dir, git) = repo();
        let locks = LockManager::new(&git, refs::LOCK_PREFIX, 60_000);
        let wt = worktree_of(&git);

        locks.acquire("fresh", &wt.path, Utc::now()).unwrap().unwrap();
        let report = locks.gc(std::slice::from_ref(&wt), Utc::now()).unwrap();
        assert_eq!(report.removed_stale, 0);
        assert_eq!(locks.list().unwrap().len(), 1);
    }

    #[test]
    fn run_with_lock_serializes_by_name() {
        let (_dir, git) = repo();
        let locks = LockManager::new(&git, refs::LOCK_PREFIX, 30_000);
        let other = LockManager::new(&git, refs::LOCK_PREFIX, 30_000);
        let wt = git.workdir().to_path_buf();

        let ran = locks
            .run_with_lock("serial", &wt, Utc::now(), || 42)
            .unwrap();
        assert_eq!(ran, Some(42));
        // released on exit: a second manager can enter
        let ran = other
            .run_with_lock("serial", &wt, Utc::now(), || 7)
            .unwrap();
        assert_eq!(ran, Some(7));

        // while held, nobody else runs
        let held = locks.acquire("serial", &wt, Utc::now()).unwrap().unwrap();
        let blocked = other
            .run_with_lock("serial", &wt, Utc::now(), || 0)
            .unwrap();
        assert_eq!(blocked, None);
        locks.release(&held).unwrap();
    }

    #[test]
    fn gc_collects_orphaned_worktree_locks() {
        let (_dir, git) = repo();
        let locks = LockManager::new(&git, refs::LOCK_PREFIX, 3_600_000);
        let gone = std::path::PathBuf::from("/worktrees/removed");

        locks.acquire("orphan", &gone, Utc::now()).unwrap().unwrap();
        // live list does not contain the worktree the lock was taken for
        let report = locks.gc(&[worktree_of(&git)], Utc::now()).unwrap();
        assert_eq!(report.removed_orphaned, 1);
        assert!(locks.list().unwrap().is_empty());
    }
}
